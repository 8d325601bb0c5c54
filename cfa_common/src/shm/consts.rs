//! SHM (Shared Memory) constants.
//!
//! These constants define the fundamental parameters of an attestation
//! session region. They are the single source of truth - all other crates
//! should import from here.

/// Size of a SHA-256 digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Maximum number of records a producer accumulates before flushing.
pub const BATCH_CAPACITY: usize = 8;

/// Smallest ring capacity (in record slots). One slot always stays empty
/// to tell a full ring from an empty one, so two slots hold one record.
pub const MIN_RING_CAPACITY: u32 = 2;

/// Largest ring capacity (in record slots).
pub const MAX_RING_CAPACITY: u32 = 1 << 20;

/// Default ring capacity (in record slots).
pub const DEFAULT_RING_CAPACITY: u32 = 1024;

/// CPU cache line size in bytes.
///
/// Both control blocks are padded to this size so the producer-written
/// indices and the baseline never share a line with record data.
pub const CACHE_LINE_SIZE: usize = 64;

/// Directory holding named session regions.
pub const SHM_DIR: &str = "/dev/shm";

/// File name prefix for session regions and their metadata.
pub const SEGMENT_PREFIX: &str = "cfa_";

/// File extension of session metadata files.
pub const METADATA_SUFFIX: &str = ".meta";
