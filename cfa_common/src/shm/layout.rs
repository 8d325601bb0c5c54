//! Bit-stable shared region layout.
//!
//! A session region is one contiguous mapping shared by every producer and
//! the trusted consumer:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐  offset 0
//! │  RingBufferControl (64 bytes, cache-line aligned)        │
//! ├──────────────────────────────────────────────────────────┤  offset 64
//! │  HashBaseline (64 bytes, cache-line aligned)             │
//! ├──────────────────────────────────────────────────────────┤  offset 128
//! │  ControlFlowRecord × capacity (48 bytes each)            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Index protocol
//!
//! `head` is the next slot the producer writes, `tail` the next slot the
//! consumer retires. The ring is empty when `head == tail` and full when
//! `(head + 1) % capacity == tail`, so at most `capacity - 1` records are
//! live at any time. Slots in `[tail, head)` are published and must not be
//! written by a producer until the consumer retires them.
//!
//! All atomics are accessed through the handle types in `cfa_pipeline`; the
//! plain fields are written once by the creator before `INITIALIZED` is
//! published with release ordering.

use crate::shm::consts::{CACHE_LINE_SIZE, DIGEST_SIZE, MAX_RING_CAPACITY, MIN_RING_CAPACITY};
use bitflags::bitflags;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

/// Magic bytes identifying a session region: `"CFA_RNG\0"`.
pub const REGION_MAGIC: [u8; 8] = *b"CFA_RNG\0";

/// Layout revision. Bumped whenever any block below changes shape.
pub const LAYOUT_VERSION: u32 = 1;

/// Byte offset of the ring control block.
pub const CONTROL_OFFSET: usize = 0;

/// Byte offset of the hash baseline block.
pub const BASELINE_OFFSET: usize = CONTROL_OFFSET + core::mem::size_of::<RingBufferControl>();

/// Byte offset of the first record slot.
pub const RECORDS_OFFSET: usize = BASELINE_OFFSET + core::mem::size_of::<HashBaseline>();

/// One observed indirect control-flow transfer.
///
/// `target_offset` is relative to the base of the module containing the
/// target so that the chain survives address-space layout randomisation.
/// `digest` is written by the trusted accumulator and is meaningless until
/// then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(8))]
pub struct ControlFlowRecord {
    /// Identity of the originating basic block or function.
    pub source_id: u64,
    /// Transfer target relative to its module base.
    pub target_offset: u64,
    /// Chain digest committed for this record.
    pub digest: [u8; DIGEST_SIZE],
}

const_assert_eq!(core::mem::size_of::<ControlFlowRecord>(), 48);
const_assert_eq!(core::mem::align_of::<ControlFlowRecord>(), 8);

impl ControlFlowRecord {
    /// Create a record with an unset digest.
    #[inline]
    pub const fn new(source_id: u64, target_offset: u64) -> Self {
        Self {
            source_id,
            target_offset,
            digest: [0u8; DIGEST_SIZE],
        }
    }
}

bitflags! {
    /// Session-wide state bits stored in `RingBufferControl::state`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionState: u32 {
        /// Creator finished initialising the region.
        const INITIALIZED = 1 << 0;
        /// An integrity violation was detected and latched.
        const CHAIN_BROKEN = 1 << 1;
        /// The session is shutting down; producers should stop.
        const CLOSED = 1 << 2;
        /// A trusted consumer is bound to the region.
        const CONSUMER_ATTACHED = 1 << 3;
    }
}

/// Ring control block - 64 bytes, cache-line aligned.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct RingBufferControl {
    /// Magic bytes: must be `REGION_MAGIC`.
    pub magic: [u8; 8],
    /// Layout revision written by the creator.
    pub layout_version: u32,
    /// Number of record slots. Fixed for the region's lifetime.
    pub capacity: u32,
    /// Next slot the producer writes.
    pub head: AtomicU32,
    /// Next slot the consumer retires.
    pub tail: AtomicU32,
    /// Shared mutex word guarding `head`, `tail` and slot writes.
    pub lock: AtomicU32,
    /// Publish sequence, stepped by 2 on every enqueue and waited on by the
    /// consumer. Bit 0 is set while a consumer may be asleep on the word.
    pub data_ready: AtomicU32,
    /// `RegionState` bits.
    pub state: AtomicU32,
    /// Process id of the creator.
    pub creator_pid: u32,
    /// Records published since creation.
    pub published_total: AtomicU64,
    /// Records retired since creation.
    pub retired_total: AtomicU64,
    /// Records dropped by producers or discarded by a re-baseline.
    pub dropped_total: AtomicU64,
}

const_assert_eq!(core::mem::size_of::<RingBufferControl>(), CACHE_LINE_SIZE);
const_assert_eq!(core::mem::align_of::<RingBufferControl>(), CACHE_LINE_SIZE);

/// Hash baseline block - 64 bytes, cache-line aligned.
///
/// `initial_digest` is the genesis value of the chain. It is only read or
/// replaced while `locked` is held.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct HashBaseline {
    /// Chain genesis digest.
    pub initial_digest: [u8; DIGEST_SIZE],
    /// Incremented each time the baseline is replaced. Starts at 1.
    pub generation: AtomicU32,
    /// Shared mutex word; nonzero while a chain computation holds it.
    pub locked: AtomicU32,
    /// Reserved for future use.
    pub _reserved: [u8; 24],
}

const_assert_eq!(core::mem::size_of::<HashBaseline>(), CACHE_LINE_SIZE);
const_assert_eq!(core::mem::align_of::<HashBaseline>(), CACHE_LINE_SIZE);
const_assert_eq!(RECORDS_OFFSET % 8, 0);

/// Errors raised while validating a mapped region.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// Capacity outside `MIN_RING_CAPACITY..=MAX_RING_CAPACITY`.
    #[error(
        "invalid ring capacity {capacity} (must be {min}..={max})",
        min = MIN_RING_CAPACITY,
        max = MAX_RING_CAPACITY
    )]
    InvalidCapacity {
        /// Requested capacity.
        capacity: u32,
    },

    /// Magic bytes do not identify a session region.
    #[error("bad region magic")]
    BadMagic,

    /// Region was written by an incompatible layout revision.
    #[error("unsupported layout version {found} (expected {expected})", expected = LAYOUT_VERSION)]
    UnsupportedVersion {
        /// Version found in the control block.
        found: u32,
    },

    /// Mapped length disagrees with the capacity in the control block.
    #[error("region is {found} bytes, capacity requires {expected}")]
    SizeMismatch {
        /// Bytes required by the recorded capacity.
        expected: usize,
        /// Bytes actually mapped.
        found: usize,
    },
}

/// Check a ring capacity against the supported bounds.
pub fn validate_capacity(capacity: u32) -> Result<(), LayoutError> {
    if !(MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&capacity) {
        return Err(LayoutError::InvalidCapacity { capacity });
    }
    Ok(())
}

/// Total bytes needed for a region with `capacity` record slots.
#[inline]
pub const fn region_size(capacity: u32) -> usize {
    RECORDS_OFFSET + capacity as usize * core::mem::size_of::<ControlFlowRecord>()
}

/// Number of live (published, unretired) records.
#[inline]
pub const fn ring_live(head: u32, tail: u32, capacity: u32) -> u32 {
    (head + capacity - tail) % capacity
}

/// Number of records that can still be published.
#[inline]
pub const fn ring_free(head: u32, tail: u32, capacity: u32) -> u32 {
    capacity - 1 - ring_live(head, tail, capacity)
}

/// Advance a ring index by `n` slots.
#[inline]
pub const fn ring_advance(index: u32, n: u32, capacity: u32) -> u32 {
    ((index as u64 + n as u64) % capacity as u64) as u32
}

impl RingBufferControl {
    /// Initialise a freshly mapped, zero-filled control block.
    ///
    /// `state` is left at zero; the caller publishes `INITIALIZED` once the
    /// baseline is seeded as well.
    pub fn init(&mut self, capacity: u32, creator_pid: u32) {
        self.magic = REGION_MAGIC;
        self.layout_version = LAYOUT_VERSION;
        self.capacity = capacity;
        self.head = AtomicU32::new(0);
        self.tail = AtomicU32::new(0);
        self.lock = AtomicU32::new(0);
        self.data_ready = AtomicU32::new(0);
        self.state = AtomicU32::new(0);
        self.creator_pid = creator_pid;
        self.published_total = AtomicU64::new(0);
        self.retired_total = AtomicU64::new(0);
        self.dropped_total = AtomicU64::new(0);
    }

    /// Validate the header of an attached region and return its capacity.
    pub fn validate(&self, mapped_len: usize) -> Result<u32, LayoutError> {
        if self.magic != REGION_MAGIC {
            return Err(LayoutError::BadMagic);
        }
        if self.layout_version != LAYOUT_VERSION {
            return Err(LayoutError::UnsupportedVersion {
                found: self.layout_version,
            });
        }
        validate_capacity(self.capacity)?;
        let expected = region_size(self.capacity);
        if mapped_len < expected {
            return Err(LayoutError::SizeMismatch {
                expected,
                found: mapped_len,
            });
        }
        Ok(self.capacity)
    }

    /// Current state bits (acquire).
    #[inline]
    pub fn state(&self) -> RegionState {
        RegionState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Set state bits, returning the previous state.
    #[inline]
    pub fn insert_state(&self, flags: RegionState) -> RegionState {
        RegionState::from_bits_truncate(self.state.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear state bits, returning the previous state.
    #[inline]
    pub fn remove_state(&self, flags: RegionState) -> RegionState {
        RegionState::from_bits_truncate(self.state.fetch_and(!flags.bits(), Ordering::AcqRel))
    }
}

impl HashBaseline {
    /// Initialise a freshly mapped baseline with its genesis digest.
    pub fn init(&mut self, seed: [u8; DIGEST_SIZE]) {
        self.initial_digest = seed;
        self.generation = AtomicU32::new(1);
        self.locked = AtomicU32::new(0);
        self._reserved = [0u8; 24];
    }
}
