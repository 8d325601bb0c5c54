//! Prelude module for common re-exports.
//!
//! ```rust
//! use cfa_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    AttestationConfig, BackoffConfig, ConfigError, ConfigLoader, ConsumerConfig, LogLevel,
    ProducerConfig, RegionConfig, SharedConfig,
};

// ─── Region Layout ──────────────────────────────────────────────────
pub use crate::shm::batch::Batch;
pub use crate::shm::consts::{BATCH_CAPACITY, DEFAULT_RING_CAPACITY, DIGEST_SIZE};
pub use crate::shm::layout::{ControlFlowRecord, RegionState};
