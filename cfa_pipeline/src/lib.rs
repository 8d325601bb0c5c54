//! # CFA Control-Flow Event Pipeline
//!
//! Moves control-flow records from an untrusted, instrumented program into a
//! trusted consumer that commits them to a SHA-256 hash chain and verifies the
//! chain before releasing ring space.
//!
//! ## Architecture Overview
//!
//! ```text
//!  untrusted                          shared region                       trusted
//! ┌──────────────┐   enqueue   ┌─────────────────────────┐   available   ┌────────────────────┐
//! │ Batcher      ├────────────►│ RingBufferControl       ├──────────────►│ AttestationEngine  │
//! │ (per thread) │             │ HashBaseline            │    retire     │  ChainAccumulator  │
//! └──────────────┘             │ ControlFlowRecord × cap │◄──────────────┤  ChainVerifier     │
//!                              └─────────────────────────┘               └────────────────────┘
//! ```
//!
//! - [`region::SharedRegion`] owns the mapping and is the only code touching
//!   raw memory.
//! - [`ring::RingBuffer`] publishes and retires records under a shared
//!   [`lock::ShmMutex`] with a configurable spin-then-block
//!   [`lock::BackoffPolicy`].
//! - [`batcher::Batcher`] collects records per producer context and never
//!   blocks on a full ring; it drops and counts instead.
//! - [`engine::AttestationEngine`] folds records into the chain, verifies the
//!   unretired range and retires the verified prefix.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cfa_pipeline::{AttestationEngine, BackoffPolicy, Batcher, SharedRegion};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), cfa_pipeline::PipelineError> {
//! let region = Arc::new(SharedRegion::open("session", 1024)?);
//! let engine = Arc::new(AttestationEngine::attach(Arc::clone(&region), BackoffPolicy::default())?);
//!
//! let mut batcher = Batcher::new(Arc::clone(&engine), 0);
//! batcher.record(0x10, 0x4f0)?;
//! batcher.flush()?;
//!
//! let retired = engine.process_available()?;
//! println!("retired {retired}, tip at {:?}", engine.quote());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! `Full` and `Empty` are transient and handled by the caller's policy.
//! `IntegrityViolation` is latched by the engine and surfaced on every call
//! until an explicit re-baseline.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod baseline;
pub mod batcher;
pub mod chain;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod lock;
pub mod platform;
pub mod region;
pub mod ring;

pub use baseline::{BaselineGuard, BaselineManager, BaselineSnapshot, fresh_seed};
pub use batcher::{BatchSink, Batcher, BatcherStats};
pub use chain::{
    ChainAccumulator, ChainVerifier, Digest, IntegrityViolation, ZERO_DIGEST, accumulate,
    chain_digest, digest_hex, verify,
};
pub use discovery::{SessionInfo, list_sessions};
pub use engine::{AttestationEngine, ChainQuote, EngineStats};
pub use error::{PipelineError, PipelineResult};
pub use lock::{BackoffPolicy, ShmMutex, ShmMutexGuard};
pub use region::SharedRegion;
pub use ring::{BatchView, Published, RingBuffer, RingStats};
