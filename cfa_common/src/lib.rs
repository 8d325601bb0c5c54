//! CFA Common Library
//!
//! Types and constants shared by every participant of a control-flow
//! attestation session: the untrusted producer that emits control-flow
//! records, the trusted consumer that folds them into a hash chain, and the
//! daemon that wires both together.
//!
//! # Module Structure
//!
//! - [`shm`] - Bit-stable shared region layout, batch type and constants
//! - [`config`] - Configuration loading traits and types
//! - [`logging`] - Tracing subscriber setup
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! cfa_common = { path = "../cfa_common" }
//! ```
//!
//! ```rust
//! use cfa_common::shm::layout::ControlFlowRecord;
//! use cfa_common::config::{AttestationConfig, ConfigLoader};
//! ```

pub mod config;
pub mod logging;
pub mod prelude;
pub mod shm;
