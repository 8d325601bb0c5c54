//! # CFA Daemon
//!
//! Process-level glue around [`cfa_pipeline`]: configuration loading, the
//! trusted consumer loop and a synthetic producer used to exercise a running
//! session.

pub mod consumer;
pub mod error;
pub mod producer;

pub use consumer::{ConsumerLoop, LoopSummary};
pub use error::{DaemonError, DaemonResult};
pub use producer::{ProduceReport, run_synthetic};

use cfa_common::config::{AttestationConfig, ConfigLoader};
use std::path::Path;

/// Load and validate the daemon configuration.
pub fn load_config(path: &Path) -> DaemonResult<AttestationConfig> {
    let config = AttestationConfig::load(path)?;
    config.validate()?;
    Ok(config)
}
