//! Error types for the attestation daemon
//!
//! Wraps configuration and pipeline failures and adds the daemon's own exits.

use cfa_common::config::ConfigError;
use cfa_pipeline::PipelineError;
use thiserror::Error;

/// Daemon-level failures.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline operation failed
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Integrity violation with `halt_on_violation` set
    #[error("control-flow chain broken at record {at_index}, consumer halted")]
    Halted {
        /// Offending record, counted from the oldest unretired one
        at_index: usize,
    },

    /// Blocking consumer task panicked or was cancelled
    #[error("consumer task failed: {0}")]
    Task(String),
}

/// Result alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_pass_through_unchanged() {
        let err = DaemonError::from(PipelineError::Closed);
        assert_eq!(err.to_string(), PipelineError::Closed.to_string());
    }

    #[test]
    fn halted_names_the_record() {
        let err = DaemonError::Halted { at_index: 3 };
        assert!(err.to_string().contains("record 3"));
    }
}
