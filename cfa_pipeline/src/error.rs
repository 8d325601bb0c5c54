//! Error types for pipeline operations

use cfa_common::shm::layout::LayoutError;
use thiserror::Error;

/// Errors that can occur while moving or attesting control-flow records
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Not enough free slots for the batch; nothing was written
    #[error("Ring full: {requested} records requested, {free} free")]
    Full {
        /// Records in the rejected batch
        requested: u32,
        /// Free slots at the time of the attempt
        free: u32,
    },

    /// No published records
    #[error("Ring empty")]
    Empty,

    /// Recomputed chain digest disagrees with the stored one
    #[error("Integrity violation at record {at_index}")]
    IntegrityViolation {
        /// Index of the first bad record, relative to the checked range
        at_index: usize,
    },

    /// Shared baseline was replaced behind this consumer's back
    #[error("Baseline generation changed: expected {expected}, found {found}")]
    BaselineChanged {
        /// Generation the chain was started from
        expected: u32,
        /// Generation currently in the region
        found: u32,
    },

    /// Malformed batch size, capacity or name; rejected without side effects
    #[error("Bad parameters: {reason}")]
    BadParameters {
        /// What was wrong
        reason: String,
    },

    /// Region allocation, mapping or seeding failed
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted {
        /// Underlying failure
        reason: String,
    },

    /// Session region does not exist
    #[error("Session not found: {name}")]
    NotFound {
        /// Session name
        name: String,
    },

    /// Creator never finished initialising the region
    #[error("Session not initialised: {name}")]
    NotInitialized {
        /// Session name
        name: String,
    },

    /// Region header is not a compatible layout
    #[error("Layout mismatch: {reason}")]
    LayoutMismatch {
        /// Validation failure
        reason: String,
    },

    /// Session is shutting down
    #[error("Session closed")]
    Closed,

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl PipelineError {
    /// Conditions the caller handles locally (retry, back off, drop and count).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Full { .. } | Self::Empty)
    }

    /// Conditions after which the attested chain can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IntegrityViolation { .. } | Self::BaselineChanged { .. }
        )
    }
}

impl From<LayoutError> for PipelineError {
    fn from(err: LayoutError) -> Self {
        match err {
            LayoutError::InvalidCapacity { .. } => Self::BadParameters {
                reason: err.to_string(),
            },
            other => Self::LayoutMismatch {
                reason: other.to_string(),
            },
        }
    }
}

impl From<crate::chain::IntegrityViolation> for PipelineError {
    fn from(violation: crate::chain::IntegrityViolation) -> Self {
        Self::IntegrityViolation {
            at_index: violation.at_index,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(PipelineError::Empty.is_transient());
        assert!(
            PipelineError::Full {
                requested: 2,
                free: 1
            }
            .is_transient()
        );
        assert!(PipelineError::IntegrityViolation { at_index: 0 }.is_fatal());
        assert!(
            PipelineError::BaselineChanged {
                expected: 1,
                found: 2
            }
            .is_fatal()
        );
        assert!(!PipelineError::Closed.is_transient());
        assert!(!PipelineError::Closed.is_fatal());
    }

    #[test]
    fn layout_errors_map_by_kind() {
        let capacity: PipelineError = LayoutError::InvalidCapacity { capacity: 1 }.into();
        assert!(matches!(capacity, PipelineError::BadParameters { .. }));

        let magic: PipelineError = LayoutError::BadMagic.into();
        assert!(matches!(magic, PipelineError::LayoutMismatch { .. }));
    }
}
