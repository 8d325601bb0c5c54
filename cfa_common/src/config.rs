//! Configuration loading traits and types.
//!
//! Every CFA process reads one TOML file. The `[shared]` table is required;
//! the remaining tables fall back to defaults that work for a single
//! producer/consumer pair on one host.
//!
//! # Usage
//!
//! ```rust,no_run
//! use cfa_common::config::{AttestationConfig, ConfigError, ConfigLoader};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = AttestationConfig::load(Path::new("config/cfa.toml"))?;
//!     config.validate()?;
//!     println!("Region: {} ({} slots)", config.region.name, config.region.capacity);
//!     Ok(())
//! }
//! ```

use crate::shm::consts::{DEFAULT_RING_CAPACITY, MAX_RING_CAPACITY, MIN_RING_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-record tracing.
    Trace,
    /// Per-batch events.
    Debug,
    /// Session lifecycle.
    #[default]
    Info,
    /// Dropped records, re-baselines.
    Warn,
    /// Integrity violations and fatal errors only.
    Error,
}

/// Fields shared by every CFA process.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "cfa-verifier"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Process instance identifier, used in log lines.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the shared section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session region parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Session name; the region lives at `/dev/shm/cfa_<name>`.
    pub name: String,
    /// Ring capacity in record slots.
    pub capacity: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

/// Lock and wait backoff: spin, then yield, then (optionally) sleep on a
/// futex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Busy-wait iterations before yielding.
    pub spin_limit: u32,
    /// `sched_yield` iterations before blocking.
    pub yield_limit: u32,
    /// Sleep on a futex once spinning and yielding are exhausted.
    pub block: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            spin_limit: 128,
            yield_limit: 16,
            block: true,
        }
    }
}

/// Trusted consumer loop parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Longest wait for new data before re-checking shutdown.
    pub wait_timeout_ms: u64,
    /// Interval between statistics log lines.
    pub stats_interval_s: u64,
    /// Stop the consumer on an integrity violation instead of re-baselining.
    pub halt_on_violation: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 100,
            stats_interval_s: 5,
            halt_on_violation: true,
        }
    }
}

/// Untrusted producer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProducerConfig {
    /// Extra enqueue attempts on a full ring before a batch is dropped.
    pub retry_limit: u32,
}

/// Complete configuration of a CFA process.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "cfa-verifier"
///
/// [region]
/// name = "session"
/// capacity = 1024
///
/// [consumer]
/// halt_on_violation = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    /// Shared fields.
    pub shared: SharedConfig,
    /// Session region.
    #[serde(default)]
    pub region: RegionConfig,
    /// Lock/wait backoff policy.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Trusted consumer loop.
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Untrusted producer.
    #[serde(default)]
    pub producer: ProducerConfig,
}

impl AttestationConfig {
    /// Validate all sections.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `service_name` or `region.name` is empty
    /// - `region.name` contains a path separator
    /// - `region.capacity` is outside the supported ring bounds
    /// - `consumer.wait_timeout_ms` or `consumer.stats_interval_s` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        if self.region.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "region.name cannot be empty".to_string(),
            ));
        }
        if self.region.name.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "region.name '{}' must not contain '/'",
                self.region.name
            )));
        }
        if !(MIN_RING_CAPACITY..=MAX_RING_CAPACITY).contains(&self.region.capacity) {
            return Err(ConfigError::ValidationError(format!(
                "region.capacity {} outside {}..={}",
                self.region.capacity, MIN_RING_CAPACITY, MAX_RING_CAPACITY
            )));
        }
        if self.consumer.wait_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.wait_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.consumer.stats_interval_s == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.stats_interval_s must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if the file is unreadable or the TOML
///   does not match the target type
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Any serde-deserializable struct can be loaded.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
