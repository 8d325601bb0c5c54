//! Config file loading tests.
//!
//! Exercises `ConfigLoader::load` against real files: defaults for omitted
//! tables, missing files, malformed TOML and validation of loaded values.

use cfa_common::config::{AttestationConfig, ConfigError, ConfigLoader, LogLevel};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write `content` as `cfa.toml` in `dir` and return its path.
fn write_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("cfa.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn load_full_config() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        r#"
[shared]
log_level = "debug"
service_name = "cfa-test"

[region]
name = "unit"
capacity = 256

[backoff]
spin_limit = 8
yield_limit = 2
block = false

[consumer]
wait_timeout_ms = 20
stats_interval_s = 1
halt_on_violation = false

[producer]
retry_limit = 3
"#,
    );

    let config = AttestationConfig::load(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.shared.log_level, LogLevel::Debug);
    assert_eq!(config.shared.service_name, "cfa-test");
    assert_eq!(config.region.name, "unit");
    assert_eq!(config.region.capacity, 256);
    assert_eq!(config.backoff.spin_limit, 8);
    assert!(!config.backoff.block);
    assert_eq!(config.consumer.wait_timeout_ms, 20);
    assert!(!config.consumer.halt_on_violation);
    assert_eq!(config.producer.retry_limit, 3);
}

#[test]
fn load_minimal_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(tmp.path(), "[shared]\nservice_name = \"cfa\"\n");

    let config = AttestationConfig::load(&path).unwrap();
    assert_eq!(config.shared.log_level, LogLevel::Info);
    assert_eq!(config.region.name, "session");
    assert_eq!(config.region.capacity, 1024);
    assert_eq!(config.backoff.spin_limit, 128);
    assert_eq!(config.backoff.yield_limit, 16);
    assert!(config.backoff.block);
    assert_eq!(config.consumer.wait_timeout_ms, 100);
    assert_eq!(config.consumer.stats_interval_s, 5);
    assert!(config.consumer.halt_on_violation);
    assert_eq!(config.producer.retry_limit, 0);
}

#[test]
fn missing_file_is_file_not_found() {
    let tmp = TempDir::new().unwrap();
    let result = AttestationConfig::load(&tmp.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::FileNotFound)));
}

#[test]
fn malformed_toml_is_parse_error() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(tmp.path(), "[shared\nservice_name = ");
    let result = AttestationConfig::load(&path);
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn wrong_type_is_parse_error() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        "[shared]\nservice_name = \"cfa\"\n[region]\ncapacity = \"big\"\n",
    );
    let result = AttestationConfig::load(&path);
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn loaded_config_with_bad_capacity_fails_validation() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        "[shared]\nservice_name = \"cfa\"\n[region]\ncapacity = 0\n",
    );
    let config = AttestationConfig::load(&path).unwrap();
    let err = config.validate().unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
    assert!(err.to_string().contains("region.capacity"));
}

#[test]
fn shipped_sample_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/cfa.toml");
    let config = AttestationConfig::load(&path).unwrap();
    config.validate().unwrap();
}
