//! Tracing subscriber setup shared by CFA binaries.

use crate::config::LogLevel;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` directives are honoured; `level` is added on top as the
/// default. A second call is a no-op.
pub fn init_tracing(level: LogLevel, json: bool) {
    let filter = EnvFilter::from_default_env()
        .add_directive(LevelFilter::from_level(Level::from(level)).into());

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .compact()
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
