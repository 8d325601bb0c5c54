//! Trusted consumer loop
//!
//! Waits for published records, verifies and retires them through the
//! engine, and logs counters at a fixed interval. Runs until the session is
//! closed and drained, or until an integrity violation halts it.

use crate::error::{DaemonError, DaemonResult};
use cfa_common::config::ConsumerConfig;
use cfa_pipeline::{AttestationEngine, EngineStats, PipelineError};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the loop did before it stopped.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LoopSummary {
    /// Records retired by this loop
    pub retired: u64,
    /// Re-baselines performed after violations
    pub rebaselines: u32,
    /// Engine counters at exit
    pub stats: EngineStats,
}

/// Blocking consumer bound to one engine.
pub struct ConsumerLoop {
    engine: Arc<AttestationEngine>,
    settings: ConsumerConfig,
}

impl ConsumerLoop {
    /// Bind a loop to `engine`.
    pub fn new(engine: Arc<AttestationEngine>, settings: ConsumerConfig) -> Self {
        Self { engine, settings }
    }

    /// Run until the session closes and the ring is drained.
    ///
    /// With `halt_on_violation` an integrity violation ends the loop with
    /// `DaemonError::Halted`; otherwise the engine is re-baselined and the
    /// loop continues.
    pub fn run(&self) -> DaemonResult<LoopSummary> {
        let wait = Duration::from_millis(self.settings.wait_timeout_ms);
        let stats_every = Duration::from_secs(self.settings.stats_interval_s);
        let mut last_stats = Instant::now();
        let mut retired = 0u64;
        let mut rebaselines = 0u32;

        info!(
            wait_ms = self.settings.wait_timeout_ms,
            halt_on_violation = self.settings.halt_on_violation,
            "consumer loop started"
        );

        loop {
            match self.engine.wait_for_data(wait) {
                Ok(()) | Err(PipelineError::Empty) => {}
                Err(PipelineError::Closed) => break,
                Err(e) => return Err(e.into()),
            }

            match self.engine.process_available() {
                Ok(n) => retired += n as u64,
                Err(PipelineError::IntegrityViolation { at_index }) => {
                    if self.settings.halt_on_violation {
                        return Err(DaemonError::Halted { at_index });
                    }
                    let generation = self.engine.rebaseline()?;
                    rebaselines += 1;
                    warn!(at_index, generation, "continuing on a fresh chain");
                }
                Err(e) => return Err(e.into()),
            }

            if last_stats.elapsed() >= stats_every {
                log_stats(&self.engine.stats());
                last_stats = Instant::now();
            }
        }

        let stats = self.engine.stats();
        debug!(retired, rebaselines, "consumer loop finished");
        Ok(LoopSummary {
            retired,
            rebaselines,
            stats,
        })
    }
}

fn log_stats(stats: &EngineStats) {
    info!(
        generation = stats.generation,
        live = stats.ring.live,
        verified = stats.verified,
        published = stats.ring.published_total,
        dropped = stats.ring.dropped_total,
        "pipeline stats"
    );
}
