//! Synthetic untrusted producer
//!
//! Emits a deterministic stream of indirect transfers spread over a number
//! of fake modules, the way instrumented code would, so a running consumer
//! can be exercised without a real instrumented program.

use cfa_pipeline::{BatchSink, Batcher, PipelineError, PipelineResult};
use serde::Serialize;

/// Load address of the first synthetic module.
const MODULE_BASE: u64 = 0x5555_0000_0000;
/// Distance between synthetic module load addresses.
const MODULE_STRIDE: u64 = 0x0100_0000;
/// Size of the text range transfers land in.
const MODULE_TEXT: u64 = 0x0010_0000;

/// Outcome of one producer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProduceReport {
    /// Transfers recorded
    pub recorded: u64,
    /// Batches accepted by the ring
    pub flushed_batches: u64,
    /// Records dropped on a full ring
    pub dropped: u64,
}

/// `(source_id, module_base, target_address)` of synthetic transfer `n`.
pub fn synthetic_transfer(n: u64, modules: u32) -> (u64, u64, u64) {
    let module = n % u64::from(modules.max(1));
    let base = MODULE_BASE + module * MODULE_STRIDE;
    let offset = (n.wrapping_mul(0x9E37_79B9) & (MODULE_TEXT - 1)) & !0xF;
    (n, base, base + offset)
}

/// Record `count` synthetic transfers into `sink` and flush.
pub fn run_synthetic<S: BatchSink>(
    sink: S,
    count: u64,
    modules: u32,
    retry_limit: u32,
) -> PipelineResult<ProduceReport> {
    if modules == 0 {
        return Err(PipelineError::BadParameters {
            reason: "at least one module is required".to_string(),
        });
    }

    let mut batcher = Batcher::new(sink, retry_limit);
    for n in 0..count {
        let (source_id, module_base, target) = synthetic_transfer(n, modules);
        batcher.record_transfer(source_id, module_base, target)?;
    }
    batcher.flush()?;

    let stats = batcher.stats();
    Ok(ProduceReport {
        recorded: stats.recorded,
        flushed_batches: stats.flushed_batches,
        dropped: stats.dropped,
    })
}
