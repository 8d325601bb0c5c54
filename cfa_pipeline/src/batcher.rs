//! Producer-side record batching
//!
//! Each producer execution context owns one `Batcher`; there is no global or
//! thread-local state. Records collect in a fixed-capacity `Batch` and are
//! handed to a `BatchSink` whenever the batch fills, on `flush`, and on drop.
//!
//! A full ring never blocks the monitored program. After `retry_limit` extra
//! attempts the batch is dropped and the loss is counted both here and in
//! the region, where the trusted side can see the coverage gap.

use crate::error::{PipelineError, PipelineResult};
use crate::ring::{Published, RingBuffer};
use cfa_common::shm::batch::Batch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Destination of flushed batches.
pub trait BatchSink {
    /// Publish every record of `batch`, or none of them.
    fn submit(&self, batch: &Batch) -> PipelineResult<Published>;

    /// Record that `count` records were lost before reaching the ring.
    fn note_dropped(&self, count: u32);
}

impl BatchSink for RingBuffer {
    fn submit(&self, batch: &Batch) -> PipelineResult<Published> {
        self.enqueue(batch.as_slice())
    }

    fn note_dropped(&self, count: u32) {
        RingBuffer::note_dropped(self, count);
    }
}

impl<T: BatchSink + ?Sized> BatchSink for Arc<T> {
    fn submit(&self, batch: &Batch) -> PipelineResult<Published> {
        (**self).submit(batch)
    }

    fn note_dropped(&self, count: u32) {
        (**self).note_dropped(count);
    }
}

impl<T: BatchSink + ?Sized> BatchSink for &T {
    fn submit(&self, batch: &Batch) -> PipelineResult<Published> {
        (**self).submit(batch)
    }

    fn note_dropped(&self, count: u32) {
        (**self).note_dropped(count);
    }
}

/// Per-batcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherStats {
    /// Records handed to `record`
    pub recorded: u64,
    /// Batches accepted by the sink
    pub flushed_batches: u64,
    /// Records lost to a full or closed sink
    pub dropped: u64,
}

/// Accumulates records into batches for one producer context.
pub struct Batcher<S: BatchSink> {
    sink: S,
    pending: Batch,
    retry_limit: u32,
    stats: BatcherStats,
}

impl<S: BatchSink> Batcher<S> {
    /// Batcher that drops a batch after `retry_limit` extra attempts on a
    /// full sink.
    pub fn new(sink: S, retry_limit: u32) -> Self {
        Self {
            sink,
            pending: Batch::new(),
            retry_limit,
            stats: BatcherStats::default(),
        }
    }

    /// Append one transfer; flushes when the batch fills.
    ///
    /// Only non-transient sink failures (e.g. `Closed`) are returned; a full
    /// ring is absorbed by dropping and counting.
    #[inline]
    pub fn record(&mut self, source_id: u64, target_offset: u64) -> PipelineResult<()> {
        self.stats.recorded += 1;
        if let Err(rejected) = self.pending.push(source_id, target_offset) {
            self.flush()?;
            // An empty batch always has room.
            let _ = self
                .pending
                .push(rejected.source_id, rejected.target_offset);
        }
        if self.pending.is_full() {
            self.flush()?;
        }
        Ok(())
    }

    /// Append a transfer to `target_address` inside the module loaded at
    /// `module_base`. Only the module-relative offset is recorded, so the
    /// chain is independent of address-space randomisation.
    #[inline]
    pub fn record_transfer(
        &mut self,
        source_id: u64,
        module_base: u64,
        target_address: u64,
    ) -> PipelineResult<()> {
        self.record(source_id, target_address.wrapping_sub(module_base))
    }

    /// Hand the pending batch to the sink.
    pub fn flush(&mut self) -> PipelineResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut attempts = 0u32;
        loop {
            match self.sink.submit(&self.pending) {
                Ok(_) => {
                    self.stats.flushed_batches += 1;
                    self.pending.clear();
                    return Ok(());
                }
                Err(PipelineError::Full { .. }) if attempts < self.retry_limit => {
                    attempts += 1;
                    std::thread::yield_now();
                }
                Err(PipelineError::Full { requested, free }) => {
                    warn!(requested, free, attempts, "ring full, batch dropped");
                    self.drop_pending();
                    return Ok(());
                }
                Err(e) => {
                    self.drop_pending();
                    return Err(e);
                }
            }
        }
    }

    fn drop_pending(&mut self) {
        let count = self.pending.count();
        self.stats.dropped += u64::from(count);
        self.sink.note_dropped(count);
        self.pending.clear();
    }

    /// Records waiting for the next flush.
    pub fn pending_len(&self) -> u32 {
        self.pending.count()
    }

    /// Counters.
    pub fn stats(&self) -> BatcherStats {
        self.stats
    }

    /// Destination of flushed batches.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: BatchSink> Drop for Batcher<S> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "final flush failed");
        }
    }
}
