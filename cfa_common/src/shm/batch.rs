//! Fixed-capacity record batch.
//!
//! A `Batch` is what one producer flush hands to the ring buffer. It is
//! backed by a `heapless::Vec`, so filling it never touches the allocator.
//! That matters because records are appended from instrumentation hooks at
//! arbitrary call sites.

use crate::shm::consts::BATCH_CAPACITY;
use crate::shm::layout::ControlFlowRecord;

/// Bounded, ordered group of control-flow records moved as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    records: heapless::Vec<ControlFlowRecord, BATCH_CAPACITY>,
}

impl Batch {
    /// Create an empty batch.
    pub const fn new() -> Self {
        Self {
            records: heapless::Vec::new(),
        }
    }

    /// Build a batch from a slice. Returns `None` if the slice is longer
    /// than `BATCH_CAPACITY`.
    pub fn from_records(records: &[ControlFlowRecord]) -> Option<Self> {
        if records.len() > BATCH_CAPACITY {
            return None;
        }
        let mut batch = Self::new();
        for record in records {
            batch.records.push(*record).ok()?;
        }
        Some(batch)
    }

    /// Append a record. Gives the record back if the batch is full.
    #[inline]
    pub fn push(&mut self, source_id: u64, target_offset: u64) -> Result<(), ControlFlowRecord> {
        self.records
            .push(ControlFlowRecord::new(source_id, target_offset))
    }

    /// Number of records in the batch.
    #[inline]
    pub fn count(&self) -> u32 {
        self.records.len() as u32
    }

    /// True if the batch holds no records.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True if the batch holds `BATCH_CAPACITY` records.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.records.is_full()
    }

    /// Records in insertion order.
    #[inline]
    pub fn as_slice(&self) -> &[ControlFlowRecord] {
        self.records.as_slice()
    }

    /// Remove all records.
    #[inline]
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
