//! Bounded record queue across the trust boundary
//!
//! Publishing and retiring are separate steps. A producer copies records into
//! `[head, head + n)` under the ring lock and then publishes them by storing
//! the new `head` with release ordering. The consumer sees `[tail, head)`
//! through an acquire load, inspects and verifies the records in place, and
//! only then retires them by advancing `tail`. A slot is never rewritten by a
//! producer between publication and retirement.
//!
//! ```text
//!        tail            head
//!         │               │
//!  ┌───┬──▼┬───┬───┬───┬──▼┬───┬───┐
//!  │   │ r │ r │ r │ r │   │   │   │   r = published, not yet retired
//!  └───┴───┴───┴───┴───┴───┴───┴───┘
//! ```

use crate::error::{PipelineError, PipelineResult};
use crate::lock::{BackoffPolicy, ShmMutex, ShmMutexGuard, notify, signal_sequence, wait_for_change};
use crate::region::SharedRegion;
use cfa_common::shm::layout::{ControlFlowRecord, RegionState, ring_advance, ring_free, ring_live};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Slots written by one successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    /// Slot of the first record
    pub start: u32,
    /// Number of records
    pub len: u32,
}

/// Ring occupancy and lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingStats {
    /// Record slots
    pub capacity: u32,
    /// Published, unretired records
    pub live: u32,
    /// Records that can still be published
    pub free: u32,
    /// Records published since creation
    pub published_total: u64,
    /// Records retired since creation
    pub retired_total: u64,
    /// Records dropped by producers or discarded by a re-baseline
    pub dropped_total: u64,
    /// Session is closing
    pub closed: bool,
    /// An integrity violation is latched
    pub chain_broken: bool,
}

/// Handle on a region's ring. Cheap to clone; every clone shares the region.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    region: Arc<SharedRegion>,
    policy: BackoffPolicy,
}

impl RingBuffer {
    /// Ring over `region`, waiting on locks and data per `policy`.
    pub fn new(region: Arc<SharedRegion>, policy: BackoffPolicy) -> Self {
        Self { region, policy }
    }

    /// Underlying region.
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Backoff policy used for the ring lock and data waits.
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Record slots; at most `capacity - 1` are live.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.region.capacity()
    }

    pub(crate) fn lock(&self) -> ShmMutexGuard<'_> {
        ShmMutex::new(&self.region.control().lock, self.policy).lock()
    }

    // Indices live in memory any producer can write. Reduce before use so a
    // corrupt value never addresses outside the data area.
    #[inline]
    fn load_index(&self, word: &AtomicU32) -> u32 {
        word.load(Ordering::Acquire) % self.capacity()
    }

    #[inline]
    pub(crate) fn head(&self) -> u32 {
        self.load_index(&self.region.control().head)
    }

    #[inline]
    pub(crate) fn tail(&self) -> u32 {
        self.load_index(&self.region.control().tail)
    }

    /// Copy `records` into the ring and publish them.
    ///
    /// Fails with `Full` (and writes nothing) if fewer than `records.len()`
    /// slots are free. Never blocks on a full ring.
    pub fn enqueue(&self, records: &[ControlFlowRecord]) -> PipelineResult<Published> {
        if records.is_empty() {
            return Err(PipelineError::BadParameters {
                reason: "empty batch".to_string(),
            });
        }
        let requested = u32::try_from(records.len()).map_err(|_| PipelineError::BadParameters {
            reason: format!("batch of {} records", records.len()),
        })?;

        let control = self.region.control();
        if control.state().contains(RegionState::CLOSED) {
            return Err(PipelineError::Closed);
        }

        let capacity = self.capacity();
        let published = {
            let _guard = self.lock();
            let head = self.head();
            let free = ring_free(head, self.tail(), capacity);
            if requested > free {
                return Err(PipelineError::Full { requested, free });
            }

            for (i, record) in records.iter().enumerate() {
                self.region
                    .write_slot(ring_advance(head, i as u32, capacity), record);
            }
            control
                .head
                .store(ring_advance(head, requested, capacity), Ordering::Release);
            control
                .published_total
                .fetch_add(u64::from(requested), Ordering::Relaxed);

            Published {
                start: head,
                len: requested,
            }
        };

        self.signal_data();
        trace!(start = published.start, len = published.len, "records published");
        Ok(published)
    }

    fn signal_data(&self) {
        notify(&self.region.control().data_ready);
    }

    /// Snapshot of every published, unretired record. Never takes the lock.
    ///
    /// This is the consumer's dequeue: it returns `None` on an empty ring and
    /// retires nothing. Records leave the ring only through `retire`.
    pub fn available(&self) -> Option<BatchView<'_>> {
        let tail = self.tail();
        let len = ring_live(self.head(), tail, self.capacity());
        (len > 0).then_some(BatchView {
            region: &self.region,
            start: tail,
            len,
        })
    }

    /// Same as [`available`](Self::available).
    #[inline]
    pub fn dequeue_available(&self) -> Option<BatchView<'_>> {
        self.available()
    }

    /// Advance `tail` past `n` records.
    ///
    /// `n` larger than the live count is rejected with no change.
    pub fn retire(&self, n: u32) -> PipelineResult<()> {
        if n == 0 {
            return Ok(());
        }
        let control = self.region.control();
        let capacity = self.capacity();

        let _guard = self.lock();
        let tail = self.tail();
        let live = ring_live(self.head(), tail, capacity);
        if n > live {
            return Err(PipelineError::BadParameters {
                reason: format!("cannot retire {n} of {live} live records"),
            });
        }
        control
            .tail
            .store(ring_advance(tail, n, capacity), Ordering::Release);
        control
            .retired_total
            .fetch_add(u64::from(n), Ordering::Relaxed);
        Ok(())
    }

    /// Advance `tail` past `n` records only if it still sits at `expected`.
    ///
    /// Returns false, with no change, if `tail` moved or fewer than `n`
    /// records are live.
    pub(crate) fn retire_at(&self, expected: u32, n: u32) -> bool {
        let control = self.region.control();
        let capacity = self.capacity();

        let _guard = self.lock();
        let tail = self.tail();
        if tail != expected || n > ring_live(self.head(), tail, capacity) {
            return false;
        }
        if n > 0 {
            control
                .tail
                .store(ring_advance(tail, n, capacity), Ordering::Release);
            control
                .retired_total
                .fetch_add(u64::from(n), Ordering::Relaxed);
        }
        true
    }

    /// Drop every live record, counting them as dropped. Returns the count.
    pub fn discard_unretired(&self) -> u32 {
        let control = self.region.control();

        let _guard = self.lock();
        let head = self.head();
        let live = ring_live(head, self.tail(), self.capacity());
        control.tail.store(head, Ordering::Release);
        control
            .dropped_total
            .fetch_add(u64::from(live), Ordering::Relaxed);
        if live > 0 {
            debug!(discarded = live, "unretired records discarded");
        }
        live
    }

    /// Wait until at least one record is published.
    ///
    /// Returns `Err(Empty)` if `timeout` passes first and `Err(Closed)` once
    /// the session is closing.
    pub fn wait_for_data(&self, timeout: Duration) -> PipelineResult<()> {
        let control = self.region.control();
        let deadline = Instant::now() + timeout;
        loop {
            let seen = signal_sequence(&control.data_ready);
            if !self.is_empty() {
                return Ok(());
            }
            if control.state().contains(RegionState::CLOSED) {
                return Err(PipelineError::Closed);
            }
            if !wait_for_change(&control.data_ready, seen, self.policy, deadline) {
                return if self.is_empty() {
                    Err(PipelineError::Empty)
                } else {
                    Ok(())
                };
            }
        }
    }

    /// Count records a producer had to drop.
    pub fn note_dropped(&self, n: u32) {
        self.region
            .control()
            .dropped_total
            .fetch_add(u64::from(n), Ordering::Relaxed);
    }

    /// Mark the session closing and wake every waiter.
    pub fn close(&self) {
        self.region.control().insert_state(RegionState::CLOSED);
        self.signal_data();
    }

    /// True once the session is closing.
    pub fn is_closed(&self) -> bool {
        self.region.state().contains(RegionState::CLOSED)
    }

    /// Published, unretired records.
    pub fn len(&self) -> u32 {
        ring_live(self.head(), self.tail(), self.capacity())
    }

    /// Slots available to producers.
    pub fn free(&self) -> u32 {
        ring_free(self.head(), self.tail(), self.capacity())
    }

    /// True if nothing is published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if no record can be published.
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Occupancy and counters.
    pub fn stats(&self) -> RingStats {
        let control = self.region.control();
        let state = control.state();
        let (head, tail, capacity) = (self.head(), self.tail(), self.capacity());
        RingStats {
            capacity,
            live: ring_live(head, tail, capacity),
            free: ring_free(head, tail, capacity),
            published_total: control.published_total.load(Ordering::Relaxed),
            retired_total: control.retired_total.load(Ordering::Relaxed),
            dropped_total: control.dropped_total.load(Ordering::Relaxed),
            closed: state.contains(RegionState::CLOSED),
            chain_broken: state.contains(RegionState::CHAIN_BROKEN),
        }
    }
}

/// In-place view of `[tail, head)` at the time of the snapshot.
///
/// Records are read straight from the mapping, one at a time, wrapping at the
/// end of the data area.
#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a> {
    region: &'a SharedRegion,
    start: u32,
    len: u32,
}

impl<'a> BatchView<'a> {
    /// Slot of the first record.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Number of records in the view.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Always false; empty rings yield no view.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy of the `i`-th record of the view.
    pub fn get(&self, i: u32) -> Option<ControlFlowRecord> {
        (i < self.len).then(|| {
            self.region
                .read_slot(ring_advance(self.start, i, self.region.capacity()))
        })
    }

    /// Records in publication order.
    pub fn iter(&self) -> impl Iterator<Item = ControlFlowRecord> + use<'a> {
        let view = *self;
        (0..view.len).filter_map(move |i| view.get(i))
    }
}
