//! Trusted consumer: accumulate, verify, retire
//!
//! The engine is the trusted half of a session. It folds every published
//! record into the hash chain (writing each digest into its slot), later
//! recomputes the chain over the unretired records, and retires only the
//! prefix that verifies.
//!
//! Chain state (tip, verified anchor, accumulation and retire cursors) lives
//! in this process's memory, never in the shared region, so a producer can at
//! most corrupt records and indices, which verification then catches. The
//! engine alone moves `tail`; a shared `tail` that disagrees with its own
//! cursor, or a `head` that falls behind accumulated records, is reported as
//! a violation at index 0.
//!
//! Lock order, everywhere: chain state, then baseline lock, then ring lock.

use crate::baseline::{BaselineGuard, BaselineManager, fresh_seed};
use crate::batcher::BatchSink;
use crate::chain::{ChainAccumulator, ChainVerifier, Digest, IntegrityViolation, digest_hex};
use crate::discovery::{read_metadata, write_metadata};
use crate::error::{PipelineError, PipelineResult};
use crate::lock::BackoffPolicy;
use crate::region::SharedRegion;
use crate::ring::{Published, RingBuffer, RingStats};
use cfa_common::shm::batch::Batch;
use cfa_common::shm::consts::BATCH_CAPACITY;
use cfa_common::shm::layout::{ControlFlowRecord, RegionState, ring_advance, ring_live};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Verified chain position, for comparison by an external verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainQuote {
    /// Baseline generation the chain started from
    pub generation: u32,
    /// Records verified since that baseline
    pub sequence: u64,
    /// Digest of the last verified record, or the genesis
    pub tip: Digest,
}

/// Engine and ring counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Ring occupancy and lifetime counters
    pub ring: RingStats,
    /// Baseline generation in use
    pub generation: u32,
    /// Records accumulated since the baseline
    pub accumulated: u64,
    /// Records verified and retired since the baseline
    pub verified: u64,
    /// Accumulated records still awaiting verification
    pub pending: u32,
    /// A violation is latched
    pub chain_broken: bool,
}

#[derive(Debug)]
struct ChainState {
    generation: u32,
    accumulator: ChainAccumulator,
    verifier: ChainVerifier,
    // Oldest unretired slot, as last retired by this engine.
    tail: u32,
    // Next slot to accumulate; `pending` records sit between `tail` and here.
    cursor: u32,
    pending: u32,
    violation: Option<IntegrityViolation>,
}

impl ChainState {
    fn new(genesis: Digest, generation: u32, tail: u32) -> Self {
        Self {
            generation,
            accumulator: ChainAccumulator::new(genesis),
            verifier: ChainVerifier::new(genesis),
            tail,
            cursor: tail,
            pending: 0,
            violation: None,
        }
    }
}

/// The trusted consumer bound to one region.
#[derive(Debug)]
pub struct AttestationEngine {
    ring: RingBuffer,
    baseline: BaselineManager,
    state: Mutex<ChainState>,
}

impl AttestationEngine {
    /// Bind the trusted consumer to `region`.
    ///
    /// At most one engine may be bound to a region at a time. A region whose
    /// chain has already advanced under an earlier consumer is re-baselined,
    /// since chain state does not outlive its engine.
    pub fn attach(region: Arc<SharedRegion>, policy: BackoffPolicy) -> PipelineResult<Self> {
        let previous = region
            .control()
            .insert_state(RegionState::CONSUMER_ATTACHED);
        if previous.contains(RegionState::CONSUMER_ATTACHED) {
            return Err(PipelineError::BadParameters {
                reason: "region already has a trusted consumer".to_string(),
            });
        }

        let ring = RingBuffer::new(Arc::clone(&region), policy);
        let baseline = BaselineManager::new(Arc::clone(&region), policy);
        let state = {
            let guard = baseline.lock();
            ChainState::new(guard.initial_digest(), guard.generation(), ring.tail())
        };
        let engine = Self {
            ring,
            baseline,
            state: Mutex::new(state),
        };

        let control = region.control();
        if control.retired_total.load(Ordering::Relaxed) > 0
            || previous.contains(RegionState::CHAIN_BROKEN)
        {
            engine.rebaseline()?;
        }

        info!(
            capacity = region.capacity(),
            generation = engine.baseline.generation(),
            "attestation engine attached"
        );
        Ok(engine)
    }

    /// Ring this engine consumes.
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Region this engine is bound to.
    pub fn region(&self) -> &Arc<SharedRegion> {
        self.ring.region()
    }

    /// Publish a batch and fold it into the chain.
    pub fn enqueue(&self, batch: &Batch) -> PipelineResult<Published> {
        self.enqueue_records(batch.as_slice())
    }

    /// Publish up to `BATCH_CAPACITY` records and fold them into the chain.
    ///
    /// Records published directly through the ring by other producers ahead
    /// of these are folded too, in publication order.
    pub fn enqueue_records(&self, records: &[ControlFlowRecord]) -> PipelineResult<Published> {
        if records.len() > BATCH_CAPACITY {
            return Err(PipelineError::BadParameters {
                reason: format!(
                    "batch of {} records exceeds {BATCH_CAPACITY}",
                    records.len()
                ),
            });
        }

        let mut state = self.state.lock();
        Self::check_latched(&state)?;
        let baseline = self.baseline.lock();
        Self::check_generation(&state, &baseline)?;

        let published = self.ring.enqueue(records)?;
        self.fold_pending(&mut state, &baseline)?;
        Ok(published)
    }

    /// Fold records that producers published straight into the ring.
    /// Returns how many were folded.
    pub fn accumulate_published(&self) -> PipelineResult<usize> {
        let mut state = self.state.lock();
        Self::check_latched(&state)?;
        let baseline = self.baseline.lock();
        Self::check_generation(&state, &baseline)?;
        Ok(self.fold_pending(&mut state, &baseline)? as usize)
    }

    /// Verify and retire every ready record. Returns the number retired.
    pub fn process_available(&self) -> PipelineResult<usize> {
        self.process_available_with(|_| {})
    }

    /// Like `process_available`, handing each retired record to `on_retired`
    /// in publication order.
    ///
    /// On the first mismatch the verified prefix is still retired, the
    /// violation is latched and `IntegrityViolation { at_index }` is returned,
    /// counted from the oldest unretired record. Every later call returns the
    /// same violation until `rebaseline`. Chain state only advances once the
    /// ring has retired the verified records.
    pub fn process_available_with<F>(&self, mut on_retired: F) -> PipelineResult<usize>
    where
        F: FnMut(&ControlFlowRecord),
    {
        let mut state = self.state.lock();
        Self::check_latched(&state)?;
        let baseline = self.baseline.lock();
        Self::check_generation(&state, &baseline)?;

        self.fold_pending(&mut state, &baseline)?;
        if state.pending == 0 {
            return Ok(0);
        }

        let region = self.ring.region();
        let capacity = region.capacity();
        let mut verifier = state.verifier.clone();
        let mut retired = Vec::with_capacity(state.pending as usize);
        let mut failure = None;

        for i in 0..state.pending {
            let record = region.read_slot(ring_advance(state.tail, i, capacity));
            match verifier.verify_next(&record, i as usize) {
                Ok(()) => retired.push(record),
                Err(violation) => {
                    failure = Some(violation);
                    break;
                }
            }
        }

        let verified = retired.len() as u32;
        if !self.ring.retire_at(state.tail, verified) {
            let violation = self.index_violation(&state);
            return Err(self.latch(&mut state, violation));
        }
        state.verifier = verifier;
        state.tail = ring_advance(state.tail, verified, capacity);
        state.pending -= verified;
        for record in &retired {
            on_retired(record);
        }

        if let Some(violation) = failure {
            return Err(self.latch(&mut state, violation));
        }

        debug!(retired = verified, sequence = state.verifier.verified(), "records verified");
        Ok(verified as usize)
    }

    /// Start a new chain from fresh OS randomness. Returns the new generation.
    pub fn rebaseline(&self) -> PipelineResult<u32> {
        let seed = fresh_seed()?;
        self.rebaseline_with(seed)
    }

    /// Start a new chain from `seed`.
    ///
    /// Unretired records are discarded (counted as dropped), the generation is
    /// bumped, chain state is reset and any latched violation is cleared.
    pub fn rebaseline_with(&self, seed: Digest) -> PipelineResult<u32> {
        let mut state = self.state.lock();
        let mut baseline = self.baseline.lock();

        let discarded = self.ring.discard_unretired();
        let generation = baseline.replace(seed);
        *state = ChainState::new(seed, generation, self.ring.tail());
        drop(baseline);

        self.region()
            .control()
            .remove_state(RegionState::CHAIN_BROKEN);
        self.refresh_metadata(generation);

        warn!(generation, discarded, "chain re-baselined");
        Ok(generation)
    }

    fn refresh_metadata(&self, generation: u32) {
        let Some(name) = self.region().name() else {
            return;
        };
        match read_metadata(name) {
            Ok(mut info) => {
                info.generation = generation;
                if let Err(e) = write_metadata(&info) {
                    warn!(session = name, error = %e, "session metadata not updated");
                }
            }
            Err(e) => debug!(session = name, error = %e, "no session metadata to update"),
        }
    }

    /// Wait for published records; `Err(Empty)` on timeout.
    pub fn wait_for_data(&self, timeout: Duration) -> PipelineResult<()> {
        self.ring.wait_for_data(timeout)
    }

    /// Current verified chain position.
    pub fn quote(&self) -> ChainQuote {
        let state = self.state.lock();
        ChainQuote {
            generation: state.generation,
            sequence: state.verifier.verified(),
            tip: state.verifier.anchor(),
        }
    }

    /// Latched violation, if any.
    pub fn violation(&self) -> Option<IntegrityViolation> {
        self.state.lock().violation.clone()
    }

    /// Counters.
    pub fn stats(&self) -> EngineStats {
        let state = self.state.lock();
        EngineStats {
            ring: self.ring.stats(),
            generation: state.generation,
            accumulated: state.accumulator.committed(),
            verified: state.verifier.verified(),
            pending: state.pending,
            chain_broken: state.violation.is_some(),
        }
    }

    /// Mark the session closing and wake waiters.
    pub fn close(&self) {
        self.ring.close();
        info!("attestation session closed");
    }

    // Record `violation` as the session's latched failure.
    fn latch(&self, state: &mut ChainState, violation: IntegrityViolation) -> PipelineError {
        error!(
            at_index = violation.at_index,
            expected = %digest_hex(&violation.expected),
            stored = %digest_hex(&violation.stored),
            generation = state.generation,
            sequence = state.verifier.verified(),
            "control-flow chain integrity violation"
        );
        self.region()
            .control()
            .insert_state(RegionState::CHAIN_BROKEN);
        let at_index = violation.at_index;
        state.violation = Some(violation);
        PipelineError::IntegrityViolation { at_index }
    }

    // Ring indices no longer match the records this engine accumulated. The
    // record now at the shared tail is reported against the verified anchor.
    fn index_violation(&self, state: &ChainState) -> IntegrityViolation {
        let stored = self.ring.region().read_slot(self.ring.tail()).digest;
        IntegrityViolation {
            at_index: 0,
            expected: state.verifier.anchor(),
            stored,
        }
    }

    fn check_latched(state: &ChainState) -> PipelineResult<()> {
        match &state.violation {
            Some(violation) => Err(PipelineError::IntegrityViolation {
                at_index: violation.at_index,
            }),
            None => Ok(()),
        }
    }

    fn check_generation(state: &ChainState, baseline: &BaselineGuard<'_>) -> PipelineResult<()> {
        let found = baseline.generation();
        if found != state.generation {
            return Err(PipelineError::BaselineChanged {
                expected: state.generation,
                found,
            });
        }
        Ok(())
    }

    // Requires the baseline lock, which the guard argument proves.
    fn fold_pending(
        &self,
        state: &mut ChainState,
        _baseline: &BaselineGuard<'_>,
    ) -> PipelineResult<u32> {
        let region = self.ring.region();
        let capacity = region.capacity();
        let tail = self.ring.tail();
        let live = ring_live(self.ring.head(), tail, capacity);
        if tail != state.tail || live < state.pending {
            let violation = self.index_violation(state);
            return Err(self.latch(state, violation));
        }
        let count = live - state.pending;

        for i in 0..count {
            let slot = ring_advance(state.cursor, i, capacity);
            let record = region.read_slot(slot);
            let digest = state
                .accumulator
                .extend(record.source_id, record.target_offset);
            region.write_digest(slot, &digest);
        }

        state.cursor = ring_advance(state.cursor, count, capacity);
        state.pending += count;
        Ok(count)
    }
}

impl BatchSink for AttestationEngine {
    fn submit(&self, batch: &Batch) -> PipelineResult<Published> {
        self.enqueue(batch)
    }

    fn note_dropped(&self, count: u32) {
        self.ring.note_dropped(count);
    }
}

impl Drop for AttestationEngine {
    fn drop(&mut self) {
        self.region()
            .control()
            .remove_state(RegionState::CONSUMER_ATTACHED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ZERO_DIGEST, chain_digest, verify};
    use std::ptr::addr_of_mut;

    fn engine(capacity: u32) -> AttestationEngine {
        let region = Arc::new(SharedRegion::anonymous(capacity).unwrap());
        AttestationEngine::attach(region, BackoffPolicy::default()).unwrap()
    }

    fn records(ids: std::ops::Range<u64>) -> Vec<ControlFlowRecord> {
        ids.map(|id| ControlFlowRecord::new(id, 0x1000 * id)).collect()
    }

    fn unretired(engine: &AttestationEngine) -> Vec<ControlFlowRecord> {
        engine
            .ring()
            .available()
            .map(|view| view.iter().collect())
            .unwrap_or_default()
    }

    // Simulates a producer scribbling over a published slot.
    fn tamper(engine: &AttestationEngine, slot: u32, edit: impl FnOnce(*mut ControlFlowRecord)) {
        edit(engine.region().slot_ptr(slot));
    }

    #[test]
    fn zero_baseline_two_records() {
        let engine = engine(16);
        assert_eq!(engine.rebaseline_with(ZERO_DIGEST).unwrap(), 2);

        engine
            .enqueue_records(&[
                ControlFlowRecord::new(1, 0x1000),
                ControlFlowRecord::new(2, 0x2000),
            ])
            .unwrap();

        let d1 = chain_digest(&ZERO_DIGEST, 1, 0x1000);
        let d2 = chain_digest(&d1, 2, 0x2000);
        let stored = unretired(&engine);
        assert_eq!(stored[0].digest, d1);
        assert_eq!(stored[1].digest, d2);
        assert_eq!(verify(&ZERO_DIGEST, &stored), Ok(d2));

        assert_eq!(engine.process_available().unwrap(), 2);
        assert_eq!(
            engine.quote(),
            ChainQuote {
                generation: 2,
                sequence: 2,
                tip: d2,
            }
        );
    }

    #[test]
    fn tampered_offset_retires_only_the_prefix() {
        let engine = engine(16);
        engine.rebaseline_with(ZERO_DIGEST).unwrap();
        engine
            .enqueue_records(&[
                ControlFlowRecord::new(1, 0x1000),
                ControlFlowRecord::new(2, 0x2000),
            ])
            .unwrap();

        // SAFETY: slot 1 is in bounds; no other thread touches the region.
        tamper(&engine, 1, |slot| unsafe {
            *addr_of_mut!((*slot).target_offset) = 0x2001
        });

        let err = engine.process_available().unwrap_err();
        assert!(matches!(err, PipelineError::IntegrityViolation { at_index: 1 }));

        let stats = engine.stats();
        assert_eq!(stats.ring.retired_total, 1);
        assert_eq!(stats.ring.live, 1);
        assert!(stats.chain_broken);
        assert!(engine.region().state().contains(RegionState::CHAIN_BROKEN));
        assert_eq!(engine.violation().map(|v| v.at_index), Some(1));
    }

    #[test]
    fn each_field_tamper_is_located() {
        for victim in 0..4u32 {
            for field in 0..3 {
                let engine = engine(16);
                engine.enqueue_records(&records(1..5)).unwrap();

                // SAFETY: in-bounds slot; single-threaded test.
                tamper(&engine, victim, |slot| unsafe {
                    match field {
                        0 => (*slot).source_id ^= 0xFF,
                        1 => (*slot).target_offset ^= 0xFF,
                        _ => (*slot).digest[7] ^= 0xFF,
                    }
                });

                let err = engine.process_available().unwrap_err();
                assert!(
                    matches!(err, PipelineError::IntegrityViolation { at_index } if at_index == victim as usize),
                    "victim {victim}, field {field}: {err:?}"
                );
                assert_eq!(engine.stats().ring.retired_total, u64::from(victim));
            }
        }
    }

    #[test]
    fn violation_is_latched_until_rebaseline() {
        let engine = engine(8);
        engine.enqueue_records(&records(1..3)).unwrap();
        // SAFETY: in-bounds slot; single-threaded test.
        tamper(&engine, 0, |slot| unsafe { (*slot).digest = ZERO_DIGEST });

        assert!(engine.process_available().is_err());
        assert!(matches!(
            engine.process_available(),
            Err(PipelineError::IntegrityViolation { at_index: 0 })
        ));
        assert!(matches!(
            engine.enqueue_records(&records(3..4)),
            Err(PipelineError::IntegrityViolation { .. })
        ));

        let generation = engine.rebaseline().unwrap();
        assert_eq!(generation, 2);
        assert!(engine.violation().is_none());
        assert!(!engine.region().state().contains(RegionState::CHAIN_BROKEN));
        assert!(engine.ring().is_empty());
        assert_eq!(engine.stats().ring.dropped_total, 2);

        engine.enqueue_records(&records(5..7)).unwrap();
        assert_eq!(engine.process_available().unwrap(), 2);
    }

    #[test]
    fn moved_tail_with_forged_chain_is_latched() {
        let engine = engine(8);
        engine.enqueue_records(&records(1..4)).unwrap();
        let genesis = engine.region().read_initial_digest();

        // A producer skips the first record and re-chains the rest from the
        // genesis it can read out of the region.
        let region = engine.region();
        region.control().tail.store(1, Ordering::Release);
        let mut prev = genesis;
        for (slot, id) in (1..=3u32).zip(10u64..) {
            let mut record = ControlFlowRecord::new(id, 0x100 * id);
            record.digest = chain_digest(&prev, record.source_id, record.target_offset);
            prev = record.digest;
            region.write_slot(slot, &record);
        }

        assert!(matches!(
            engine.process_available(),
            Err(PipelineError::IntegrityViolation { at_index: 0 })
        ));
        let quote = engine.quote();
        assert_eq!(quote.sequence, 0);
        assert_eq!(quote.tip, genesis);
        assert_eq!(engine.violation().map(|v| v.at_index), Some(0));
        assert!(engine.region().state().contains(RegionState::CHAIN_BROKEN));
        assert_eq!(engine.stats().ring.retired_total, 0);

        assert!(matches!(
            engine.process_available(),
            Err(PipelineError::IntegrityViolation { at_index: 0 })
        ));
        engine.rebaseline().unwrap();
        engine.enqueue_records(&records(5..7)).unwrap();
        assert_eq!(engine.process_available().unwrap(), 2);
    }

    #[test]
    fn head_behind_accumulated_records_is_latched() {
        let engine = engine(8);
        engine.enqueue_records(&records(1..4)).unwrap();
        engine.region().control().head.store(1, Ordering::Release);

        assert!(matches!(
            engine.accumulate_published(),
            Err(PipelineError::IntegrityViolation { at_index: 0 })
        ));
        assert!(engine.stats().chain_broken);
        assert_eq!(engine.quote().sequence, 0);
        assert!(matches!(
            engine.enqueue_records(&records(4..5)),
            Err(PipelineError::IntegrityViolation { at_index: 0 })
        ));
    }

    #[test]
    fn chain_continues_across_calls() {
        let engine = engine(8);
        engine.rebaseline_with([5u8; 32]).unwrap();

        engine.enqueue_records(&records(1..4)).unwrap();
        assert_eq!(engine.process_available().unwrap(), 3);
        engine.enqueue_records(&records(4..6)).unwrap();
        assert_eq!(engine.process_available().unwrap(), 2);

        let mut expected = [5u8; 32];
        for record in records(1..6) {
            expected = chain_digest(&expected, record.source_id, record.target_offset);
        }
        assert_eq!(engine.quote().tip, expected);
        assert_eq!(engine.quote().sequence, 5);
    }

    #[test]
    fn raw_producer_records_are_accumulated() {
        let engine = engine(8);
        engine.ring().enqueue(&records(1..4)).unwrap();
        assert_eq!(engine.accumulate_published().unwrap(), 3);
        assert_eq!(engine.accumulate_published().unwrap(), 0);

        let mut seen = Vec::new();
        let retired = engine
            .process_available_with(|record| seen.push(record.source_id))
            .unwrap();
        assert_eq!(retired, 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(engine.process_available().unwrap(), 0);
    }

    #[test]
    fn forged_producer_digests_are_overwritten() {
        let engine = engine(8);
        let mut forged = records(1..3);
        forged[0].digest = [0xAA; 32];
        engine.ring().enqueue(&forged).unwrap();
        assert_eq!(engine.process_available().unwrap(), 2);
    }

    #[test]
    fn foreign_rebaseline_is_detected() {
        let engine = engine(8);
        engine.enqueue_records(&records(1..2)).unwrap();

        let outsider = BaselineManager::new(Arc::clone(engine.region()), BackoffPolicy::default());
        outsider.lock().replace([1u8; 32]);

        assert!(matches!(
            engine.process_available(),
            Err(PipelineError::BaselineChanged {
                expected: 1,
                found: 2
            })
        ));
        engine.rebaseline().unwrap();
        assert_eq!(engine.process_available().unwrap(), 0);
    }

    #[test]
    fn oversized_batch_is_bad_parameters() {
        let engine = engine(32);
        let err = engine
            .enqueue_records(&records(0..BATCH_CAPACITY as u64 + 1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::BadParameters { .. }));
        assert!(engine.ring().is_empty());
    }

    #[test]
    fn one_consumer_per_region() {
        let region = Arc::new(SharedRegion::anonymous(8).unwrap());
        let first = AttestationEngine::attach(Arc::clone(&region), BackoffPolicy::default()).unwrap();
        assert!(matches!(
            AttestationEngine::attach(Arc::clone(&region), BackoffPolicy::default()),
            Err(PipelineError::BadParameters { .. })
        ));

        drop(first);
        assert!(AttestationEngine::attach(region, BackoffPolicy::default()).is_ok());
    }

    #[test]
    fn successor_engine_starts_a_new_generation() {
        let region = Arc::new(SharedRegion::anonymous(8).unwrap());
        {
            let engine = AttestationEngine::attach(Arc::clone(&region), BackoffPolicy::default()).unwrap();
            engine.enqueue_records(&records(1..3)).unwrap();
            engine.process_available().unwrap();
        }

        let successor = AttestationEngine::attach(region, BackoffPolicy::default()).unwrap();
        assert_eq!(successor.quote().generation, 2);
        successor.enqueue_records(&records(3..5)).unwrap();
        assert_eq!(successor.process_available().unwrap(), 2);
    }

    #[test]
    fn close_stops_producers_and_waiters() {
        let engine = engine(8);
        engine.close();
        assert!(matches!(
            engine.enqueue_records(&records(1..2)),
            Err(PipelineError::Closed)
        ));
        assert!(matches!(
            engine.wait_for_data(Duration::from_millis(1)),
            Err(PipelineError::Closed)
        ));
    }

    #[test]
    fn stats_track_progress() {
        let engine = engine(8);
        engine.enqueue_records(&records(1..4)).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.accumulated, 3);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.verified, 0);

        engine.process_available().unwrap();
        let stats = engine.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.verified, 3);
        assert_eq!(stats.ring.retired_total, 3);
        assert!(serde_json::to_string(&stats).is_ok());
    }
}
