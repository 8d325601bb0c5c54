//! End-to-end pipeline scenarios
//!
//! Producer batching, ring transport, accumulation, verification and
//! retirement exercised together, in one process and across two handles on
//! the same named session.

use cfa_pipeline::{
    AttestationEngine, BackoffPolicy, Batcher, PipelineError, PipelineResult, RingBuffer,
    SharedRegion, ZERO_DIGEST, chain_digest, list_sessions, verify,
};
use cfa_common::shm::layout::{ControlFlowRecord, RegionState};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn engine_over(capacity: u32) -> PipelineResult<Arc<AttestationEngine>> {
    let region = Arc::new(SharedRegion::anonymous(capacity)?);
    Ok(Arc::new(AttestationEngine::attach(
        region,
        BackoffPolicy::default(),
    )?))
}

fn unretired(ring: &RingBuffer) -> Vec<ControlFlowRecord> {
    ring.available()
        .map(|view| view.iter().collect())
        .unwrap_or_default()
}

#[test]
fn zero_baseline_end_to_end() -> PipelineResult<()> {
    let engine = engine_over(16)?;
    engine.rebaseline_with(ZERO_DIGEST)?;

    let mut batcher = Batcher::new(Arc::clone(&engine), 0);
    batcher.record(1, 0x1000)?;
    batcher.record(2, 0x2000)?;
    batcher.flush()?;

    let d1 = chain_digest(&ZERO_DIGEST, 1, 0x1000);
    let d2 = chain_digest(&d1, 2, 0x2000);
    let records = unretired(engine.ring());
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].digest, d1);
    assert_eq!(records[1].digest, d2);

    // Verification is pure: same answer twice, nothing retired.
    assert_eq!(verify(&ZERO_DIGEST, &records), Ok(d2));
    assert_eq!(verify(&ZERO_DIGEST, &records), Ok(d2));
    assert_eq!(engine.ring().len(), 2);

    assert_eq!(engine.process_available()?, 2);
    assert!(engine.ring().is_empty());
    assert_eq!(engine.quote().tip, d2);
    Ok(())
}

#[test]
fn flipped_offset_is_caught_at_second_record() -> PipelineResult<()> {
    let engine = engine_over(16)?;
    engine.rebaseline_with(ZERO_DIGEST)?;
    engine.enqueue_records(&[
        ControlFlowRecord::new(1, 0x1000),
        ControlFlowRecord::new(2, 0x2000),
    ])?;

    let slot = engine.ring().available().map(|v| v.start() + 1).unwrap_or(1);
    // SAFETY: slot_ptr stays inside the data area and this test is the only
    // user of the region.
    unsafe {
        (*engine.region().slot_ptr(slot)).target_offset = 0x2001;
    }

    let records = unretired(engine.ring());
    assert_eq!(verify(&ZERO_DIGEST, &records).map_err(|v| v.at_index), Err(1));

    let err = engine.process_available().unwrap_err();
    assert!(matches!(err, PipelineError::IntegrityViolation { at_index: 1 }));
    assert!(err.is_fatal());
    assert_eq!(engine.stats().ring.retired_total, 1);
    assert!(engine.region().state().contains(RegionState::CHAIN_BROKEN));
    Ok(())
}

#[test]
fn capacity_boundary_leaves_ring_unchanged() -> PipelineResult<()> {
    let region = Arc::new(SharedRegion::anonymous(8)?);
    let ring = RingBuffer::new(region, BackoffPolicy::default());

    let batch: Vec<_> = (0..4).map(|i| ControlFlowRecord::new(i, i)).collect();
    ring.enqueue(&batch[..3])?;
    ring.enqueue(&batch)?; // exactly the 4 free slots
    assert_eq!(ring.free(), 0);

    let before = unretired(&ring);
    let err = ring.enqueue(&batch[..1]).unwrap_err();
    assert!(matches!(err, PipelineError::Full { requested: 1, free: 0 }));
    assert!(err.is_transient());
    assert_eq!(unretired(&ring), before);
    assert_eq!(ring.stats().published_total, 7);
    Ok(())
}

#[test]
fn batcher_drops_and_counts_under_overload() -> PipelineResult<()> {
    let region = Arc::new(SharedRegion::anonymous(4)?);
    let ring = RingBuffer::new(region, BackoffPolicy::default());

    {
        let mut batcher = Batcher::new(ring.clone(), 1);
        for i in 0..20 {
            batcher.record(i, i)?;
        }
    }

    let stats = ring.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.dropped_total, 20);

    // Small batches that fit are delivered, including on drop.
    {
        let mut batcher = Batcher::new(ring.clone(), 0);
        batcher.record(1, 1)?;
        batcher.record(2, 2)?;
    }
    assert_eq!(ring.len(), 2);
    Ok(())
}

/// Decode `producer << 32 | seq`.
fn split(source_id: u64) -> (u64, u64) {
    (source_id >> 32, source_id & 0xFFFF_FFFF)
}

fn assert_fifo_per_producer(retired: &[u64], producers: u64, per_producer: u64) {
    assert_eq!(retired.len() as u64, producers * per_producer);

    let mut next: HashMap<u64, u64> = HashMap::new();
    for &source_id in retired {
        let (producer, seq) = split(source_id);
        let expected = next.entry(producer).or_insert(0);
        assert_eq!(seq, *expected, "producer {producer} out of order");
        *expected += 1;
    }
    for producer in 0..producers {
        assert_eq!(next.get(&producer), Some(&per_producer));
    }
}

fn drain_until(engine: &AttestationEngine, done: &AtomicBool) -> Vec<u64> {
    let mut retired = Vec::new();
    while !(done.load(Ordering::Acquire) && engine.ring().is_empty()) {
        match engine.wait_for_data(Duration::from_millis(5)) {
            Ok(()) | Err(PipelineError::Empty) => {}
            Err(e) => panic!("wait failed: {e}"),
        }
        engine
            .process_available_with(|record| retired.push(record.source_id))
            .unwrap();
    }
    retired
}

#[test]
fn concurrent_single_record_batches_through_engine() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 500;

    let engine = engine_over(32).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        std::thread::spawn(move || drain_until(&engine, &done))
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let record = ControlFlowRecord::new(producer << 32 | seq, seq * 8);
                    loop {
                        match engine.enqueue_records(&[record]) {
                            Ok(_) => break,
                            Err(PipelineError::Full { .. }) => std::thread::yield_now(),
                            Err(e) => panic!("enqueue failed: {e}"),
                        }
                    }
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    let retired = consumer.join().unwrap();

    assert_fifo_per_producer(&retired, PRODUCERS, PER_PRODUCER);
    let stats = engine.stats();
    assert_eq!(stats.verified, PRODUCERS * PER_PRODUCER);
    assert_eq!(stats.ring.dropped_total, 0);
}

#[test]
fn concurrent_raw_producers_with_trusted_consumer() {
    const PRODUCERS: u64 = 3;
    const PER_PRODUCER: u64 = 400;

    let engine = engine_over(64).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let consumer = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        std::thread::spawn(move || drain_until(&engine, &done))
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            // Untrusted side: only the ring, no engine.
            let ring = engine.ring().clone();
            std::thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let record = [ControlFlowRecord::new(producer << 32 | seq, seq)];
                    while let Err(e) = ring.enqueue(&record) {
                        assert!(e.is_transient(), "enqueue failed: {e}");
                        std::thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    let retired = consumer.join().unwrap();

    assert_fifo_per_producer(&retired, PRODUCERS, PER_PRODUCER);
}

#[test]
fn producer_and_consumer_on_separate_handles() -> PipelineResult<()> {
    let name = format!("it_cross_handle_{}", std::process::id());
    let creator = Arc::new(SharedRegion::open(&name, 32)?);
    let engine = AttestationEngine::attach(Arc::clone(&creator), BackoffPolicy::default())?;

    assert!(list_sessions()?.iter().any(|s| s.name == name && s.capacity == 32));

    let attached = Arc::new(SharedRegion::attach(&name)?);
    assert!(!attached.is_creator());
    assert_eq!(attached.capacity(), 32);
    assert!(attached.state().contains(RegionState::CONSUMER_ATTACHED));

    {
        let ring = RingBuffer::new(Arc::clone(&attached), BackoffPolicy::default());
        let mut batcher = Batcher::new(ring, 0);
        for i in 0..10u64 {
            batcher.record_transfer(i, 0x7f00_0000_0000, 0x7f00_0000_0000 + i * 0x40)?;
        }
    }

    engine.wait_for_data(Duration::from_secs(1))?;
    let mut offsets = Vec::new();
    let retired = engine.process_available_with(|r| offsets.push(r.target_offset))?;
    assert_eq!(retired, 10);
    assert_eq!(offsets, (0..10u64).map(|i| i * 0x40).collect::<Vec<_>>());

    // Closing through the trusted side is visible to the producer handle.
    engine.close();
    let ring = RingBuffer::new(attached, BackoffPolicy::default());
    assert!(matches!(
        ring.enqueue(&[ControlFlowRecord::new(1, 1)]),
        Err(PipelineError::Closed)
    ));
    Ok(())
}

#[test]
fn second_open_of_live_session_attaches() -> PipelineResult<()> {
    let name = format!("it_reopen_{}", std::process::id());
    let first = SharedRegion::open(&name, 16)?;
    let second = SharedRegion::open(&name, 16)?;

    assert!(first.is_creator());
    assert!(!second.is_creator());
    assert_eq!(
        first.baseline_generation().load(Ordering::Acquire),
        second.baseline_generation().load(Ordering::Acquire)
    );
    Ok(())
}
