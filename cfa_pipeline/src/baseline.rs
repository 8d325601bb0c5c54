//! Chain genesis digest and generation counter
//!
//! The baseline is replaced only while its shared lock word is held, and every
//! chain extension holds the same lock, so a digest computation never runs
//! against a half-written seed.

use crate::chain::Digest;
use crate::error::{PipelineError, PipelineResult};
use crate::lock::{BackoffPolicy, ShmMutex, ShmMutexGuard};
use crate::region::SharedRegion;
use cfa_common::shm::consts::DIGEST_SIZE;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Draw a fresh 32-byte seed from the operating system.
pub fn fresh_seed() -> PipelineResult<Digest> {
    let mut seed = [0u8; DIGEST_SIZE];
    OsRng
        .try_fill_bytes(&mut seed)
        .map_err(|e| PipelineError::ResourceExhausted {
            reason: format!("OS randomness unavailable: {e}"),
        })?;
    Ok(seed)
}

/// Point-in-time copy of the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    /// Genesis digest
    pub initial_digest: Digest,
    /// Generation the digest belongs to
    pub generation: u32,
}

/// Access to a region's `HashBaseline`.
#[derive(Debug, Clone)]
pub struct BaselineManager {
    region: Arc<SharedRegion>,
    policy: BackoffPolicy,
}

impl BaselineManager {
    /// Manage the baseline of `region`.
    pub fn new(region: Arc<SharedRegion>, policy: BackoffPolicy) -> Self {
        Self { region, policy }
    }

    /// Take the baseline lock.
    pub fn lock(&self) -> BaselineGuard<'_> {
        let guard = ShmMutex::new(self.region.baseline_lock_word(), self.policy).lock();
        BaselineGuard {
            region: &self.region,
            _guard: guard,
        }
    }

    /// Current generation, without locking.
    pub fn generation(&self) -> u32 {
        self.region.baseline_generation().load(Ordering::Acquire)
    }

    /// Consistent copy of digest and generation.
    pub fn snapshot(&self) -> BaselineSnapshot {
        let guard = self.lock();
        BaselineSnapshot {
            initial_digest: guard.initial_digest(),
            generation: guard.generation(),
        }
    }
}

/// Exclusive hold on the baseline.
#[must_use = "the baseline is unlocked as soon as the guard is dropped"]
pub struct BaselineGuard<'a> {
    region: &'a SharedRegion,
    _guard: ShmMutexGuard<'a>,
}

impl BaselineGuard<'_> {
    /// Genesis digest of the current generation.
    pub fn initial_digest(&self) -> Digest {
        self.region.read_initial_digest()
    }

    /// Current generation.
    pub fn generation(&self) -> u32 {
        self.region.baseline_generation().load(Ordering::Acquire)
    }

    /// Install `seed` as the new genesis and return the new generation.
    pub fn replace(&mut self, seed: Digest) -> u32 {
        self.region.write_initial_digest(seed);
        self.region
            .baseline_generation()
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    /// Replace the genesis with fresh OS randomness.
    pub fn reseed(&mut self) -> PipelineResult<u32> {
        let seed = fresh_seed()?;
        Ok(self.replace(seed))
    }
}
