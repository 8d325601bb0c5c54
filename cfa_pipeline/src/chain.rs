//! SHA-256 hash chain over control-flow records
//!
//! Each record commits to its predecessor:
//!
//! ```text
//! D_0 = genesis
//! D_i = SHA256(D_{i-1} || source_id_i (u64 LE) || target_offset_i (u64 LE))
//! ```
//!
//! The preimage is always 48 bytes with both integers little-endian, whatever
//! the host byte order. `accumulate` and `verify` go through the same
//! `chain_digest`, so a record accumulated from a genesis always verifies
//! from that genesis.

use cfa_common::shm::consts::DIGEST_SIZE;
use cfa_common::shm::layout::ControlFlowRecord;
use sha2::{Digest as _, Sha256};
use std::fmt::Write as _;
use thiserror::Error;

/// 32-byte SHA-256 output.
pub type Digest = [u8; DIGEST_SIZE];

/// All-zero digest.
pub const ZERO_DIGEST: Digest = [0u8; DIGEST_SIZE];

/// Digest of one link: `SHA256(prev || source_id || target_offset)`.
#[inline]
pub fn chain_digest(prev: &Digest, source_id: u64, target_offset: u64) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(source_id.to_le_bytes());
    hasher.update(target_offset.to_le_bytes());
    hasher.finalize().into()
}

/// Fold `records` into the chain starting at `genesis`, writing each
/// record's digest. Returns the new tip.
pub fn accumulate(genesis: &Digest, records: &mut [ControlFlowRecord]) -> Digest {
    let mut accumulator = ChainAccumulator::new(*genesis);
    for record in records.iter_mut() {
        accumulator.extend_record(record);
    }
    accumulator.tip()
}

/// Recompute the chain from `genesis` and compare with the stored digests.
///
/// Pure: nothing is written, so repeated calls over the same records give
/// the same answer. Returns the tip on success.
pub fn verify(genesis: &Digest, records: &[ControlFlowRecord]) -> Result<Digest, IntegrityViolation> {
    let mut verifier = ChainVerifier::new(*genesis);
    for (index, record) in records.iter().enumerate() {
        verifier.verify_next(record, index)?;
    }
    Ok(verifier.anchor())
}

/// Lowercase hex rendering for logs.
pub fn digest_hex(digest: &Digest) -> String {
    let mut out = String::with_capacity(DIGEST_SIZE * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// First record whose stored digest does not match the recomputed one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chain mismatch at index {at_index}: expected {}, stored {}", digest_hex(.expected), digest_hex(.stored))]
pub struct IntegrityViolation {
    /// Index relative to the start of the checked range
    pub at_index: usize,
    /// Recomputed digest
    pub expected: Digest,
    /// Digest found in the record
    pub stored: Digest,
}

/// Writing half of the chain: extends the tip one record at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAccumulator {
    tip: Digest,
    committed: u64,
}

impl ChainAccumulator {
    /// Start a chain at `genesis`.
    pub fn new(genesis: Digest) -> Self {
        Self {
            tip: genesis,
            committed: 0,
        }
    }

    /// Digest of the most recently committed record, or the genesis.
    pub fn tip(&self) -> Digest {
        self.tip
    }

    /// Records committed since the genesis.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Commit one link and return its digest.
    pub fn extend(&mut self, source_id: u64, target_offset: u64) -> Digest {
        self.tip = chain_digest(&self.tip, source_id, target_offset);
        self.committed += 1;
        self.tip
    }

    /// Commit `record` and store its digest in it.
    pub fn extend_record(&mut self, record: &mut ControlFlowRecord) {
        record.digest = self.extend(record.source_id, record.target_offset);
    }
}

/// Checking half of the chain: advances an anchor over records that verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerifier {
    anchor: Digest,
    verified: u64,
}

impl ChainVerifier {
    /// Start verifying at `genesis`.
    pub fn new(genesis: Digest) -> Self {
        Self {
            anchor: genesis,
            verified: 0,
        }
    }

    /// Digest of the last verified record, or the genesis.
    pub fn anchor(&self) -> Digest {
        self.anchor
    }

    /// Records verified since the genesis.
    pub fn verified(&self) -> u64 {
        self.verified
    }

    /// Check the next record. `index` is only used to label a failure.
    ///
    /// The anchor moves only on success.
    pub fn verify_next(
        &mut self,
        record: &ControlFlowRecord,
        index: usize,
    ) -> Result<(), IntegrityViolation> {
        let expected = chain_digest(&self.anchor, record.source_id, record.target_offset);
        if expected != record.digest {
            return Err(IntegrityViolation {
                at_index: index,
                expected,
                stored: record.digest,
            });
        }
        self.anchor = expected;
        self.verified += 1;
        Ok(())
    }
}
