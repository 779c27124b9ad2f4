// Proof of Work implementation

use crate::core::{sha256, Block, Hash256};
use crate::error::{LedgerError, Result};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Every nonce `solve` tries, in order
pub const NONCE_RANGE: RangeInclusive<i64> = 0..=i64::MAX;

/// Difficulty target: a hash is valid when, read as a big-endian integer,
/// it is below 2^(256 - bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub bits: u32,
    value: Hash256,
}

impl Target {
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits == 0 || bits >= 256 {
            return Err(LedgerError::ConsensusFailure(format!(
                "difficulty must be between 1 and 255 bits, got {}",
                bits
            )));
        }

        let shift = (256 - bits) as usize;
        let mut value = [0u8; 32];
        value[31 - shift / 8] = 1 << (shift % 8);

        Ok(Self {
            bits,
            value: Hash256::new(value),
        })
    }

    /// Target as a 256-bit big-endian value
    pub fn to_hash256(&self) -> Hash256 {
        self.value
    }

    /// Check if a hash meets this target (hash < target)
    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        *hash < self.value
    }
}

/// Proof-of-work engine with a fixed difficulty
#[derive(Debug, Clone, Copy)]
pub struct ProofOfWork {
    target: Target,
}

impl ProofOfWork {
    pub fn new(bits: u32) -> Result<Self> {
        Ok(Self {
            target: Target::from_bits(bits)?,
        })
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Digest input: prev hash || tx digest || timestamp || bits || nonce,
    /// integers as 8-byte big-endian
    fn prepare_data(&self, block: &Block, tx_digest: &Hash256, nonce: i64) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 32 + 8 * 3);
        data.extend_from_slice(block.prev_block_hash.as_bytes());
        data.extend_from_slice(tx_digest.as_bytes());
        data.extend_from_slice(&block.timestamp.to_be_bytes());
        data.extend_from_slice(&(self.target.bits as i64).to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    /// Hash of `block`'s header fields with the given nonce
    pub fn compute_hash(&self, block: &Block, nonce: i64) -> Hash256 {
        sha256(&self.prepare_data(block, &block.hash_transactions(), nonce))
    }

    /// Search nonces from 0 upwards for a hash below the target.
    /// `cancel` is checked before every trial.
    pub fn solve(&self, block: &Block, cancel: Option<&AtomicBool>) -> Result<MiningResult> {
        let start_time = Instant::now();
        let tx_digest = block.hash_transactions();
        let mut attempts = 0u64;

        log::info!("Mining block at height {} ({} transactions)", block.height, block.transactions.len());

        for nonce in NONCE_RANGE {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                log::info!("Mining at height {} cancelled after {} attempts", block.height, attempts);
                return Err(LedgerError::MiningCancelled);
            }

            let hash = sha256(&self.prepare_data(block, &tx_digest, nonce));
            attempts += 1;

            if self.target.is_met_by(&hash) {
                let result = MiningResult {
                    nonce,
                    hash,
                    attempts,
                    duration: start_time.elapsed(),
                };
                log::info!("Mined block {} in {} attempts ({:.1} H/s)", hash, attempts, result.hash_rate());
                return Ok(result);
            }

            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!("Mining attempts: {} ({:.1} KH/s)",
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }
        }

        Err(LedgerError::ConsensusFailure(format!(
            "nonce space exhausted at {} difficulty bits",
            self.target.bits
        )))
    }

    /// Recompute the hash with the stored nonce; true when it matches the
    /// stored hash and meets the target
    pub fn validate(&self, block: &Block) -> bool {
        let hash = self.compute_hash(block, block.nonce);
        hash == block.hash && self.target.is_met_by(&hash)
    }
}

/// Mining result
#[derive(Debug)]
pub struct MiningResult {
    pub nonce: i64,
    pub hash: Hash256,
    pub attempts: u64,
    pub duration: Duration,
}

impl MiningResult {
    /// Calculate hash rate (hashes per second)
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64().max(f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Address, Transaction};

    const TEST_BITS: u32 = 8;

    fn candidate() -> Block {
        let coinbase = Transaction::new_coinbase(&Address::from_public_key(b"miner"), "");
        Block::candidate(vec![coinbase], Hash256::new([3; 32]), 1)
    }

    #[test]
    fn test_target_from_bits() {
        let target = Target::from_bits(24).unwrap().to_hash256();
        let mut expected = [0u8; 32];
        expected[2] = 0x01;
        assert_eq!(target, Hash256::new(expected));

        let target = Target::from_bits(1).unwrap().to_hash256();
        assert_eq!(target.as_bytes()[0], 0x80);
    }

    #[test]
    fn test_target_rejects_bad_bits() {
        assert!(Target::from_bits(0).is_err());
        assert!(Target::from_bits(256).is_err());
    }

    #[test]
    fn test_target_validation() {
        let target = Target::from_bits(TEST_BITS).unwrap();

        assert!(target.is_met_by(&Hash256::zero()));
        assert!(!target.is_met_by(&Hash256::new([0xff; 32])));
        assert!(!target.is_met_by(&target.to_hash256()));
    }

    #[test]
    fn test_nonce_range_covers_signed_width() {
        assert_eq!(*NONCE_RANGE.start(), 0);
        assert_eq!(*NONCE_RANGE.end(), i64::MAX);
        assert!(NONCE_RANGE.contains(&i64::MAX));

        let pow = ProofOfWork::new(TEST_BITS).unwrap();
        let block = candidate();
        assert_eq!(pow.compute_hash(&block, i64::MAX), pow.compute_hash(&block, i64::MAX));
    }

    #[test]
    fn test_solve_and_validate() {
        let pow = ProofOfWork::new(TEST_BITS).unwrap();
        let mut block = candidate();

        let result = pow.solve(&block, None).unwrap();
        assert!(pow.target().is_met_by(&result.hash));
        assert_eq!(result.hash, pow.compute_hash(&block, result.nonce));

        block.seal(result.nonce, result.hash);
        assert!(pow.validate(&block));
    }

    #[test]
    fn test_validate_rejects_tampering() {
        let pow = ProofOfWork::new(TEST_BITS).unwrap();
        let mut block = candidate();
        let result = pow.solve(&block, None).unwrap();
        block.seal(result.nonce, result.hash);

        let mut wrong_nonce = block.clone();
        wrong_nonce.nonce += 1;
        assert!(!pow.validate(&wrong_nonce));

        let mut wrong_time = block.clone();
        wrong_time.timestamp += 1;
        assert!(!pow.validate(&wrong_time));

        let mut wrong_txs = block.clone();
        wrong_txs.transactions[0].outputs[0].value += 1;
        assert!(!pow.validate(&wrong_txs));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let pow = ProofOfWork::new(TEST_BITS).unwrap();
        let block = candidate();

        assert_eq!(pow.compute_hash(&block, 17), pow.compute_hash(&block, 17));
        assert_ne!(pow.compute_hash(&block, 17), pow.compute_hash(&block, 18));
    }

    #[test]
    fn test_solve_cancelled() {
        let pow = ProofOfWork::new(TEST_BITS).unwrap();
        let cancel = AtomicBool::new(true);

        let result = pow.solve(&candidate(), Some(&cancel));
        assert!(matches!(result, Err(LedgerError::MiningCancelled)));
    }
}
