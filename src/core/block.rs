// Block data structures

use crate::core::serialize::{read_hash, read_i64, read_len, read_u64, write_varint};
use crate::core::{merkle_root, Hash256, Serializable, Transaction};
use std::io::{Cursor, Read};
use std::time::{SystemTime, UNIX_EPOCH};

/// Block - an ordered batch of transactions sealed by proof-of-work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Creation time (Unix seconds)
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    /// Hash of the parent block (zero for genesis)
    pub prev_block_hash: Hash256,
    /// Proof-of-work digest
    pub hash: Hash256,
    pub nonce: i64,
    pub height: u64,
}

impl Block {
    /// Unsealed candidate block; hash and nonce are set by `seal`
    pub fn candidate(transactions: Vec<Transaction>, prev_block_hash: Hash256, height: u64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        Self {
            timestamp,
            transactions,
            prev_block_hash,
            hash: Hash256::zero(),
            nonce: 0,
            height,
        }
    }

    /// Unsealed genesis block holding only the coinbase
    pub fn genesis_candidate(coinbase: Transaction) -> Self {
        Self::candidate(vec![coinbase], Hash256::zero(), 0)
    }

    /// Attach a proof-of-work solution
    pub fn seal(&mut self, nonce: i64, hash: Hash256) {
        self.nonce = nonce;
        self.hash = hash;
    }

    /// Merkle root of the serialized transactions
    pub fn hash_transactions(&self) -> Hash256 {
        let serialized: Vec<Vec<u8>> = self.transactions.iter().map(|tx| tx.serialize()).collect();
        merkle_root(&serialized)
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_zero()
    }

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> std::io::Result<Self> {
        let timestamp = read_i64(reader)?;

        let tx_count = read_len(reader)?;
        let mut transactions = Vec::with_capacity(tx_count.min(1024));
        for _ in 0..tx_count {
            transactions.push(Transaction::from_reader(reader)?);
        }

        Ok(Self {
            timestamp,
            transactions,
            prev_block_hash: read_hash(reader)?,
            hash: read_hash(reader)?,
            nonce: read_i64(reader)?,
            height: read_u64(reader)?,
        })
    }
}

impl Serializable for Block {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&self.timestamp.to_le_bytes());

        write_varint(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write_to(&mut buf);
        }

        buf.extend_from_slice(self.prev_block_hash.as_bytes());
        buf.extend_from_slice(self.hash.as_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());

        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor::new(data);
        let block = Self::from_reader(&mut cursor).map_err(|e| e.to_string())?;
        if cursor.position() as usize != data.len() {
            return Err("Trailing bytes after block".to_string());
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Address;

    fn reward() -> Transaction {
        Transaction::new_coinbase(&Address::from_public_key(b"miner"), "")
    }

    #[test]
    fn test_block_serialization() {
        let mut block = Block::candidate(vec![reward(), reward()], Hash256::new([7; 32]), 3);
        block.seal(42, Hash256::new([9; 32]));

        let decoded = Block::deserialize(&block.serialize()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_block_deserialize_truncated() {
        let block = Block::genesis_candidate(reward());
        let bytes = block.serialize();

        assert!(Block::deserialize(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_genesis_candidate() {
        let genesis = Block::genesis_candidate(reward());

        assert!(genesis.is_genesis());
        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_coinbase());
    }

    #[test]
    fn test_hash_transactions_single() {
        let tx = reward();
        let block = Block::genesis_candidate(tx.clone());

        assert_eq!(block.hash_transactions(), crate::core::sha256(&tx.serialize()));
    }

    #[test]
    fn test_hash_transactions_depends_on_content() {
        let a = Block::candidate(vec![reward()], Hash256::zero(), 0);
        let b = Block::candidate(vec![reward()], Hash256::zero(), 0);

        assert_ne!(a.hash_transactions(), b.hash_transactions());
    }
}
