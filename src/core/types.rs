// Basic types for the ledger

use std::fmt;

/// 256-bit hash type (32 bytes)
/// Used for block hashes, transaction IDs, and Merkle roots.
/// Ordering compares bytes big-endian, i.e. as an unsigned 256-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// Create a new Hash256 from a byte array
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a Hash256 from a slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, String> {
        if slice.len() != 32 {
            return Err(format!("Invalid hash length: expected 32, got {}", slice.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the hash as a byte slice
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Zero hash, the genesis block's previous hash
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, String> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| format!("Invalid hex string: {}", e))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash256_zero() {
        let zero = Hash256::zero();
        assert_eq!(zero.as_bytes(), &[0u8; 32]);
        assert!(zero.is_zero());
        assert!(!Hash256::new([1u8; 32]).is_zero());
    }

    #[test]
    fn test_hash256_hex() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hash = Hash256::new(bytes);

        let hex = hash.to_hex();
        assert!(hex.starts_with("ab"));
        assert_eq!(Hash256::from_hex(&hex).unwrap(), hash);
        assert!(Hash256::from_hex("abcd").is_err());
    }

    #[test]
    fn test_hash256_orders_as_big_endian_integer() {
        let mut small = [0u8; 32];
        small[31] = 0xff;
        let mut large = [0u8; 32];
        large[0] = 0x01;

        assert!(Hash256::new(small) < Hash256::new(large));
    }
}
