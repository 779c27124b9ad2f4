// Base58Check addresses

use crate::core::hash::{checksum, hash_pub_key, CHECKSUM_LEN, KEY_HASH_LEN};
use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version byte prefixed to every key-hash
pub const ADDRESS_VERSION: u8 = 0x00;

const DECODED_LEN: usize = 1 + KEY_HASH_LEN + CHECKSUM_LEN;

/// Address: base58(version || key-hash || checksum)
///
/// Always well-formed: the only constructors either derive it or verify the
/// checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    encoded: String,
    key_hash: [u8; KEY_HASH_LEN],
}

impl Address {
    /// Create address from a key-hash
    pub fn from_key_hash(key_hash: &[u8; KEY_HASH_LEN]) -> Self {
        let mut payload = Vec::with_capacity(DECODED_LEN);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(key_hash);
        let check = checksum(&payload);
        payload.extend_from_slice(&check);

        Self {
            encoded: bs58::encode(payload).into_string(),
            key_hash: *key_hash,
        }
    }

    /// Derive the address owning a raw public key
    pub fn from_public_key(pub_key: &[u8]) -> Self {
        Self::from_key_hash(&hash_pub_key(pub_key))
    }

    /// Decode and checksum-verify an address string
    pub fn parse(s: &str) -> Result<Self> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| LedgerError::InvalidAddress(format!("{}: {}", s, e)))?;

        if decoded.len() != DECODED_LEN {
            return Err(LedgerError::InvalidAddress(format!(
                "{}: expected {} bytes, got {}",
                s,
                DECODED_LEN,
                decoded.len()
            )));
        }

        let (payload, actual) = decoded.split_at(1 + KEY_HASH_LEN);
        if payload[0] != ADDRESS_VERSION {
            return Err(LedgerError::InvalidAddress(format!(
                "{}: unknown version {:#04x}",
                s, payload[0]
            )));
        }
        if checksum(payload).as_slice() != actual {
            return Err(LedgerError::InvalidAddress(format!("{}: checksum mismatch", s)));
        }

        let mut key_hash = [0u8; KEY_HASH_LEN];
        key_hash.copy_from_slice(&payload[1..]);

        Ok(Self {
            encoded: s.to_string(),
            key_hash,
        })
    }

    /// Whether a string is a well-formed address
    pub fn validate(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    /// Key-hash that outputs paid to this address are locked with
    pub fn key_hash(&self) -> &[u8; KEY_HASH_LEN] {
        &self.key_hash
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl FromStr for Address {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = LedgerError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> String {
        address.encoded
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let key_hash = [0x12; KEY_HASH_LEN];
        let address = Address::from_key_hash(&key_hash);

        let parsed = Address::parse(address.as_str()).unwrap();
        assert_eq!(parsed.key_hash(), &key_hash);
        assert_eq!(Address::from_key_hash(parsed.key_hash()), address);
        assert!(Address::validate(address.as_str()));
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let address = Address::from_key_hash(&[0x34; KEY_HASH_LEN]);

        let mut decoded = bs58::decode(address.as_str()).into_vec().unwrap();
        let last = decoded.len() - 1;
        decoded[last] ^= 0x01;
        let corrupted = bs58::encode(decoded).into_string();

        assert!(!Address::validate(&corrupted));
        assert!(matches!(
            Address::parse(&corrupted),
            Err(LedgerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(!Address::validate(""));
        assert!(!Address::validate("0OIl"));
        assert!(!Address::validate(&bs58::encode([0u8; 10]).into_string()));
    }

    #[test]
    fn test_serde_as_string() {
        let address = Address::from_public_key(b"some public key");
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{}\"", address));

        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
        assert!(serde_json::from_str::<Address>("\"notanaddress\"").is_err());
    }
}
