// Hashing utilities

use sha2::{Sha256, Digest};
use crate::core::Hash256;

/// Length of the key-hash that locks an output
pub const KEY_HASH_LEN: usize = 20;

/// Length of the address checksum
pub const CHECKSUM_LEN: usize = 4;

/// Single SHA256 hash
pub fn sha256(data: &[u8]) -> Hash256 {
    Hash256::new(Sha256::digest(data).into())
}

/// SHA256(SHA256(data))
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Key-hash of a public key: double SHA256 truncated to 20 bytes.
/// Stands in for RIPEMD160(SHA256(pubkey)).
pub fn hash_pub_key(pub_key: &[u8]) -> [u8; KEY_HASH_LEN] {
    let digest = double_sha256(pub_key);
    let mut result = [0u8; KEY_HASH_LEN];
    result.copy_from_slice(&digest[..KEY_HASH_LEN]);
    result
}

/// First four bytes of the double SHA256 of a payload
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = double_sha256(payload);
    let mut result = [0u8; CHECKSUM_LEN];
    result.copy_from_slice(&digest[..CHECKSUM_LEN]);
    result
}
