// Merkle root over serialized transactions

use crate::core::{sha256, Hash256};

/// Root of the Merkle tree whose leaves are SHA256(item).
///
/// A level with an odd node count pairs its last node with itself. A single
/// item yields its leaf hash; no items yield the zero hash.
pub fn merkle_root<T: AsRef<[u8]>>(items: &[T]) -> Hash256 {
    if items.is_empty() {
        return Hash256::zero();
    }

    let mut level: Vec<Hash256> = items.iter().map(|item| sha256(item.as_ref())).collect();

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);

                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(left.as_bytes());
                combined[32..].copy_from_slice(right.as_bytes());
                sha256(&combined)
            })
            .collect();
    }

    level[0]
}
