//! Merkle Roots for Ledger Rows
//!
//! Summarizes a set of row hashes in one digest. Retention checkpoints store
//! the root of the rows a sweep deleted, so an archived copy of those rows
//! can later be checked against the checkpoint.

use crate::audit::digest::HashDigest;

/// Parent of two nodes: `H(left || right)`.
fn parent(left: &HashDigest, right: &HashDigest) -> HashDigest {
    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(left.as_bytes());
    combined.extend_from_slice(right.as_bytes());
    HashDigest::of(&combined)
}

fn next_level(level: &[HashDigest]) -> Vec<HashDigest> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            // Odd node out is paired with itself
            let right = pair.get(1).unwrap_or(left);
            parent(left, right)
        })
        .collect()
}

/// Merkle root of `leaves` in order, or `None` when there are no leaves.
pub fn merkle_root(leaves: &[HashDigest]) -> Option<HashDigest> {
    if leaves.is_empty() {
        return None;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level.first().copied()
}
