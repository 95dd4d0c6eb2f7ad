//! BLAKE3 chunk merkle root for blob commitments.
//!
//! The dev prover identifies a blob by the merkle root of its fixed-size
//! chunks. Both the serving and the syncing side must agree on the exact
//! construction, so it lives here:
//!
//! - The blob is split into `chunks_per_kv` chunks of `chunk_size` bytes,
//!   zero-padded where the blob is shorter.
//! - Leaf hash = BLAKE3(0x00 || chunk), node hash = BLAKE3(0x01 || l || r).
//! - Non-power-of-two leaf counts are padded by duplicating the last leaf.

/// Domain separator for leaf hashes (prevents second-preimage attacks)
const LEAF_DOMAIN: u8 = 0x00;

/// Domain separator for internal node hashes
const NODE_DOMAIN: u8 = 0x01;

fn hash_leaf(chunk: &[u8], pad_to: usize) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_DOMAIN]);
    hasher.update(chunk);
    if chunk.len() < pad_to {
        hasher.update(&vec![0u8; pad_to - chunk.len()]);
    }
    *hasher.finalize().as_bytes()
}

fn hash_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_DOMAIN]);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Compute the chunk merkle root of a blob.
///
/// `blob` may be shorter than `chunks_per_kv * chunk_size`; the missing
/// tail is treated as zeros. Returns the all-zero root for a zero chunk
/// count.
pub fn chunk_root(blob: &[u8], chunks_per_kv: u64, chunk_size: u64) -> [u8; 32] {
    if chunks_per_kv == 0 || chunk_size == 0 {
        return [0u8; 32];
    }

    let chunk_size = chunk_size as usize;
    let mut leaves: Vec<[u8; 32]> = (0..chunks_per_kv as usize)
        .map(|i| {
            let start = (i * chunk_size).min(blob.len());
            let end = ((i + 1) * chunk_size).min(blob.len());
            hash_leaf(&blob[start..end], chunk_size)
        })
        .collect();

    if leaves.len() == 1 {
        return leaves[0];
    }

    // Pad to power of 2 by duplicating last leaf
    let tree_size = leaves.len().next_power_of_two();
    while leaves.len() < tree_size {
        leaves.push(*leaves.last().expect("leaves is non-empty"));
    }

    let mut level = leaves;
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_node(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}
