//! Commitment prover capability.

use anyhow::Result;
use common::merkle::chunk_root;

/// Pure function from blob bytes and chunk layout to the root hash the
/// on-chain commitment truncates. The production node plugs a KZG prover in
/// here; the dev node and the test suite use [`MerkleProver`].
pub trait Prover: Send + Sync {
    fn get_root(&self, blob: &[u8], chunks_per_kv: u64, chunk_size: u64) -> Result<[u8; 32]>;
}

/// BLAKE3 chunk-merkle prover.
#[derive(Clone, Copy, Debug, Default)]
pub struct MerkleProver;

impl Prover for MerkleProver {
    fn get_root(&self, blob: &[u8], chunks_per_kv: u64, chunk_size: u64) -> Result<[u8; 32]> {
        Ok(chunk_root(blob, chunks_per_kv, chunk_size))
    }
}
