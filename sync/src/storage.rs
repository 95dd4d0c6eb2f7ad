//! Storage engine capability.
//!
//! The sync core never touches disk formats directly; it consumes the
//! operations below. The production engine and the in-memory engine in
//! [`crate::memstore`] both satisfy them, which is what lets the test suite
//! drive the full sync path without a real data file.

use anyhow::Result;
use common::{Address, Commitment, EncodingKind, KvIndex, ShardId};

/// Read-only view of the slot store — everything the serving side of the
/// protocols needs.
pub trait StorageReader: Send + Sync {
    /// Entries per shard; shard `S` owns `[S * kv_entries, (S+1) * kv_entries)`.
    fn kv_entries(&self) -> u64;

    /// Maximum decoded blob size of one slot.
    fn max_kv_size(&self) -> u64;

    /// Chunk size of the commitment layout (`max_kv_size / chunk_size`
    /// chunks per slot).
    fn chunk_size(&self) -> u64;

    /// The storage contract these shards belong to.
    fn contract_address(&self) -> Address;

    /// Locally held shard ids, ascending.
    fn shards(&self) -> Vec<ShardId>;

    /// Miner address a shard's blobs are encoded against, if the shard is
    /// held locally.
    fn shard_miner(&self, shard_id: ShardId) -> Option<Address>;

    /// Encoding the shard's blobs are stored under locally.
    fn shard_encode_type(&self, shard_id: ShardId) -> Option<EncodingKind>;

    /// Read a slot's blob still in the stored encoding, truncated to
    /// `read_len`. `None` if the slot is not populated (excluded index).
    fn try_read_encoded(&self, kv_index: KvIndex, read_len: usize) -> Result<Option<Vec<u8>>>;

    /// The commitment the chain view reports for a slot. `None` outside the
    /// locally held shards.
    fn try_read_meta(&self, kv_index: KvIndex) -> Result<Option<Commitment>>;
}

/// Full storage capability consumed by the sync client.
pub trait StorageManager: StorageReader {
    /// Highest kv index the chain has populated; every slot at or beyond it
    /// is an empty placeholder.
    fn last_kv_index(&self) -> Result<u64>;

    /// Write an encoded blob and its commitment. Idempotent for identical
    /// commitments.
    fn commit_blob(&self, kv_index: KvIndex, encoded: &[u8], commit: Commitment) -> Result<()>;

    /// Unmask a blob from `encode_type` back to raw bytes.
    fn decode_kv(
        &self,
        kv_index: KvIndex,
        encoded: &[u8],
        commit: Commitment,
        miner: Address,
        encode_type: EncodingKind,
    ) -> Result<Vec<u8>>;

    /// Mask raw bytes under `encode_type` for storage.
    fn encode_kv(
        &self,
        kv_index: KvIndex,
        raw: &[u8],
        commit: Commitment,
        miner: Address,
        encode_type: EncodingKind,
    ) -> Result<Vec<u8>>;

    /// Read a slot decoded to raw bytes, verifying the stored commitment
    /// equals `commit`. `None` when the slot is absent or the commitment
    /// does not match.
    fn try_read(&self, kv_index: KvIndex, read_len: usize, commit: Commitment)
        -> Result<Option<Vec<u8>>>;
}

/// First and one-past-last kv index of a shard.
pub fn shard_range(shard_id: ShardId, kv_entries: u64) -> (KvIndex, KvIndex) {
    (shard_id * kv_entries, (shard_id + 1) * kv_entries)
}

/// Shard owning a kv index.
pub fn shard_of(kv_index: KvIndex, kv_entries: u64) -> ShardId {
    kv_index / kv_entries
}
