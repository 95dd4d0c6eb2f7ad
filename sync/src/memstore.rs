//! In-memory storage engine.
//!
//! Implements the storage capability for the dev-mode node and the test
//! suite. It keeps two maps: the authoritative chain-view commitments
//! (what the real engine mirrors from L1) and the written slots. Supported
//! encodings are `None` (identity) and `Keccak256` (per-block XOR with a
//! keystream derived from the miner address and the kv index — an
//! involution, so decode equals encode).
//!
//! [`MemStorageReader`] is the serving-side counterpart: a read-only view
//! over canned payloads, used to stand in for a remote peer's store.

use crate::storage::{shard_of, shard_range, StorageManager, StorageReader};
use anyhow::{bail, Result};
use common::{Address, BlobPayload, Commitment, EncodingKind, KvIndex, ShardId};
use parking_lot::RwLock;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Mask or unmask a blob under the given encoding. XOR-based, so encoding
/// and decoding are the same operation.
pub fn mask_blob(
    kv_index: KvIndex,
    data: &[u8],
    miner: Address,
    encode_type: EncodingKind,
) -> Result<Vec<u8>> {
    match encode_type {
        EncodingKind::None => Ok(data.to_vec()),
        EncodingKind::Keccak256 => {
            let mut out = data.to_vec();
            for (block_idx, block) in out.chunks_mut(32).enumerate() {
                let mut hasher = Keccak256::new();
                hasher.update(miner.as_bytes());
                hasher.update(kv_index.to_le_bytes());
                hasher.update((block_idx as u64).to_le_bytes());
                let key = hasher.finalize();
                for (byte, k) in block.iter_mut().zip(key.iter()) {
                    *byte ^= k;
                }
            }
            Ok(out)
        }
        other => bail!("encoding {other} not supported by the in-memory engine"),
    }
}

#[derive(Clone, Debug)]
struct Slot {
    encoded: Vec<u8>,
    commit: Commitment,
}

/// Volatile slot store plus chain-view metadata.
pub struct MemStorage {
    contract: Address,
    shards: Vec<ShardId>,
    kv_entries: u64,
    max_kv_size: u64,
    chunk_size: u64,
    miner: Address,
    encoding: EncodingKind,
    last_kv: AtomicU64,
    chain_meta: RwLock<HashMap<KvIndex, Commitment>>,
    slots: RwLock<HashMap<KvIndex, Slot>>,
}

impl MemStorage {
    /// Create the store with every owned slot initialized to the empty
    /// marker (what a freshly created data file contains) and the chain
    /// view defaulting to empty markers until seeded.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contract: Address,
        shards: Vec<ShardId>,
        kv_entries: u64,
        max_kv_size: u64,
        chunk_size: u64,
        miner: Address,
        encoding: EncodingKind,
        last_kv: u64,
    ) -> Self {
        let mut slots = HashMap::new();
        let mut chain_meta = HashMap::new();
        for shard_id in &shards {
            let (start, end) = shard_range(*shard_id, kv_entries);
            for kv in start..end {
                slots.insert(
                    kv,
                    Slot {
                        encoded: Vec::new(),
                        commit: Commitment::empty_marker(),
                    },
                );
                chain_meta.insert(kv, Commitment::empty_marker());
            }
        }
        MemStorage {
            contract,
            shards,
            kv_entries,
            max_kv_size,
            chunk_size,
            miner,
            encoding,
            last_kv: AtomicU64::new(last_kv),
            chain_meta: RwLock::new(chain_meta),
            slots: RwLock::new(slots),
        }
    }

    fn owns(&self, kv_index: KvIndex) -> bool {
        self.shards.contains(&shard_of(kv_index, self.kv_entries))
    }

    /// Seed the chain view for one slot (the real engine learns these from
    /// the contract).
    pub fn set_chain_meta(&self, kv_index: KvIndex, commit: Commitment) {
        self.chain_meta.write().insert(kv_index, commit);
    }

    pub fn set_last_kv(&self, last_kv: u64) {
        self.last_kv.store(last_kv, Ordering::Relaxed);
    }
}

impl StorageReader for MemStorage {
    fn kv_entries(&self) -> u64 {
        self.kv_entries
    }

    fn max_kv_size(&self) -> u64 {
        self.max_kv_size
    }

    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn contract_address(&self) -> Address {
        self.contract
    }

    fn shards(&self) -> Vec<ShardId> {
        let mut shards = self.shards.clone();
        shards.sort_unstable();
        shards
    }

    fn shard_miner(&self, shard_id: ShardId) -> Option<Address> {
        self.shards.contains(&shard_id).then_some(self.miner)
    }

    fn shard_encode_type(&self, shard_id: ShardId) -> Option<EncodingKind> {
        self.shards.contains(&shard_id).then_some(self.encoding)
    }

    fn try_read_encoded(&self, kv_index: KvIndex, read_len: usize) -> Result<Option<Vec<u8>>> {
        let slots = self.slots.read();
        Ok(slots.get(&kv_index).map(|slot| {
            let mut data = slot.encoded.clone();
            data.truncate(read_len);
            data
        }))
    }

    fn try_read_meta(&self, kv_index: KvIndex) -> Result<Option<Commitment>> {
        Ok(self.chain_meta.read().get(&kv_index).copied())
    }
}

impl StorageManager for MemStorage {
    fn last_kv_index(&self) -> Result<u64> {
        Ok(self.last_kv.load(Ordering::Relaxed))
    }

    fn commit_blob(&self, kv_index: KvIndex, encoded: &[u8], commit: Commitment) -> Result<()> {
        if !self.owns(kv_index) {
            bail!("kv index {kv_index} outside locally held shards");
        }
        if encoded.len() > self.max_kv_size as usize {
            bail!(
                "encoded blob of {} bytes exceeds the {} byte slot size",
                encoded.len(),
                self.max_kv_size
            );
        }
        self.slots.write().insert(
            kv_index,
            Slot {
                encoded: encoded.to_vec(),
                commit,
            },
        );
        Ok(())
    }

    fn decode_kv(
        &self,
        kv_index: KvIndex,
        encoded: &[u8],
        _commit: Commitment,
        miner: Address,
        encode_type: EncodingKind,
    ) -> Result<Vec<u8>> {
        mask_blob(kv_index, encoded, miner, encode_type)
    }

    fn encode_kv(
        &self,
        kv_index: KvIndex,
        raw: &[u8],
        _commit: Commitment,
        miner: Address,
        encode_type: EncodingKind,
    ) -> Result<Vec<u8>> {
        mask_blob(kv_index, raw, miner, encode_type)
    }

    fn try_read(
        &self,
        kv_index: KvIndex,
        read_len: usize,
        commit: Commitment,
    ) -> Result<Option<Vec<u8>>> {
        let encoded = {
            let slots = self.slots.read();
            match slots.get(&kv_index) {
                Some(slot) if slot.commit == commit => slot.encoded.clone(),
                _ => return Ok(None),
            }
        };
        let mut raw = mask_blob(kv_index, &encoded, self.miner, self.encoding)?;
        raw.resize(read_len, 0);
        Ok(Some(raw))
    }
}

/// Read-only store serving canned payloads; stands in for a remote peer.
pub struct MemStorageReader {
    pub contract: Address,
    pub shards: Vec<ShardId>,
    pub kv_entries: u64,
    pub max_kv_size: u64,
    pub chunk_size: u64,
    pub miner: Address,
    pub encoding: EncodingKind,
    /// Blobs the peer actually holds; excluded indices are simply absent.
    pub payloads: HashMap<KvIndex, BlobPayload>,
}

impl StorageReader for MemStorageReader {
    fn kv_entries(&self) -> u64 {
        self.kv_entries
    }

    fn max_kv_size(&self) -> u64 {
        self.max_kv_size
    }

    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn contract_address(&self) -> Address {
        self.contract
    }

    fn shards(&self) -> Vec<ShardId> {
        self.shards.clone()
    }

    fn shard_miner(&self, _shard_id: ShardId) -> Option<Address> {
        Some(self.miner)
    }

    fn shard_encode_type(&self, _shard_id: ShardId) -> Option<EncodingKind> {
        Some(self.encoding)
    }

    fn try_read_encoded(&self, kv_index: KvIndex, read_len: usize) -> Result<Option<Vec<u8>>> {
        Ok(self.payloads.get(&kv_index).map(|payload| {
            let mut data = payload.encoded_blob.clone();
            data.truncate(read_len);
            data
        }))
    }

    fn try_read_meta(&self, kv_index: KvIndex) -> Result<Option<Commitment>> {
        Ok(self.payloads.get(&kv_index).map(|p| p.blob_commit))
    }
}
