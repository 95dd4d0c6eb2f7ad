//! Shared types for the shard synchronization node.
//!
//! This crate holds everything both sides of the sync protocols agree on:
//! - **Core identifiers**: contract/miner addresses, kv indices, shard ids
//! - **Commitments**: the 32-byte truncated-root-plus-flags slot identity
//! - **Slot encodings**: the encoding kinds a peer may store blobs under
//! - **Wire codec**: length-prefixed SCALE frames for the two request
//!   protocols and the shard advertisement (see [`codec`])
//! - **Chunk merkle root**: the blake3 root used by the dev prover
//!   (see [`merkle`])
//!
//! # Protocol identifiers
//!
//! Both request protocols are multiplexed on chain-scoped ids:
//! `/ethstorage/blobs_by_range/<chainId>/1` and
//! `/ethstorage/blobs_by_list/<chainId>/1`, with the chain id rendered in
//! decimal. The advertisement handshake uses [`advert_protocol`] and the
//! well-known key [`SHARD_ADVERTISEMENT_KEY`].

pub mod codec;
pub mod merkle;

pub use codec::{
    read_frame, write_frame, BlobPayload, BlobsByListRequest, BlobsByRangeRequest, BlobsResponse,
    WireError, MAX_FRAME_SIZE, STATUS_BAD_REQUEST, STATUS_OK,
};
pub use merkle::chunk_root;

use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Core Identifiers
// ============================================================================

/// Global index of a KV slot. Shard `S` with `E` entries per shard owns
/// indices `[S*E, (S+1)*E)`.
pub type KvIndex = u64;

/// Shard identifier within a contract.
pub type ShardId = u64;

/// A 20-byte account identifier: a storage contract or a miner.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize,
    Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut out = [0u8; 20];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Address(out))
    }
}

// ============================================================================
// Commitments
// ============================================================================

/// Number of leading commitment bytes that hold the truncated blob root.
/// The byte at this offset carries the flag bits.
pub const HASH_SIZE_IN_CONTRACT: usize = 24;

/// Flag bit marking a slot as an empty placeholder (bit 7 of the flag byte).
pub const EMPTY_FILLING_MASK: u8 = 0b1000_0000;

/// The 32-byte per-slot commitment reported by the chain view.
///
/// Layout: bytes `[0..HASH_SIZE_IN_CONTRACT)` are the blob root truncated,
/// byte `[HASH_SIZE_IN_CONTRACT]` carries flag bits, the rest is reserved.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize,
)]
pub struct Commitment(pub [u8; 32]);

impl Commitment {
    /// Build a commitment from a full 32-byte root, truncating it and
    /// setting the empty-filling mask iff the slot is an empty placeholder.
    pub fn from_root(root: &[u8; 32], empty: bool) -> Self {
        let mut out = [0u8; 32];
        out[..HASH_SIZE_IN_CONTRACT].copy_from_slice(&root[..HASH_SIZE_IN_CONTRACT]);
        if empty {
            out[HASH_SIZE_IN_CONTRACT] |= EMPTY_FILLING_MASK;
        }
        Commitment(out)
    }

    /// The commitment of an empty slot: all-zero root, mask bit set.
    pub fn empty_marker() -> Self {
        let mut out = [0u8; 32];
        out[HASH_SIZE_IN_CONTRACT] = EMPTY_FILLING_MASK;
        Commitment(out)
    }

    /// The truncated-root portion of the commitment.
    pub fn root_part(&self) -> &[u8] {
        &self.0[..HASH_SIZE_IN_CONTRACT]
    }

    pub fn is_empty_marker(&self) -> bool {
        self.0[HASH_SIZE_IN_CONTRACT] & EMPTY_FILLING_MASK != 0
    }

    /// Whether a full 32-byte root matches this commitment's truncated root.
    pub fn matches_root(&self, root: &[u8; 32]) -> bool {
        self.root_part() == &root[..HASH_SIZE_IN_CONTRACT]
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

// ============================================================================
// Slot Encodings
// ============================================================================

/// How a stored blob is masked on disk. Peers may store under a different
/// encoding than the local node; payloads carry the encoding on the wire as
/// a `u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncodingKind {
    None,
    Keccak256,
    Ethash,
    BlobPoseidon,
}

impl EncodingKind {
    pub fn as_u64(&self) -> u64 {
        match self {
            EncodingKind::None => 0,
            EncodingKind::Keccak256 => 1,
            EncodingKind::Ethash => 2,
            EncodingKind::BlobPoseidon => 3,
        }
    }

    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(EncodingKind::None),
            1 => Some(EncodingKind::Keccak256),
            2 => Some(EncodingKind::Ethash),
            3 => Some(EncodingKind::BlobPoseidon),
            _ => None,
        }
    }
}

impl fmt::Display for EncodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncodingKind::None => "none",
            EncodingKind::Keccak256 => "keccak-256",
            EncodingKind::Ethash => "ethash",
            EncodingKind::BlobPoseidon => "blob-poseidon",
        };
        f.write_str(name)
    }
}

impl FromStr for EncodingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(EncodingKind::None),
            "keccak-256" | "keccak256" => Ok(EncodingKind::Keccak256),
            "ethash" => Ok(EncodingKind::Ethash),
            "blob-poseidon" => Ok(EncodingKind::BlobPoseidon),
            other => Err(format!("unknown encoding kind: {other}")),
        }
    }
}

// ============================================================================
// Shard Advertisement
// ============================================================================

/// Well-known key under which a peer advertises its shard capability.
pub const SHARD_ADVERTISEMENT_KEY: &str = "ethstorage";

/// One advertisement entry: the shards a peer serves for one contract.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ContractShards {
    pub contract: Address,
    pub shard_ids: Vec<ShardId>,
}

/// Parsed advertisement: contract -> set of shards, deterministic order.
pub type ShardMap = BTreeMap<Address, BTreeSet<ShardId>>;

/// Convert wire advertisement entries into the map form used by the peer
/// table. Duplicate contracts merge; duplicate shard ids collapse.
pub fn to_shard_map(entries: &[ContractShards]) -> ShardMap {
    let mut map = ShardMap::new();
    for entry in entries {
        map.entry(entry.contract)
            .or_default()
            .extend(entry.shard_ids.iter().copied());
    }
    map
}

/// Convert a shard map back into wire advertisement entries.
pub fn to_contract_shards(map: &ShardMap) -> Vec<ContractShards> {
    map.iter()
        .map(|(contract, shards)| ContractShards {
            contract: *contract,
            shard_ids: shards.iter().copied().collect(),
        })
        .collect()
}

// ============================================================================
// Protocol Identifiers
// ============================================================================

/// Protocol id for range requests, scoped to a chain.
pub fn blobs_by_range_protocol(chain_id: u64) -> String {
    format!("/ethstorage/blobs_by_range/{chain_id}/1")
}

/// Protocol id for list requests, scoped to a chain.
pub fn blobs_by_list_protocol(chain_id: u64) -> String {
    format!("/ethstorage/blobs_by_list/{chain_id}/1")
}

/// Protocol id for the connect-time shard advertisement exchange.
pub fn advert_protocol(chain_id: u64) -> String {
    format!("/{SHARD_ADVERTISEMENT_KEY}/advert/{chain_id}/1")
}

// ============================================================================
// Time
// ============================================================================

/// Current Unix time in seconds; 0 on clock skew before the epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix time in milliseconds; 0 on clock skew before the epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Smoothing factor for peer round-trip-time tracking.
pub const LATENCY_EMA_ALPHA: f64 = 0.2;
