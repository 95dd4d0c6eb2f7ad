//! Node configuration.
//!
//! Everything is settable as a flag or an environment variable. The slot
//! geometry flags feed the dev-mode in-memory engine; a production build
//! wires a real storage engine behind the same capability trait and
//! ignores them.

use clap::Parser;
use common::{Address, EncodingKind};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use sync::client::SyncConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "shard-node",
    version,
    about = "Sharded blob-storage node: p2p shard synchronization"
)]
pub struct NodeConfig {
    /// Data directory (keypair, task store)
    #[arg(long, env = "DATA_DIR", default_value = "data/node")]
    pub datadir: PathBuf,

    /// Chain id scoping the sync protocol ids
    #[arg(long, env = "CHAIN_ID", default_value_t = 3333)]
    pub chain_id: u64,

    /// Storage contract address
    #[arg(
        long,
        env = "CONTRACT",
        default_value = "0x0000000000000000000000000000000003330001"
    )]
    pub contract: Address,

    /// Locally held shard ids, comma separated
    #[arg(long, env = "SHARDS", value_delimiter = ',', default_value = "0")]
    pub shards: Vec<u64>,

    /// Entries per shard
    #[arg(long, env = "KV_ENTRIES", default_value_t = 1 << 12)]
    pub kv_entries: u64,

    /// Maximum decoded blob size of one slot, in bytes
    #[arg(long, env = "KV_SIZE", default_value_t = 1 << 17)]
    pub kv_size: u64,

    /// Chunk size of the commitment layout, in bytes
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 1 << 12)]
    pub chunk_size: u64,

    /// Last populated kv index according to the chain view (dev engine)
    #[arg(long, env = "LAST_KV_INDEX", default_value_t = 0)]
    pub last_kv_index: u64,

    /// Local slot encoding: none | keccak-256
    #[arg(long, env = "ENCODING", default_value = "none")]
    pub encoding: EncodingKind,

    /// Miner address local blobs are encoded against
    #[arg(
        long,
        env = "MINER",
        default_value = "0x0000000000000000000000000000000000000000"
    )]
    pub miner: Address,

    /// UDP port for the QUIC endpoint
    #[arg(long, env = "P2P_PORT", default_value_t = 9222)]
    pub p2p_port: u16,

    /// Bootstrap peers to dial at startup (JSON endpoint addresses)
    #[arg(long, env = "BOOTSTRAP", value_delimiter = ';')]
    pub bootstrap: Vec<String>,

    /// HTTP status endpoint bind address
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:8080")]
    pub http_addr: SocketAddr,

    /// Maximum peers tracked by the sync client
    #[arg(long, env = "MAX_PEERS", default_value_t = 30)]
    pub max_peers: usize,

    /// Largest span covered by one sub-task
    #[arg(long, env = "MAX_SUBTASK_SPAN", default_value_t = 4096)]
    pub max_subtask_span: u64,

    /// Per-request deadline in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    pub request_timeout_secs: u64,
}

impl NodeConfig {
    pub fn sync_config(&self) -> SyncConfig {
        let mut cfg = SyncConfig::new(self.chain_id);
        cfg.max_peers = self.max_peers;
        cfg.max_subtask_span = self.max_subtask_span;
        cfg.request_timeout = Duration::from_secs(self.request_timeout_secs);
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let cfg = NodeConfig::parse_from(["shard-node"]);
        assert_eq!(cfg.chain_id, 3333);
        assert_eq!(cfg.shards, vec![0]);
        assert_eq!(cfg.encoding, EncodingKind::None);
    }

    #[test]
    fn test_shard_list_and_encoding_parse() {
        let cfg = NodeConfig::parse_from([
            "shard-node",
            "--shards",
            "0,2,5",
            "--encoding",
            "keccak-256",
            "--contract",
            "0x1111111111111111111111111111111111111111",
        ]);
        assert_eq!(cfg.shards, vec![0, 2, 5]);
        assert_eq!(cfg.encoding, EncodingKind::Keccak256);
        assert_eq!(cfg.contract.as_bytes()[0], 0x11);
    }
}
