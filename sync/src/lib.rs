//! Peer-to-peer shard synchronization core.
//!
//! For every locally held shard this crate obtains the authoritative blob
//! content for every kv index from remote peers advertising the same shard,
//! verifies each blob against the on-chain commitment, re-encodes it to the
//! local encoding and writes it through the storage capability — tolerating
//! peers that lack some indices, peers that join or leave mid-sync,
//! persistent failures, and restarts.
//!
//! # Structure
//!
//! - [`storage`] / [`prover`] / [`host`]: capability traits for the
//!   external collaborators (storage engine, commitment prover, transport)
//! - [`task`]: per-shard work tracking (sub-task ranges + heal set)
//! - [`task_store`]: redb persistence of sync progress across restarts
//! - [`peers`]: connected-peer table with shard capability and in-flight
//!   accounting
//! - [`server`]: the serving side of the two request protocols
//! - [`client`]: the sync controller — dispatch, validation, empty-fill,
//!   completion tracking
//! - [`memstore`] / [`testnet`]: in-memory storage engine and in-memory
//!   host, used by the dev-mode node and the test suite
//!
//! # Concurrency model
//!
//! One controller task plus one i/o worker per outstanding request plus one
//! empty-fill worker per shard. All shared mutable state lives behind a
//! single coarse mutex that is never held across a suspension point: i/o
//! workers lock to reserve work, release before touching the network, and
//! re-lock to commit results.

pub mod client;
pub mod constants;
pub mod host;
pub mod memstore;
pub mod peers;
pub mod prover;
pub mod server;
pub mod storage;
pub mod task;
pub mod task_store;
pub mod testnet;

pub use client::{SyncClient, SyncConfig, SyncEvent};
pub use host::{PeerEvent, PeerId, SyncHost};
pub use prover::{MerkleProver, Prover};
pub use server::ShardServer;
pub use storage::{StorageManager, StorageReader};
pub use task_store::TaskStore;
