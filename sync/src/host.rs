//! Transport capability consumed by the sync core.
//!
//! The core needs exactly two things from the host: open a bidirectional
//! stream to a peer for a given protocol id, and close a peer it no longer
//! wants. Connect/disconnect notifications arrive as [`PeerEvent`]s on a
//! channel owned by the controller — the transport holds no reference back
//! into the sync client.

use anyhow::Result;
use async_trait::async_trait;
use common::ShardMap;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level peer identity (an Ed25519 public key in the iroh glue).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// A bidirectional stream to a peer. Implemented by QUIC stream pairs in
/// the node glue and by duplex pipes in the test host.
pub trait SyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SyncStream for T {}

pub type BoxedStream = Box<dyn SyncStream>;

/// Minimal host capability.
#[async_trait]
pub trait SyncHost: Send + Sync + 'static {
    /// Open a bidirectional stream to `peer` for `protocol`.
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxedStream>;

    /// Close the connection to `peer`. Used when a peer is rejected at
    /// connect time or dropped after repeated failures.
    async fn disconnect(&self, peer: PeerId);
}

/// Connection lifecycle notifications, emitted by the transport glue onto
/// the controller's channel. The advertisement travels with the connect
/// event; a peer whose advertisement could not be parsed never reaches the
/// core.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    Connected { peer: PeerId, shards: ShardMap },
    Disconnected { peer: PeerId },
}
