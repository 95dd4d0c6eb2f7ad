//! In-memory host for the test suite.
//!
//! Peers are entries in a handler table keyed by `(peer, protocol)`; an
//! opened stream is one side of a `tokio::io::duplex` pair with the peer's
//! handler spawned on the other side. Marking a peer down makes subsequent
//! opens fail the way a closed connection would.

use crate::host::{BoxedStream, PeerId, SyncHost};
use crate::server::ShardServer;
use crate::storage::StorageReader;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tracing::debug;

type HandlerFut = Pin<Box<dyn Future<Output = ()> + Send>>;
type StreamHandler = Arc<dyn Fn(DuplexStream) -> HandlerFut + Send + Sync>;

const STREAM_BUFFER: usize = 1 << 20;

/// Handler registry standing in for a real network.
#[derive(Default)]
pub struct TestNet {
    handlers: Mutex<HashMap<(PeerId, String), StreamHandler>>,
    down: Mutex<HashSet<PeerId>>,
}

impl TestNet {
    pub fn new() -> Arc<Self> {
        Arc::new(TestNet::default())
    }

    /// Register a raw stream handler for one `(peer, protocol)` pair.
    pub fn register(&self, peer: PeerId, protocol: &str, handler: StreamHandler) {
        self.handlers
            .lock()
            .insert((peer, protocol.to_string()), handler);
    }

    /// Wire a serving peer: a [`ShardServer`] over `storage` answering both
    /// sync protocols for `chain_id`.
    pub fn register_server(
        &self,
        peer: PeerId,
        chain_id: u64,
        storage: Arc<dyn StorageReader>,
        max_response_bytes: u64,
    ) {
        let server = ShardServer::new(storage, max_response_bytes);

        let range_server = server.clone();
        self.register(
            peer,
            &common::blobs_by_range_protocol(chain_id),
            Arc::new(move |mut stream| {
                let server = range_server.clone();
                Box::pin(async move {
                    if let Err(e) = server.handle_range_stream(&mut stream).await {
                        debug!(error = %e, "test range handler failed");
                    }
                }) as HandlerFut
            }),
        );

        self.register(
            peer,
            &common::blobs_by_list_protocol(chain_id),
            Arc::new(move |mut stream| {
                let server = server.clone();
                Box::pin(async move {
                    if let Err(e) = server.handle_list_stream(&mut stream).await {
                        debug!(error = %e, "test list handler failed");
                    }
                }) as HandlerFut
            }),
        );
    }

    /// Simulate a peer going away (or coming back): while down, every
    /// `open_stream` to it fails.
    pub fn set_down(&self, peer: PeerId, down: bool) {
        if down {
            self.down.lock().insert(peer);
        } else {
            self.down.lock().remove(&peer);
        }
    }
}

#[async_trait]
impl SyncHost for TestNet {
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxedStream> {
        if self.down.lock().contains(&peer) {
            bail!("peer {peer} is unreachable");
        }
        let handler = self
            .handlers
            .lock()
            .get(&(peer, protocol.to_string()))
            .cloned();
        let Some(handler) = handler else {
            bail!("peer {peer} does not speak {protocol}");
        };
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        tokio::spawn(handler(remote));
        Ok(Box::new(local))
    }

    async fn disconnect(&self, peer: PeerId) {
        self.set_down(peer, true);
    }
}
