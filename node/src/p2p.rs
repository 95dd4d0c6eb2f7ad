//! iroh transport glue for the sync core.
//!
//! The sync client only knows the [`SyncHost`] capability; this module
//! backs it with an iroh QUIC endpoint:
//!
//! - outbound streams go over pooled per-`(peer, protocol)` connections so
//!   repeated requests skip the QUIC handshake;
//! - the two sync protocols are served by [`SyncProtocolHandler`]s
//!   registered on the endpoint's router, one ALPN each, with a semaphore
//!   bounding concurrent stream handlers;
//! - the connect-time advertisement handshake runs on its own ALPN: the
//!   dialer sends its shard advertisement first, the acceptor answers with
//!   its own, and both sides emit `PeerConnected` / `PeerDisconnected`
//!   events onto the controller's channel. A peer whose advertisement is
//!   missing or malformed never reaches the sync core; its connection is
//!   closed on the spot.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use common::{read_frame, write_frame, ContractShards, now_secs};
use dashmap::DashMap;
use futures::future::FutureExt;
use iroh::endpoint::{Connection, Endpoint};
use iroh::protocol::AcceptError;
use iroh::SecretKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sync::host::{BoxedStream, PeerEvent, PeerId, SyncHost};
use sync::server::ShardServer;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{debug, trace, warn};

/// Pooled connections are reused for this long before a fresh dial.
const CONNECTION_TTL_SECS: u64 = 60;

/// Upper bound on concurrently served inbound sync streams.
const MAX_CONCURRENT_STREAM_HANDLERS: usize = 1000;

/// Deadline for the advertisement exchange after a connection opens.
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Largest advertisement frame accepted.
const MAX_ADVERT_FRAME: usize = 64 * 1024;

const CONNECT_RETRIES: u32 = 3;
const CONNECT_BACKOFF_MS: u64 = 500;

pub fn peer_id_of(key: &iroh::PublicKey) -> PeerId {
    PeerId(*key.as_bytes())
}

/// Load or generate the node's Ed25519 identity from `<datadir>/keypair.bin`.
pub async fn load_keypair(data_dir: &std::path::Path) -> Result<SecretKey> {
    let keypair_path = data_dir.join("keypair.bin");
    if keypair_path.exists() {
        let bytes = tokio::fs::read(&keypair_path).await?;
        anyhow::ensure!(
            bytes.len() == 32,
            "corrupted keypair file at {} (expected 32 bytes, got {}); delete it to regenerate",
            keypair_path.display(),
            bytes.len()
        );
        let key = SecretKey::try_from(&bytes[..])
            .map_err(|_| anyhow!("invalid keypair file at {}", keypair_path.display()))?;
        debug!(path = %keypair_path.display(), "Loaded existing keypair");
        return Ok(key);
    }

    let key = SecretKey::generate(&mut rand::rng());
    tokio::fs::write(&keypair_path, key.to_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(&keypair_path, perms) {
            warn!(path = %keypair_path.display(), error = %e, "Failed to restrict keypair permissions");
        }
    }
    debug!(path = %keypair_path.display(), "Generated new keypair");
    Ok(key)
}

/// The iroh-backed host capability: an address book learned from dials and
/// inbound handshakes, plus a TTL'd outbound connection pool.
pub struct P2pHost {
    endpoint: Endpoint,
    addrs: DashMap<PeerId, iroh::EndpointAddr>,
    /// Connections we accepted or dialed for the advertisement handshake;
    /// closing one of these is what disconnects a peer.
    advert_conns: DashMap<PeerId, Connection>,
    pool: RwLock<HashMap<(PeerId, String), (Connection, u64)>>,
}

impl P2pHost {
    pub fn new(endpoint: Endpoint) -> Arc<Self> {
        Arc::new(P2pHost {
            endpoint,
            addrs: DashMap::new(),
            advert_conns: DashMap::new(),
            pool: RwLock::new(HashMap::new()),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn learn_addr(&self, addr: iroh::EndpointAddr) {
        self.addrs.insert(PeerId(*addr.id.as_bytes()), addr);
    }

    fn register_advert_conn(&self, peer: PeerId, conn: Connection) {
        self.advert_conns.insert(peer, conn);
    }

    fn forget_advert_conn(&self, peer: &PeerId) {
        self.advert_conns.remove(peer);
    }

    /// Get a pooled connection or dial a new one. Read lock for the common
    /// hit path; double-checked insert after dialing.
    async fn pooled_connection(&self, peer: PeerId, protocol: &str) -> Result<Connection> {
        let key = (peer, protocol.to_string());
        let now = now_secs();

        {
            let pool = self.pool.read().await;
            if let Some((conn, created)) = pool.get(&key) {
                if now.saturating_sub(*created) < CONNECTION_TTL_SECS
                    && conn.closed().now_or_never().is_none()
                {
                    return Ok(conn.clone());
                }
            }
        }

        let addr = self
            .addrs
            .get(&peer)
            .map(|entry| entry.value().clone())
            .with_context(|| format!("no known address for peer {peer}"))?;
        let conn = self
            .endpoint
            .connect(addr, protocol.as_bytes())
            .await
            .with_context(|| format!("failed to connect to {peer} for {protocol}"))?;

        let mut pool = self.pool.write().await;
        if let Some((existing, created)) = pool.get(&key) {
            if now.saturating_sub(*created) < CONNECTION_TTL_SECS
                && existing.closed().now_or_never().is_none()
            {
                // Another task connected while we were dialing.
                conn.close(0u32.into(), b"duplicate");
                return Ok(existing.clone());
            }
        }
        pool.retain(|_, (conn, created)| {
            now.saturating_sub(*created) < CONNECTION_TTL_SECS
                && conn.closed().now_or_never().is_none()
        });
        pool.insert(key, (conn.clone(), now));
        Ok(conn)
    }
}

#[async_trait]
impl SyncHost for P2pHost {
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxedStream> {
        let conn = self.pooled_connection(peer, protocol).await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(Box::new(tokio::io::join(recv, send)))
    }

    async fn disconnect(&self, peer: PeerId) {
        if let Some((_, conn)) = self.advert_conns.remove(&peer) {
            conn.close(0u32.into(), b"dropped");
        }
        let mut pool = self.pool.write().await;
        pool.retain(|(id, _), (conn, _)| {
            if *id == peer {
                conn.close(0u32.into(), b"dropped");
                false
            } else {
                true
            }
        });
        self.addrs.remove(&peer);
    }
}

// ============================================================================
// Serving side
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub enum SyncProtocolKind {
    Range,
    List,
}

/// Serves one sync protocol: accepts bidirectional streams on the
/// connection and answers each on its own task, bounded by a shared
/// semaphore so a connection flood cannot spawn unbounded handlers.
#[derive(Clone)]
pub struct SyncProtocolHandler {
    server: ShardServer,
    kind: SyncProtocolKind,
    handler_sem: Arc<Semaphore>,
}

impl SyncProtocolHandler {
    pub fn new(server: ShardServer, kind: SyncProtocolKind) -> Self {
        SyncProtocolHandler {
            server,
            kind,
            handler_sem: Arc::new(Semaphore::new(MAX_CONCURRENT_STREAM_HANDLERS)),
        }
    }
}

impl std::fmt::Debug for SyncProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocolHandler")
            .field("kind", &self.kind)
            .finish()
    }
}

impl iroh::protocol::ProtocolHandler for SyncProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let this = self.clone();
        async move {
            let remote = conn.remote_id();
            trace!(remote = %remote, kind = ?this.kind, "Accepted sync connection");
            loop {
                let (send, recv) = match conn.accept_bi().await {
                    Ok(streams) => streams,
                    Err(e) => {
                        trace!(remote = %remote, error = %e, "Sync connection closed");
                        break;
                    }
                };
                let permit = match this.handler_sem.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(remote = %remote, "Stream handler limit reached, dropping stream");
                        continue;
                    }
                };
                let server = this.server.clone();
                let kind = this.kind;
                tokio::spawn(async move {
                    let _permit = permit;
                    let mut stream = tokio::io::join(recv, send);
                    let result = match kind {
                        SyncProtocolKind::Range => server.handle_range_stream(&mut stream).await,
                        SyncProtocolKind::List => server.handle_list_stream(&mut stream).await,
                    };
                    if let Err(e) = result {
                        debug!(error = %e, "Sync stream handler error");
                    }
                });
            }
            Ok(())
        }
    }
}

// ============================================================================
// Advertisement handshake
// ============================================================================

/// Accepts handshake connections: reads the dialer's advertisement,
/// answers with ours, then reports the peer to the sync controller and
/// watches the connection until it closes.
#[derive(Clone)]
pub struct AdvertHandler {
    host: Arc<P2pHost>,
    local_advert: Arc<Vec<ContractShards>>,
    events: mpsc::Sender<PeerEvent>,
}

impl AdvertHandler {
    pub fn new(
        host: Arc<P2pHost>,
        local_advert: Vec<ContractShards>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        AdvertHandler {
            host,
            local_advert: Arc::new(local_advert),
            events,
        }
    }

    async fn handle(&self, conn: Connection) -> Result<()> {
        let remote = conn.remote_id();
        let peer = peer_id_of(&remote);

        let (mut send, mut recv) = conn.accept_bi().await?;
        let theirs: Vec<ContractShards> = tokio::time::timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            read_frame(&mut recv, MAX_ADVERT_FRAME),
        )
        .await
        .map_err(|_| anyhow!("advertisement read timed out"))??;
        write_frame(&mut send, &*self.local_advert).await?;

        let shards = common::to_shard_map(&theirs);
        if shards.values().all(|set| set.is_empty()) {
            conn.close(0u32.into(), b"bad advertisement");
            bail!("peer {peer} advertised no shards");
        }

        debug!(peer = %peer, contracts = shards.len(), "Peer advertisement received");
        self.host.register_advert_conn(peer, conn.clone());
        let _ = self.events.send(PeerEvent::Connected { peer, shards }).await;

        // Hold the handler open until the connection dies, then report it.
        conn.closed().await;
        self.host.forget_advert_conn(&peer);
        let _ = self.events.send(PeerEvent::Disconnected { peer }).await;
        Ok(())
    }
}

impl std::fmt::Debug for AdvertHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvertHandler").finish()
    }
}

impl iroh::protocol::ProtocolHandler for AdvertHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let this = self.clone();
        async move {
            this.handle(conn)
                .await
                .map_err(|e| AcceptError::from_err(std::io::Error::other(e)))
        }
    }
}

/// Dial a bootstrap peer and run the handshake from the initiating side:
/// send our advertisement, read theirs, report the peer, and watch the
/// connection for disconnect.
pub async fn dial_peer(
    host: Arc<P2pHost>,
    chain_id: u64,
    local_advert: Vec<ContractShards>,
    events: mpsc::Sender<PeerEvent>,
    addr: iroh::EndpointAddr,
) -> Result<()> {
    host.learn_addr(addr.clone());
    let alpn = common::advert_protocol(chain_id);

    let mut attempt = 0u32;
    let conn = loop {
        match host.endpoint().connect(addr.clone(), alpn.as_bytes()).await {
            Ok(conn) => break conn,
            Err(e) if attempt + 1 < CONNECT_RETRIES => {
                attempt += 1;
                let backoff = Duration::from_millis(CONNECT_BACKOFF_MS << attempt);
                debug!(error = %e, attempt, "Bootstrap dial failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let peer = peer_id_of(&conn.remote_id());
    let (mut send, mut recv) = conn.open_bi().await?;
    write_frame(&mut send, &local_advert).await?;
    let theirs: Vec<ContractShards> = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        read_frame(&mut recv, MAX_ADVERT_FRAME),
    )
    .await
    .map_err(|_| anyhow!("advertisement read timed out"))??;

    let shards = common::to_shard_map(&theirs);
    if shards.values().all(|set| set.is_empty()) {
        conn.close(0u32.into(), b"bad advertisement");
        bail!("peer {peer} advertised no shards");
    }

    debug!(peer = %peer, "Connected to bootstrap peer");
    host.register_advert_conn(peer, conn.clone());
    let _ = events.send(PeerEvent::Connected { peer, shards }).await;

    let watcher_host = host.clone();
    tokio::spawn(async move {
        conn.closed().await;
        watcher_host.forget_advert_conn(&peer);
        let _ = events.send(PeerEvent::Disconnected { peer }).await;
    });
    Ok(())
}
