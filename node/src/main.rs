//! Node entry point.
//!
//! Wires the sync core to its collaborators: the in-memory dev storage
//! engine, the redb task store, the iroh endpoint with the two sync
//! protocols plus the advertisement handshake, and a small HTTP status
//! endpoint. A production deployment swaps the storage engine and the
//! prover behind their capability traits; everything else stays.

mod config;
mod p2p;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Json;
use clap::Parser;
use config::NodeConfig;
use iroh::protocol::Router;
use p2p::{AdvertHandler, P2pHost, SyncProtocolHandler, SyncProtocolKind};
use std::sync::Arc;
use sync::client::{SyncClient, SyncConfig, SyncStatus};
use sync::constants::DEFAULT_MAX_RESPONSE_BYTES;
use sync::memstore::MemStorage;
use sync::prover::MerkleProver;
use sync::server::ShardServer;
use sync::task_store::TaskStore;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = NodeConfig::parse();
    tokio::fs::create_dir_all(&cfg.datadir).await?;

    run_node(cfg).await
}

async fn run_node(cfg: NodeConfig) -> Result<()> {
    // Dev-mode storage engine. The chain view starts out all-empty, so a
    // node without a meta feed simply empty-fills its shards; any real
    // engine implements the same traits and replaces this wholesale.
    let storage = Arc::new(MemStorage::new(
        cfg.contract,
        cfg.shards.clone(),
        cfg.kv_entries,
        cfg.kv_size,
        cfg.chunk_size,
        cfg.miner,
        cfg.encoding,
        cfg.last_kv_index,
    ));

    let store = TaskStore::open(cfg.datadir.join("sync-status.redb"))
        .map_err(|e| anyhow::anyhow!("cannot open task store: {e}"))?;

    // Identity + QUIC endpoint.
    let secret_key = p2p::load_keypair(&cfg.datadir).await?;
    let endpoint = iroh::Endpoint::builder()
        .secret_key(secret_key)
        .bind_addr(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::UNSPECIFIED,
            cfg.p2p_port,
        ))
        .expect("valid bind addr")
        .bind()
        .await?;
    let node_id = endpoint.secret_key().public();
    info!(node_id = %node_id, port = cfg.p2p_port, "Endpoint bound");

    let host = P2pHost::new(endpoint.clone());
    let (peer_tx, peer_rx) = mpsc::channel(64);

    // Serving side: both sync protocols answer from local storage.
    let server = ShardServer::new(storage.clone(), DEFAULT_MAX_RESPONSE_BYTES);
    let local_advert = common::to_contract_shards(&common::to_shard_map(&[
        common::ContractShards {
            contract: cfg.contract,
            shard_ids: cfg.shards.clone(),
        },
    ]));

    let range_alpn = common::blobs_by_range_protocol(cfg.chain_id);
    let list_alpn = common::blobs_by_list_protocol(cfg.chain_id);
    let advert_alpn = common::advert_protocol(cfg.chain_id);
    let router = Router::builder(endpoint.clone())
        .accept(
            range_alpn.as_bytes(),
            SyncProtocolHandler::new(server.clone(), SyncProtocolKind::Range),
        )
        .accept(
            list_alpn.as_bytes(),
            SyncProtocolHandler::new(server, SyncProtocolKind::List),
        )
        .accept(
            advert_alpn.as_bytes(),
            AdvertHandler::new(host.clone(), local_advert.clone(), peer_tx.clone()),
        )
        .spawn();

    // The sync core.
    let sync_cfg: SyncConfig = cfg.sync_config();
    let client = SyncClient::new(
        sync_cfg,
        storage,
        Arc::new(MerkleProver),
        host.clone(),
        store,
        peer_rx,
    )?;
    client.start()?;

    // Dial bootstrap peers; each successful handshake feeds the controller.
    for entry in &cfg.bootstrap {
        match serde_json::from_str::<iroh::EndpointAddr>(entry) {
            Ok(addr) => {
                let host = host.clone();
                let events = peer_tx.clone();
                let advert = local_advert.clone();
                let chain_id = cfg.chain_id;
                tokio::spawn(async move {
                    if let Err(e) = p2p::dial_peer(host, chain_id, advert, events, addr).await {
                        warn!(error = %e, "Bootstrap dial failed");
                    }
                });
            }
            Err(e) => warn!(entry = %entry, error = %e, "Unparseable bootstrap address, skipping"),
        }
    }

    // Status endpoint.
    let app = axum::Router::new()
        .route("/status", get(status_handler))
        .with_state(client.clone());
    let listener = tokio::net::TcpListener::bind(cfg.http_addr).await?;
    info!(addr = %cfg.http_addr, "Status endpoint listening");
    let http = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Status server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    client.close().await;
    http.abort();
    let _ = router.shutdown().await;
    endpoint.close().await;
    info!("Node shutdown complete");
    Ok(())
}

async fn status_handler(State(client): State<Arc<SyncClient>>) -> Json<SyncStatus> {
    Json(client.status())
}
