//! End-to-end sync scenarios over the in-memory host.
//!
//! Each test builds a local node (in-memory storage + task store on a temp
//! redb file) and one or more serving peers holding generated shard data,
//! wires them through [`TestNet`], and drives the sync client to
//! completion or a deliberate stall. Read-back verification checks every
//! slot against the generated data, the empty marker for slots beyond the
//! chain's last populated index, and the empty marker for indices no peer
//! could serve.

use common::{Address, BlobPayload, Commitment, EncodingKind, ShardMap};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use sync::client::{SyncClient, SyncConfig, SyncEvent};
use sync::host::{PeerEvent, PeerId};
use sync::memstore::{mask_blob, MemStorage, MemStorageReader};
use sync::prover::{MerkleProver, Prover};
use sync::task_store::TaskStore;
use sync::testnet::TestNet;
use tokio::sync::{broadcast, mpsc};

const CHAIN_ID: u64 = 3333;
const KV_SIZE: u64 = 4096;
const CHUNK_SIZE: u64 = 1024;

fn contract() -> Address {
    "0x0000000000000000000000000000000003330001".parse().unwrap()
}

fn test_config() -> SyncConfig {
    let mut cfg = SyncConfig::new(CHAIN_ID);
    cfg.max_subtask_span = 16;
    cfg.max_request_entries = 16;
    cfg.tick = Duration::from_millis(10);
    cfg.request_timeout = Duration::from_secs(2);
    cfg.heal_backoff = Duration::from_millis(50);
    cfg.heal_backoff_max = Duration::from_millis(400);
    cfg.save_interval = Duration::from_secs(60);
    cfg
}

/// Generated shard content: the raw slot bytes plus the wire payloads a
/// peer storing under `encoding` would serve.
struct TestData {
    raw: HashMap<u64, Vec<u8>>,
    payloads: HashMap<u64, BlobPayload>,
}

/// Deterministic per-slot content with a real commitment, for every index
/// of the given shards below `last_kv`.
fn make_kv_data(shards: &[u64], kv_entries: u64, last_kv: u64, encoding: EncodingKind) -> TestData {
    let prover = MerkleProver;
    let miner = Address::ZERO;
    let mut raw = HashMap::new();
    let mut payloads = HashMap::new();
    for shard in shards {
        for kv in shard * kv_entries..(shard + 1) * kv_entries {
            if kv >= last_kv {
                continue;
            }
            let mut val = vec![0u8; KV_SIZE as usize];
            val[..20].copy_from_slice(contract().as_bytes());
            val[20..28].copy_from_slice(&kv.to_be_bytes());
            let root = prover
                .get_root(&val, KV_SIZE / CHUNK_SIZE, CHUNK_SIZE)
                .unwrap();
            let commit = Commitment::from_root(&root, false);
            let encoded = mask_blob(kv, &val, miner, encoding).unwrap();
            payloads.insert(
                kv,
                BlobPayload {
                    miner_address: miner,
                    blob_index: kv,
                    blob_commit: commit,
                    encode_type: encoding.as_u64(),
                    encoded_blob: encoded,
                },
            );
            raw.insert(kv, val);
        }
    }
    TestData { raw, payloads }
}

/// Local storage with the chain view seeded from the generated data.
fn make_local_storage(
    shards: &[u64],
    kv_entries: u64,
    last_kv: u64,
    encoding: EncodingKind,
    data: &TestData,
) -> Arc<MemStorage> {
    let storage = Arc::new(MemStorage::new(
        contract(),
        shards.to_vec(),
        kv_entries,
        KV_SIZE,
        CHUNK_SIZE,
        Address::ZERO,
        encoding,
        last_kv,
    ));
    for (kv, payload) in &data.payloads {
        storage.set_chain_meta(*kv, payload.blob_commit);
    }
    storage
}

/// Register a serving peer holding the data for `shards`, minus its
/// excluded indices.
fn spawn_peer(
    net: &Arc<TestNet>,
    seed: u8,
    shards: &[u64],
    kv_entries: u64,
    encoding: EncodingKind,
    excluded: &HashSet<u64>,
    data: &TestData,
) -> PeerId {
    let payloads: HashMap<u64, BlobPayload> = shards
        .iter()
        .flat_map(|shard| shard * kv_entries..(shard + 1) * kv_entries)
        .filter(|kv| !excluded.contains(kv))
        .filter_map(|kv| data.payloads.get(&kv).map(|p| (kv, p.clone())))
        .collect();
    let reader = Arc::new(MemStorageReader {
        contract: contract(),
        shards: shards.to_vec(),
        kv_entries,
        max_kv_size: KV_SIZE,
        chunk_size: CHUNK_SIZE,
        miner: Address::ZERO,
        encoding,
        payloads,
    });
    let peer = PeerId([seed; 32]);
    net.register_server(peer, CHAIN_ID, reader, 1 << 22);
    peer
}

fn advert(shards: &[u64]) -> ShardMap {
    common::to_shard_map(&[common::ContractShards {
        contract: contract(),
        shard_ids: shards.to_vec(),
    }])
}

struct Harness {
    net: Arc<TestNet>,
    client: Arc<SyncClient>,
    storage: Arc<MemStorage>,
    peer_tx: mpsc::Sender<PeerEvent>,
    _dir: tempfile::TempDir,
}

fn build_harness(storage: Arc<MemStorage>, net: Arc<TestNet>, cfg: SyncConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path().join("sync-status.redb")).unwrap();
    let (peer_tx, peer_rx) = mpsc::channel(16);
    let client = SyncClient::new(
        cfg,
        storage.clone(),
        Arc::new(MerkleProver),
        net.clone(),
        store,
        peer_rx,
    )
    .unwrap();
    Harness {
        net,
        client,
        storage,
        peer_tx,
        _dir: dir,
    }
}

/// Wait for `AllShardDone`, treating `stall` without any event as failure
/// to finish.
async fn wait_all_done(events: &mut broadcast::Receiver<SyncEvent>, stall: Duration) -> bool {
    loop {
        match tokio::time::timeout(stall, events.recv()).await {
            Err(_) => return false,
            Ok(Ok(SyncEvent::AllShardDone)) => return true,
            Ok(Ok(SyncEvent::ShardDone { .. })) => continue,
            Ok(Err(_)) => return false,
        }
    }
}

/// Check every slot of the local shards: generated content where a peer
/// could serve it, the empty marker everywhere else.
fn verify_kvs(
    storage: &MemStorage,
    data: &TestData,
    shards: &[u64],
    kv_entries: u64,
    last_kv: u64,
    excluded: &HashSet<u64>,
) {
    use sync::storage::StorageManager;
    for shard in shards {
        for kv in shard * kv_entries..(shard + 1) * kv_entries {
            let (expected, commit) = if kv >= last_kv || excluded.contains(&kv) {
                (vec![0u8; KV_SIZE as usize], Commitment::empty_marker())
            } else {
                (data.raw[&kv].clone(), data.payloads[&kv].blob_commit)
            };
            let got = storage
                .try_read(kv, KV_SIZE as usize, commit)
                .unwrap()
                .unwrap_or_else(|| panic!("kv {kv} unreadable under expected commitment"));
            assert_eq!(got, expected, "kv {kv} content mismatch");
        }
    }
}

struct RemotePeer {
    shards: Vec<u64>,
    excluded: HashSet<u64>,
}

/// The general sync scenario driver: local shards, a set of remote peers,
/// an expected final state.
async fn run_sync(
    kv_entries: u64,
    local_shards: &[u64],
    last_kv: u64,
    encoding: EncodingKind,
    peers: &[RemotePeer],
    stall: Duration,
    expect_done: bool,
) -> (Harness, TestData, HashSet<u64>) {
    let data = make_kv_data(local_shards, kv_entries, last_kv, encoding);
    let storage = make_local_storage(local_shards, kv_entries, last_kv, encoding, &data);
    let net = TestNet::new();
    let harness = build_harness(storage, net, test_config());

    let mut events = harness.client.subscribe();
    harness.client.start().unwrap();

    // An index stays unserved only if every peer covering its shard
    // excludes it.
    let mut unserved: HashSet<u64> = peers
        .iter()
        .flat_map(|p| p.excluded.iter().copied())
        .collect();
    unserved.retain(|kv| {
        peers.iter().all(|p| {
            !p.shards.contains(&(kv / kv_entries)) || p.excluded.contains(kv)
        })
    });

    for (n, peer) in peers.iter().enumerate() {
        let id = spawn_peer(
            &harness.net,
            n as u8 + 1,
            &peer.shards,
            kv_entries,
            encoding,
            &peer.excluded,
            &data,
        );
        harness
            .peer_tx
            .send(PeerEvent::Connected {
                peer: id,
                shards: advert(&peer.shards),
            })
            .await
            .unwrap();
    }

    let done = wait_all_done(&mut events, stall).await;
    assert_eq!(
        harness.client.sync_done(),
        expect_done,
        "sync_done mismatch (event wait returned {done})"
    );
    verify_kvs(
        &harness.storage,
        &data,
        local_shards,
        kv_entries,
        last_kv,
        &unserved,
    );
    (harness, data, unserved)
}

fn pick_random_excluded(range: std::ops::Range<u64>, count: usize) -> HashSet<u64> {
    let mut all: Vec<u64> = range.collect();
    all.shuffle(&mut rand::rng());
    all.into_iter().take(count).collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// One small shard, one peer holding everything.
#[tokio::test]
async fn test_simple_sync() {
    let (harness, ..) = run_sync(
        16,
        &[0],
        16,
        EncodingKind::None,
        &[RemotePeer {
            shards: vec![0],
            excluded: HashSet::new(),
        }],
        Duration::from_secs(2),
        true,
    )
    .await;
    harness.client.close().await;
}

/// One shard large enough to split into several sub-tasks.
#[tokio::test]
async fn test_multi_subtask_sync() {
    let (harness, ..) = run_sync(
        64,
        &[0],
        64,
        EncodingKind::None,
        &[RemotePeer {
            shards: vec![0],
            excluded: HashSet::new(),
        }],
        Duration::from_secs(2),
        true,
    )
    .await;
    harness.client.close().await;
}

/// Two shards served by two disjoint peers.
#[tokio::test]
async fn test_multi_shard_multi_peer_sync() {
    let (harness, ..) = run_sync(
        16,
        &[0, 1],
        32,
        EncodingKind::None,
        &[
            RemotePeer {
                shards: vec![0],
                excluded: HashSet::new(),
            },
            RemotePeer {
                shards: vec![1],
                excluded: HashSet::new(),
            },
        ],
        Duration::from_secs(2),
        true,
    )
    .await;
    harness.client.close().await;
}

/// The chain populated fewer slots than the shard holds: the tail is
/// empty-filled, not fetched.
#[tokio::test]
async fn test_sync_with_fewer_populated_slots() {
    let (harness, ..) = run_sync(
        16,
        &[0],
        14,
        EncodingKind::None,
        &[RemotePeer {
            shards: vec![0],
            excluded: HashSet::new(),
        }],
        Duration::from_secs(2),
        true,
    )
    .await;
    assert_eq!(harness.client.empty_blobs_filled(), 2);
    harness.client.close().await;
}

/// Overlapping peer shard sets still converge.
#[tokio::test]
async fn test_sync_with_overlapping_peers() {
    let (harness, ..) = run_sync(
        16,
        &[0, 1, 2, 3],
        16 * 4 - 10,
        EncodingKind::None,
        &[
            RemotePeer {
                shards: vec![0, 1, 2],
                excluded: HashSet::new(),
            },
            RemotePeer {
                shards: vec![2, 3],
                excluded: HashSet::new(),
            },
        ],
        Duration::from_secs(2),
        true,
    )
    .await;
    harness.client.close().await;
}

/// A single peer missing some indices: sync cannot finish, everything else
/// verifies, the missing slots stay at the empty marker.
#[tokio::test]
async fn test_sync_with_excluded_indices_stalls() {
    let excluded = pick_random_excluded(0..16, 3);
    let (harness, ..) = run_sync(
        16,
        &[0],
        16,
        EncodingKind::None,
        &[RemotePeer {
            shards: vec![0],
            excluded,
        }],
        Duration::from_secs(2),
        false,
    )
    .await;
    harness.client.close().await;
}

/// Two peers whose excluded sets do not overlap: between them everything
/// is served.
#[tokio::test]
async fn test_sync_with_disjoint_excluded_sets() {
    let excluded0 = pick_random_excluded(16..47, 3);
    let mut excluded1 = pick_random_excluded(16..47, 3);
    excluded1.retain(|kv| !excluded0.contains(kv));
    let (harness, ..) = run_sync(
        16,
        &[0, 1, 2, 3],
        16 * 4,
        EncodingKind::None,
        &[
            RemotePeer {
                shards: vec![0, 1, 2],
                excluded: excluded0,
            },
            RemotePeer {
                shards: vec![1, 2, 3],
                excluded: excluded1,
            },
        ],
        Duration::from_secs(6),
        true,
    )
    .await;
    harness.client.close().await;
}

/// A late-joining peer heals the indices the first peer could not serve.
#[tokio::test]
async fn test_heal_after_late_peer_joins() {
    let excluded = pick_random_excluded(0..16, 3);
    let (harness, data, unserved) = run_sync(
        16,
        &[0],
        16,
        EncodingKind::None,
        &[RemotePeer {
            shards: vec![0],
            excluded: excluded.clone(),
        }],
        Duration::from_secs(2),
        false,
    )
    .await;
    assert_eq!(unserved, excluded);

    // The second peer holds everything, including the missing indices.
    let mut events = harness.client.subscribe();
    let full_peer = spawn_peer(
        &harness.net,
        9,
        &[0],
        16,
        EncodingKind::None,
        &HashSet::new(),
        &data,
    );
    harness
        .peer_tx
        .send(PeerEvent::Connected {
            peer: full_peer,
            shards: advert(&[0]),
        })
        .await
        .unwrap();

    assert!(wait_all_done(&mut events, Duration::from_secs(2)).await);
    assert!(harness.client.sync_done());
    verify_kvs(&harness.storage, &data, &[0], 16, 16, &HashSet::new());
    harness.client.close().await;
}

/// The remote peer stores under a different encoding; blobs land locally
/// re-encoded and verified.
#[tokio::test]
async fn test_sync_across_encodings() {
    // Remote blobs are keccak-masked; the local shard stores unmasked.
    let data = make_kv_data(&[0], 16, 16, EncodingKind::Keccak256);
    let storage = make_local_storage(&[0], 16, 16, EncodingKind::None, &data);
    let net = TestNet::new();
    let harness = build_harness(storage, net, test_config());

    let mut events = harness.client.subscribe();
    harness.client.start().unwrap();

    let peer = spawn_peer(
        &harness.net,
        1,
        &[0],
        16,
        EncodingKind::Keccak256,
        &HashSet::new(),
        &data,
    );
    harness
        .peer_tx
        .send(PeerEvent::Connected {
            peer,
            shards: advert(&[0]),
        })
        .await
        .unwrap();

    assert!(wait_all_done(&mut events, Duration::from_secs(2)).await);
    verify_kvs(&harness.storage, &data, &[0], 16, 16, &HashSet::new());
    harness.client.close().await;
}

/// Shutting down mid empty-fill stops the pass without completing it.
#[tokio::test]
async fn test_close_during_empty_fill() {
    let kv_entries = 512u64;
    // Full-size slots make each fill write cost real work.
    let storage = Arc::new(MemStorage::new(
        contract(),
        vec![0],
        kv_entries,
        1 << 17,
        1 << 12,
        Address::ZERO,
        EncodingKind::None,
        0,
    ));
    let net = TestNet::new();
    let harness = build_harness(storage, net, test_config());

    harness.client.start().unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    harness.client.close().await;

    assert!(!harness.client.sync_done());
    assert_eq!(harness.client.empty_blobs_to_fill(), kv_entries);
    assert!(
        harness.client.empty_blobs_filled() < harness.client.empty_blobs_to_fill(),
        "fill should have been interrupted ({} of {})",
        harness.client.empty_blobs_filled(),
        harness.client.empty_blobs_to_fill()
    );
}

/// A peer connecting after completion stays connected: this node serves
/// it now.
#[tokio::test]
async fn test_add_peer_after_sync_done() {
    let (harness, data, _) = run_sync(
        16,
        &[0],
        16,
        EncodingKind::None,
        &[RemotePeer {
            shards: vec![0],
            excluded: HashSet::new(),
        }],
        Duration::from_secs(2),
        true,
    )
    .await;

    let late_peer = spawn_peer(
        &harness.net,
        7,
        &[0],
        16,
        EncodingKind::None,
        &HashSet::new(),
        &data,
    );
    harness
        .peer_tx
        .send(PeerEvent::Connected {
            peer: late_peer,
            shards: advert(&[0]),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.client.peer_count(), 2);
    assert!(harness.client.sync_done());
    harness.client.close().await;
}

/// Crash mid-sync: the restarted client resumes from the persisted tasks
/// and finishes once a capable peer shows up.
#[tokio::test]
async fn test_restart_resumes_partial_progress() {
    let excluded: HashSet<u64> = [3, 7, 12].into_iter().collect();
    let data = make_kv_data(&[0], 16, 16, EncodingKind::None);
    let storage = make_local_storage(&[0], 16, 16, EncodingKind::None, &data);
    let net = TestNet::new();

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("sync-status.redb");

    // First run: the only peer cannot serve three indices.
    {
        let store = TaskStore::open(&store_path).unwrap();
        let (peer_tx, peer_rx) = mpsc::channel(16);
        let client = SyncClient::new(
            test_config(),
            storage.clone(),
            Arc::new(MerkleProver),
            net.clone(),
            store,
            peer_rx,
        )
        .unwrap();
        let mut events = client.subscribe();
        client.start().unwrap();
        let peer = spawn_peer(&net, 1, &[0], 16, EncodingKind::None, &excluded, &data);
        peer_tx
            .send(PeerEvent::Connected {
                peer,
                shards: advert(&[0]),
            })
            .await
            .unwrap();
        assert!(!wait_all_done(&mut events, Duration::from_secs(2)).await);
        assert!(!client.sync_done());
        client.close().await;
        drop(client);
    }

    // Second run over the same storage and task store.
    let store = TaskStore::open(&store_path).unwrap();
    let (peer_tx, peer_rx) = mpsc::channel(16);
    let client = SyncClient::new(
        test_config(),
        storage.clone(),
        Arc::new(MerkleProver),
        net.clone(),
        store,
        peer_rx,
    )
    .unwrap();
    client.load_sync_status().unwrap();

    let status = client.status();
    assert_eq!(status.shards.len(), 1);
    assert_eq!(
        status.shards[0].pending_entries, 0,
        "ranges were drained before the crash"
    );
    assert_eq!(
        status.shards[0].heal_entries,
        excluded.len(),
        "unserved indices persisted in the heal set"
    );

    let mut events = client.subscribe();
    client.start().unwrap();
    let full_peer = spawn_peer(&net, 2, &[0], 16, EncodingKind::None, &HashSet::new(), &data);
    peer_tx
        .send(PeerEvent::Connected {
            peer: full_peer,
            shards: advert(&[0]),
        })
        .await
        .unwrap();

    assert!(wait_all_done(&mut events, Duration::from_secs(2)).await);
    verify_kvs(&storage, &data, &[0], 16, 16, &HashSet::new());
    client.close().await;
}

// ---------------------------------------------------------------------------
// One-shot request operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_request_range_one_shot() {
    let data = make_kv_data(&[0], 16, 16, EncodingKind::None);
    let storage = make_local_storage(&[0], 16, 16, EncodingKind::None, &data);
    let net = TestNet::new();
    let harness = build_harness(storage, net, test_config());

    harness.client.load_sync_status().unwrap();
    let peer = spawn_peer(
        &harness.net,
        1,
        &[0],
        16,
        EncodingKind::None,
        &HashSet::new(),
        &data,
    );
    assert!(harness.client.add_peer(peer, advert(&[0])));

    let written = harness
        .client
        .request_range(contract(), 0, 16)
        .await
        .unwrap();
    assert_eq!(written, 16);
    verify_kvs(&harness.storage, &data, &[0], 16, 16, &HashSet::new());
}

#[tokio::test]
async fn test_request_list_one_shot() {
    let data = make_kv_data(&[0], 16, 16, EncodingKind::None);
    let storage = make_local_storage(&[0], 16, 16, EncodingKind::None, &data);
    let net = TestNet::new();
    let harness = build_harness(storage, net, test_config());

    harness.client.load_sync_status().unwrap();
    let peer = spawn_peer(
        &harness.net,
        1,
        &[0],
        16,
        EncodingKind::None,
        &HashSet::new(),
        &data,
    );
    assert!(harness.client.add_peer(peer, advert(&[0])));

    let indices: Vec<u64> = (0..16).collect();
    let written = harness
        .client
        .request_list(contract(), indices)
        .await
        .unwrap();
    assert_eq!(written, 16);
    verify_kvs(&harness.storage, &data, &[0], 16, 16, &HashSet::new());
}

/// A tampered payload is rejected and never written.
#[tokio::test]
async fn test_tampered_blob_rejected() {
    let mut data = make_kv_data(&[0], 16, 16, EncodingKind::None);
    // Corrupt one blob's content without touching its commitment.
    data.payloads.get_mut(&5).unwrap().encoded_blob[0] ^= 0xFF;

    let storage = make_local_storage(&[0], 16, 16, EncodingKind::None, &data);
    let net = TestNet::new();
    let harness = build_harness(storage, net, test_config());

    harness.client.load_sync_status().unwrap();
    let peer = spawn_peer(
        &harness.net,
        1,
        &[0],
        16,
        EncodingKind::None,
        &HashSet::new(),
        &data,
    );
    assert!(harness.client.add_peer(peer, advert(&[0])));

    let written = harness
        .client
        .request_range(contract(), 0, 16)
        .await
        .unwrap();
    assert_eq!(written, 15, "the corrupted blob must be refused");

    use sync::storage::StorageManager;
    let commit = data.payloads[&5].blob_commit;
    assert!(
        harness
            .storage
            .try_read(5, KV_SIZE as usize, commit)
            .unwrap()
            .is_none(),
        "slot 5 must not contain the tampered blob"
    );
}
