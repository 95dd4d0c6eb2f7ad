//! The sync client: controller loop, request dispatch, response
//! validation, empty-fill and completion tracking.
//!
//! All shared state (tasks, peer table, in-flight reservations) lives in
//! one [`SyncState`] behind a single mutex. The lock is never held across a
//! suspension point: workers lock to reserve work, release before any
//! network or disk call, and re-lock to commit the outcome. Reserving means
//! flagging a sub-task as running or moving heal indices into the in-flight
//! registry, which is what keeps any index in at most one outstanding
//! request.

use crate::constants::*;
use crate::host::{PeerEvent, PeerId, SyncHost};
use crate::peers::PeerTable;
use crate::prover::Prover;
use crate::storage::{shard_of, StorageManager};
use crate::task::{clean_tasks, Task, TaskPhase};
use crate::task_store::TaskStore;
use anyhow::{anyhow, Context, Result};
use common::{
    now_millis, read_frame, write_frame, Address, BlobPayload, BlobsByListRequest,
    BlobsByRangeRequest, BlobsResponse, Commitment, EncodingKind, KvIndex, ShardId, ShardMap,
    MAX_FRAME_SIZE, STATUS_OK,
};
use parity_scale_codec::Encode;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Tuning for the sync core. The defaults come from
/// [`crate::constants`]; deployments override through the node config.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub chain_id: u64,
    pub max_peers: usize,
    pub max_in_flight_per_peer: usize,
    pub max_subtask_span: u64,
    pub max_request_entries: u64,
    pub list_batch: usize,
    pub request_timeout: Duration,
    pub heal_backoff: Duration,
    pub heal_backoff_max: Duration,
    pub max_peer_failures: u32,
    pub tick: Duration,
    pub save_interval: Duration,
    pub max_response_bytes: u64,
    pub stall_warn: Duration,
}

impl SyncConfig {
    pub fn new(chain_id: u64) -> Self {
        SyncConfig {
            chain_id,
            max_peers: DEFAULT_MAX_PEERS,
            max_in_flight_per_peer: DEFAULT_MAX_IN_FLIGHT_PER_PEER,
            max_subtask_span: DEFAULT_MAX_SUBTASK_SPAN,
            max_request_entries: DEFAULT_MAX_REQUEST_ENTRIES,
            list_batch: DEFAULT_LIST_BATCH,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            heal_backoff: Duration::from_millis(DEFAULT_HEAL_BACKOFF_MS),
            heal_backoff_max: Duration::from_millis(DEFAULT_HEAL_BACKOFF_MAX_MS),
            max_peer_failures: DEFAULT_MAX_PEER_FAILURES,
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            save_interval: Duration::from_millis(DEFAULT_SAVE_INTERVAL_MS),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            stall_warn: Duration::from_secs(DEFAULT_STALL_WARN_SECS),
        }
    }
}

/// Completion events published on the sync bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    ShardDone { contract: Address, shard_id: ShardId },
    AllShardDone,
}

/// Fatal initialization failures; everything transient stays inside the
/// core.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no shards locally held")]
    NoLocalShards,
}

/// Why a payload was refused. Peer-attributable reasons count against the
/// sending peer; a local write failure does not.
#[derive(Debug, thiserror::Error)]
enum Reject {
    #[error("no chain commitment known for the slot")]
    UnknownSlot,
    #[error("commitment does not match the chain view")]
    CommitmentMismatch,
    #[error("unknown encode type {0}")]
    UnknownEncoding(u64),
    #[error("encoded blob exceeds the slot size")]
    Oversize,
    #[error("blob decode failed: {0}")]
    DecodeFailed(String),
    #[error("blob root does not match the commitment")]
    RootMismatch,
    #[error("storage write failed: {0}")]
    StorageWrite(String),
    #[error("storage read failed: {0}")]
    StorageRead(String),
}

impl Reject {
    fn peer_fault(&self) -> bool {
        !matches!(self, Reject::StorageWrite(_) | Reject::StorageRead(_))
    }
}

#[derive(Clone, Debug)]
enum InFlightKind {
    /// A range request for `[origin, end)` reserved on the sub-task whose
    /// `first` equals `subtask_first`.
    Range {
        origin: KvIndex,
        end: KvIndex,
        subtask_first: KvIndex,
    },
    /// A list request for heal indices (already removed from the heal set;
    /// re-inserted on failure).
    List { indices: Vec<KvIndex> },
}

#[derive(Clone, Debug)]
struct InFlight {
    peer: PeerId,
    contract: Address,
    shard_id: ShardId,
    kind: InFlightKind,
}

struct SyncState {
    tasks: Vec<Task>,
    peers: PeerTable,
    in_flight: std::collections::HashMap<u64, InFlight>,
}

enum Prepared {
    Range {
        peer: PeerId,
        request: BlobsByRangeRequest,
    },
    List {
        peer: PeerId,
        request: BlobsByListRequest,
    },
}

/// Point-in-time view of the sync progress, served by the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct SyncStatus {
    pub sync_done: bool,
    pub peers: usize,
    pub empty_blobs_filled: u64,
    pub empty_blobs_to_fill: u64,
    pub shards: Vec<ShardStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ShardStatus {
    pub contract: String,
    pub shard_id: ShardId,
    pub phase: TaskPhase,
    pub pending_entries: u64,
    pub heal_entries: usize,
    pub done: bool,
}

/// The p2p shard synchronization client.
pub struct SyncClient {
    cfg: SyncConfig,
    storage: Arc<dyn StorageManager>,
    prover: Arc<dyn Prover>,
    host: Arc<dyn SyncHost>,
    store: TaskStore,
    state: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    sync_done: AtomicBool,
    empty_filled: AtomicU64,
    empty_to_fill: AtomicU64,
    next_request_id: AtomicU64,
    peer_events: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    controller: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    range_protocol: String,
    list_protocol: String,
}

impl SyncClient {
    /// Build the client. Fails fast when the storage holds no shards — a
    /// sync core with nothing to sync is a configuration error.
    pub fn new(
        cfg: SyncConfig,
        storage: Arc<dyn StorageManager>,
        prover: Arc<dyn Prover>,
        host: Arc<dyn SyncHost>,
        store: TaskStore,
        peer_events: mpsc::Receiver<PeerEvent>,
    ) -> Result<Arc<Self>, SyncError> {
        if storage.shards().is_empty() {
            return Err(SyncError::NoLocalShards);
        }
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        let range_protocol = common::blobs_by_range_protocol(cfg.chain_id);
        let list_protocol = common::blobs_by_list_protocol(cfg.chain_id);
        let max_peers = cfg.max_peers;
        Ok(Arc::new(SyncClient {
            cfg,
            storage,
            prover,
            host,
            store,
            state: Mutex::new(SyncState {
                tasks: Vec::new(),
                peers: PeerTable::new(max_peers),
                in_flight: Default::default(),
            }),
            events,
            wake: Notify::new(),
            shutdown,
            sync_done: AtomicBool::new(false),
            empty_filled: AtomicU64::new(0),
            empty_to_fill: AtomicU64::new(0),
            next_request_id: AtomicU64::new(1),
            peer_events: Mutex::new(Some(peer_events)),
            controller: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            range_protocol,
            list_protocol,
        }))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restore task progress from the store, creating fresh tasks for
    /// shards without a record.
    pub fn load_sync_status(&self) -> Result<()> {
        let contract = self.storage.contract_address();
        let shards = self.storage.shards();
        let last_kv = self.storage.last_kv_index()?;
        let tasks = self
            .store
            .load_tasks(
                contract,
                &shards,
                self.storage.kv_entries(),
                last_kv,
                self.cfg.max_subtask_span,
            )
            .map_err(|e| anyhow!("failed to load sync status: {e}"))?;

        let to_fill: u64 = tasks.iter().map(|t| t.end - t.empty_start).sum();
        let filled: u64 = tasks.iter().map(|t| t.empty_next - t.empty_start).sum();
        self.empty_to_fill.store(to_fill, Ordering::Relaxed);
        self.empty_filled.store(filled, Ordering::Relaxed);

        let mut state = self.state.lock();
        state.tasks = tasks;
        info!(
            shards = state.tasks.len(),
            last_kv,
            empty_to_fill = to_fill,
            "Loaded sync status"
        );
        Ok(())
    }

    /// Start the controller and the per-shard empty-fill workers.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.state.lock().tasks.is_empty() {
            self.load_sync_status()?;
        }
        let fills: Vec<(Address, ShardId)> = self
            .state
            .lock()
            .tasks
            .iter()
            .filter(|t| !t.empty_fill_complete())
            .map(|t| (t.contract, t.shard_id))
            .collect();
        for (contract, shard_id) in fills {
            self.spawn_empty_fill(contract, shard_id);
        }

        let rx = self
            .peer_events
            .lock()
            .take()
            .context("sync client already started")?;
        let handle = tokio::spawn(self.clone().run(rx));
        *self.controller.lock() = Some(handle);
        Ok(())
    }

    /// Signal shutdown, join the controller and workers, then save task
    /// state best-effort.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let controller = self.controller.lock().take();
        if let Some(handle) = controller {
            let _ = handle.await;
        }
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }
        if let Err(e) = self.save_sync_status() {
            warn!(error = %e, "Failed to save sync status on shutdown");
        }
        debug!("sync client closed");
    }

    /// Persist the current task state. In-flight heal indices are folded
    /// back into the serialized heal sets so a crash between save and
    /// response loses nothing.
    pub fn save_sync_status(&self) -> Result<()> {
        let mut snapshot = {
            let mut state = self.state.lock();
            let in_flight: Vec<InFlight> = state.in_flight.values().cloned().collect();
            clean_tasks(&mut state.tasks);
            let mut tasks = state.tasks.clone();
            for flight in in_flight {
                if let InFlightKind::List { indices } = flight.kind {
                    if let Some(task) = tasks
                        .iter_mut()
                        .find(|t| t.contract == flight.contract && t.shard_id == flight.shard_id)
                    {
                        task.heal.insert_all(indices, 0);
                    }
                }
            }
            tasks
        };
        clean_tasks(&mut snapshot);
        self.store
            .save_tasks(&snapshot)
            .map_err(|e| anyhow!("failed to save sync status: {e}"))?;
        trace!(tasks = snapshot.len(), "Saved sync status");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer management
    // ------------------------------------------------------------------

    /// Register a connected peer. Returns `false` when the table refuses it
    /// (full, or nothing advertised); the caller closes the connection.
    pub fn add_peer(&self, peer: PeerId, shards: ShardMap) -> bool {
        let added = self.state.lock().peers.add_peer(peer, shards);
        if added {
            info!(peer = %peer, "Peer joined");
            self.wake.notify_one();
        }
        added
    }

    /// Drop a disconnected peer and route its in-flight work to the heal
    /// tasks for immediate retry elsewhere.
    pub fn remove_peer(&self, peer: PeerId) {
        let mut state = self.state.lock();
        if state.peers.remove_peer(&peer).is_none() {
            return;
        }
        let stale: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        let now = now_millis();
        for request_id in stale {
            if let Some(flight) = state.in_flight.remove(&request_id) {
                Self::route_to_heal(&mut state.tasks, &flight, now);
            }
        }
        drop(state);
        info!(peer = %peer, "Peer left");
        self.wake.notify_one();
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn sync_done(&self) -> bool {
        self.sync_done.load(Ordering::Relaxed)
    }

    pub fn empty_blobs_filled(&self) -> u64 {
        self.empty_filled.load(Ordering::Relaxed)
    }

    pub fn empty_blobs_to_fill(&self) -> u64 {
        self.empty_to_fill.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.state.lock();
        SyncStatus {
            sync_done: self.sync_done(),
            peers: state.peers.len(),
            empty_blobs_filled: self.empty_blobs_filled(),
            empty_blobs_to_fill: self.empty_blobs_to_fill(),
            shards: state
                .tasks
                .iter()
                .map(|t| ShardStatus {
                    contract: t.contract.to_string(),
                    shard_id: t.shard_id,
                    phase: t.phase,
                    pending_entries: t.pending_entries(),
                    heal_entries: t.heal.len(),
                    done: t.done,
                })
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Controller loop
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>, mut peer_rx: mpsc::Receiver<PeerEvent>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(self.cfg.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut save_tick = tokio::time::interval(self.cfg.save_interval);
        save_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events_open = true;

        debug!("sync controller started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                event = peer_rx.recv(), if events_open => {
                    match event {
                        Some(PeerEvent::Connected { peer, shards }) => {
                            if !self.add_peer(peer, shards) {
                                debug!(peer = %peer, "Rejecting peer, closing connection");
                                self.host.disconnect(peer).await;
                            }
                        }
                        Some(PeerEvent::Disconnected { peer }) => self.remove_peer(peer),
                        None => events_open = false,
                    }
                }
                _ = self.wake.notified() => {}
                _ = tick.tick() => {}
                _ = save_tick.tick() => {
                    if let Err(e) = self.save_sync_status() {
                        warn!(error = %e, "Periodic sync status save failed");
                    }
                    self.workers.lock().retain(|handle| !handle.is_finished());
                }
            }
            self.dispatch();
            self.check_done();
        }
        debug!("sync controller stopped");
    }

    /// Match idle peers with pending work. Range requests go out first; a
    /// task falls back to list requests for its heal set only once every
    /// sub-task is drained.
    fn dispatch(self: &Arc<Self>) {
        let now = now_millis();
        let mut prepared: Vec<Prepared> = Vec::new();
        {
            let mut state = self.state.lock();
            let SyncState {
                tasks,
                peers,
                in_flight,
            } = &mut *state;

            for task in tasks.iter_mut() {
                if task.done {
                    continue;
                }
                let contract = task.contract;
                let shard_id = task.shard_id;

                if task.phase == TaskPhase::Pending && peers.any_advertises(contract, shard_id) {
                    debug!(contract = %contract, shard = shard_id, "Shard sync started");
                    task.phase = TaskPhase::Syncing;
                }

                // Range work.
                while let Some((pos, origin, end)) = task.next_range(self.cfg.max_request_entries)
                {
                    let Some(peer) =
                        peers.pick_peer(contract, shard_id, self.cfg.max_in_flight_per_peer)
                    else {
                        break;
                    };
                    let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
                    task.sub_tasks[pos].running = true;
                    if let Some(p) = peers.get_mut(&peer) {
                        p.in_flight += 1;
                    }
                    in_flight.insert(
                        request_id,
                        InFlight {
                            peer,
                            contract,
                            shard_id,
                            kind: InFlightKind::Range {
                                origin,
                                end,
                                subtask_first: task.sub_tasks[pos].first,
                            },
                        },
                    );
                    prepared.push(Prepared::Range {
                        peer,
                        request: BlobsByRangeRequest {
                            request_id,
                            contract,
                            shard_id,
                            origin,
                            limit: end - origin,
                            bytes: self.cfg.max_response_bytes,
                        },
                    });
                }

                // Heal work, once the ranges are drained.
                if task.ranges_drained() {
                    if task.phase == TaskPhase::Syncing {
                        debug!(contract = %contract, shard = shard_id, heal = task.heal.len(),
                            "Shard entered healing");
                        task.phase = TaskPhase::Healing;
                    }
                    while !task.heal.is_empty() {
                        let Some(peer) =
                            peers.pick_peer(contract, shard_id, self.cfg.max_in_flight_per_peer)
                        else {
                            break;
                        };
                        let indices = task.heal.take_expired(now, self.cfg.list_batch);
                        if indices.is_empty() {
                            break;
                        }
                        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
                        if let Some(p) = peers.get_mut(&peer) {
                            p.in_flight += 1;
                        }
                        in_flight.insert(
                            request_id,
                            InFlight {
                                peer,
                                contract,
                                shard_id,
                                kind: InFlightKind::List {
                                    indices: indices.clone(),
                                },
                            },
                        );
                        prepared.push(Prepared::List {
                            peer,
                            request: BlobsByListRequest {
                                request_id,
                                contract,
                                shard_id,
                                indices,
                            },
                        });
                    }

                    if !task.heal.is_empty()
                        && now.saturating_sub(task.last_progress_ms)
                            > self.cfg.stall_warn.as_millis() as u64
                    {
                        warn!(
                            contract = %contract,
                            shard = shard_id,
                            heal = task.heal.len(),
                            "Shard sync stalled; no peer serves the remaining indices"
                        );
                        task.last_progress_ms = now;
                    }
                }
            }
        }

        if prepared.is_empty() {
            return;
        }
        trace!(requests = prepared.len(), "Dispatching requests");
        for item in prepared {
            match item {
                Prepared::Range { peer, request } => {
                    let id = request.request_id;
                    self.spawn_worker(peer, self.range_protocol.clone(), id, request);
                }
                Prepared::List { peer, request } => {
                    let id = request.request_id;
                    self.spawn_worker(peer, self.list_protocol.clone(), id, request);
                }
            }
        }
    }

    fn spawn_worker<T>(self: &Arc<Self>, peer: PeerId, protocol: String, request_id: u64, request: T)
    where
        T: Encode + Send + Sync + 'static,
    {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            client.run_request(peer, protocol, request_id, request).await;
        });
        self.workers.lock().push(handle);
    }

    async fn run_request<T>(self: Arc<Self>, peer: PeerId, protocol: String, request_id: u64, request: T)
    where
        T: Encode + Send + Sync,
    {
        let started = Instant::now();
        let outcome: Result<BlobsResponse> =
            tokio::time::timeout(self.cfg.request_timeout, async {
                let mut stream = self.host.open_stream(peer, &protocol).await?;
                write_frame(&mut stream, &request).await?;
                let response: BlobsResponse = read_frame(&mut stream, MAX_FRAME_SIZE).await?;
                Ok(response)
            })
            .await
            .unwrap_or_else(|_| Err(anyhow!("request timed out")));

        match outcome {
            Ok(response) if response.request_id == request_id && response.status == STATUS_OK => {
                self.on_response(request_id, response, started.elapsed()).await;
            }
            Ok(response) => {
                self.on_request_failed(
                    request_id,
                    &anyhow!(
                        "bad response: id {} status {}",
                        response.request_id,
                        response.status
                    ),
                )
                .await;
            }
            Err(e) => self.on_request_failed(request_id, &e).await,
        }
        self.wake.notify_one();
    }

    // ------------------------------------------------------------------
    // Response handling
    // ------------------------------------------------------------------

    async fn on_response(&self, request_id: u64, response: BlobsResponse, rtt: Duration) {
        // Pop the reservation first; a request whose peer disconnected
        // mid-flight has already been rerouted and its payloads are stale.
        let Some(flight) = self.state.lock().in_flight.remove(&request_id) else {
            trace!(request_id, "Dropping stale response");
            return;
        };

        {
            let mut state = self.state.lock();
            if let Some(peer) = state.peers.get_mut(&flight.peer) {
                peer.in_flight = peer.in_flight.saturating_sub(1);
                peer.record_rtt(rtt);
            }
        }

        let requested: Vec<KvIndex> = match &flight.kind {
            InFlightKind::Range { origin, end, .. } => (*origin..*end).collect(),
            InFlightKind::List { indices } => indices.clone(),
        };

        // Keep only payloads we actually asked for, in ascending order so
        // the sub-task cursor observes them in sequence.
        let mut payloads = response.payloads;
        payloads.retain(|p| requested.contains(&p.blob_index));
        payloads.sort_by_key(|p| p.blob_index);
        payloads.dedup_by_key(|p| p.blob_index);

        // Verify and write outside the state lock; commits may touch disk.
        let mut accepted: Vec<KvIndex> = Vec::with_capacity(payloads.len());
        let mut peer_fault = false;
        for payload in &payloads {
            match self.verify_and_store(payload) {
                Ok(()) => accepted.push(payload.blob_index),
                Err(reason) => {
                    debug!(
                        peer = %flight.peer,
                        kv = payload.blob_index,
                        reason = %reason,
                        "Rejected blob payload"
                    );
                    peer_fault |= reason.peer_fault();
                }
            }
        }

        let mut drop_peer = None;
        {
            let mut state = self.state.lock();
            let now = now_millis();
            let failures = match state.peers.get_mut(&flight.peer) {
                Some(peer) => {
                    if peer_fault {
                        peer.failures += 1;
                    }
                    peer.failures
                }
                None => 0,
            };
            if failures >= self.cfg.max_peer_failures {
                drop_peer = Some(flight.peer);
            }

            let heal_deadline = if peer_fault {
                self.heal_deadline(now, failures)
            } else {
                // Absent indices are not the peer's fault; retry soon.
                now + self.cfg.heal_backoff.as_millis() as u64
            };

            if let Some(task) = state
                .tasks
                .iter_mut()
                .find(|t| t.contract == flight.contract && t.shard_id == flight.shard_id)
            {
                let missing: Vec<KvIndex> = requested
                    .iter()
                    .copied()
                    .filter(|kv| accepted.binary_search(kv).is_err())
                    .collect();
                match flight.kind {
                    InFlightKind::Range {
                        origin,
                        end,
                        subtask_first,
                    } => {
                        if let Some(sub) = task
                            .sub_tasks
                            .iter_mut()
                            .find(|s| s.first == subtask_first)
                        {
                            sub.next = end;
                            sub.running = false;
                        }
                        task.heal.insert_all(missing.iter().copied(), heal_deadline);
                        trace!(
                            peer = %flight.peer,
                            origin,
                            end,
                            accepted = accepted.len(),
                            healing = missing.len(),
                            "Range response applied"
                        );
                    }
                    InFlightKind::List { .. } => {
                        task.heal.insert_all(missing.iter().copied(), heal_deadline);
                        trace!(
                            peer = %flight.peer,
                            accepted = accepted.len(),
                            healing = missing.len(),
                            "List response applied"
                        );
                    }
                }
                if !accepted.is_empty() {
                    task.last_progress_ms = now;
                }
            }
        }

        if let Some(peer) = drop_peer {
            warn!(peer = %peer, "Dropping peer after repeated failures");
            self.remove_peer(peer);
            self.host.disconnect(peer).await;
        }
    }

    async fn on_request_failed(&self, request_id: u64, error: &anyhow::Error) {
        let mut drop_peer = None;
        {
            let mut state = self.state.lock();
            let Some(flight) = state.in_flight.remove(&request_id) else {
                return;
            };
            debug!(peer = %flight.peer, request_id, error = %error, "Request failed");

            let failures = match state.peers.get_mut(&flight.peer) {
                Some(peer) => {
                    peer.in_flight = peer.in_flight.saturating_sub(1);
                    peer.failures += 1;
                    peer.failures
                }
                None => 0,
            };
            if failures >= self.cfg.max_peer_failures {
                drop_peer = Some(flight.peer);
            }

            let now = now_millis();
            let deadline = self.heal_deadline(now, failures);
            Self::route_to_heal(&mut state.tasks, &flight, deadline);
        }

        if let Some(peer) = drop_peer {
            warn!(peer = %peer, "Dropping peer after repeated failures");
            self.remove_peer(peer);
            self.host.disconnect(peer).await;
        }
    }

    /// Return a failed request's indices to its task's heal set, advancing
    /// the owning sub-task past the range (the heal set owns those indices
    /// now).
    fn route_to_heal(tasks: &mut [Task], flight: &InFlight, deadline_ms: u64) {
        let Some(task) = tasks
            .iter_mut()
            .find(|t| t.contract == flight.contract && t.shard_id == flight.shard_id)
        else {
            return;
        };
        match &flight.kind {
            InFlightKind::Range {
                origin,
                end,
                subtask_first,
            } => {
                if let Some(sub) = task
                    .sub_tasks
                    .iter_mut()
                    .find(|s| s.first == *subtask_first)
                {
                    sub.next = *end;
                    sub.running = false;
                }
                task.heal.insert_all(*origin..*end, deadline_ms);
            }
            InFlightKind::List { indices } => {
                task.heal.insert_all(indices.iter().copied(), deadline_ms);
            }
        }
    }

    fn heal_deadline(&self, now_ms: u64, failures: u32) -> u64 {
        let base = self.cfg.heal_backoff.as_millis() as u64;
        let shift = failures.min(HEAL_BACKOFF_MAX_SHIFT);
        let backoff = base
            .saturating_mul(1u64 << shift)
            .min(self.cfg.heal_backoff_max.as_millis() as u64);
        now_ms + backoff
    }

    // ------------------------------------------------------------------
    // Validation + write-through
    // ------------------------------------------------------------------

    /// Verify one payload against the chain view and the prover, convert it
    /// to the local encoding and write it. Runs without the state lock.
    fn verify_and_store(&self, payload: &BlobPayload) -> Result<(), Reject> {
        let kv = payload.blob_index;

        let meta = self
            .storage
            .try_read_meta(kv)
            .map_err(|e| Reject::StorageRead(e.to_string()))?
            .ok_or(Reject::UnknownSlot)?;
        if meta != payload.blob_commit {
            return Err(Reject::CommitmentMismatch);
        }

        let encoding = EncodingKind::from_u64(payload.encode_type)
            .ok_or(Reject::UnknownEncoding(payload.encode_type))?;
        let max_kv_size = self.storage.max_kv_size();
        if payload.encoded_blob.len() as u64 > max_kv_size {
            return Err(Reject::Oversize);
        }

        let decoded = self
            .storage
            .decode_kv(
                kv,
                &payload.encoded_blob,
                payload.blob_commit,
                payload.miner_address,
                encoding,
            )
            .map_err(|e| Reject::DecodeFailed(e.to_string()))?;

        let chunk_size = self.storage.chunk_size();
        let chunks_per_kv = max_kv_size / chunk_size;
        let root = self
            .prover
            .get_root(&decoded, chunks_per_kv, chunk_size)
            .map_err(|e| Reject::DecodeFailed(e.to_string()))?;
        if !payload.blob_commit.matches_root(&root) {
            return Err(Reject::RootMismatch);
        }

        let shard_id = shard_of(kv, self.storage.kv_entries());
        let local_encoding = self
            .storage
            .shard_encode_type(shard_id)
            .ok_or(Reject::UnknownSlot)?;
        let local_miner = self.storage.shard_miner(shard_id).unwrap_or(Address::ZERO);

        let encoded = if local_encoding == encoding && local_miner == payload.miner_address {
            payload.encoded_blob.clone()
        } else {
            self.storage
                .encode_kv(
                    kv,
                    &decoded,
                    payload.blob_commit,
                    local_miner,
                    local_encoding,
                )
                .map_err(|e| Reject::StorageWrite(e.to_string()))?
        };

        self.storage
            .commit_blob(kv, &encoded, payload.blob_commit)
            .map_err(|e| Reject::StorageWrite(e.to_string()))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Empty fill
    // ------------------------------------------------------------------

    /// One cooperative worker per shard writes the empty marker into every
    /// slot at or beyond the chain's last populated index, yielding after
    /// each slot so shutdown can interrupt the pass. The cursor persists
    /// with the task, so an interrupted pass resumes on the next start.
    fn spawn_empty_fill(self: &Arc<Self>, contract: Address, shard_id: ShardId) {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            let shutdown_rx = client.shutdown.subscribe();
            let (mut kv, end) = {
                let state = client.state.lock();
                let Some(task) = state
                    .tasks
                    .iter()
                    .find(|t| t.contract == contract && t.shard_id == shard_id)
                else {
                    return;
                };
                (task.empty_next, task.end)
            };
            if kv >= end {
                return;
            }

            let commit = Commitment::empty_marker();
            let miner = client.storage.shard_miner(shard_id).unwrap_or(Address::ZERO);
            let Some(encoding) = client.storage.shard_encode_type(shard_id) else {
                return;
            };
            let zeros = vec![0u8; client.storage.max_kv_size() as usize];

            debug!(contract = %contract, shard = shard_id, from = kv, to = end, "Empty fill started");
            while kv < end {
                if *shutdown_rx.borrow() {
                    debug!(contract = %contract, shard = shard_id, at = kv, "Empty fill interrupted");
                    return;
                }
                let write = client
                    .storage
                    .encode_kv(kv, &zeros, commit, miner, encoding)
                    .and_then(|encoded| client.storage.commit_blob(kv, &encoded, commit));
                if let Err(e) = write {
                    error!(contract = %contract, shard = shard_id, kv, error = %e, "Empty fill write failed");
                    return;
                }
                kv += 1;
                client.empty_filled.fetch_add(1, Ordering::Relaxed);
                {
                    let mut state = client.state.lock();
                    if let Some(task) = state
                        .tasks
                        .iter_mut()
                        .find(|t| t.contract == contract && t.shard_id == shard_id)
                    {
                        task.empty_next = kv;
                    }
                }
                tokio::task::yield_now().await;
            }
            debug!(contract = %contract, shard = shard_id, "Empty fill complete");
            client.wake.notify_one();
        });
        self.workers.lock().push(handle);
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn check_done(&self) {
        let mut events: Vec<SyncEvent> = Vec::new();
        {
            let mut state = self.state.lock();
            let busy: std::collections::HashSet<(Address, ShardId)> = state
                .in_flight
                .values()
                .map(|f| (f.contract, f.shard_id))
                .collect();
            let SyncState { tasks, .. } = &mut *state;
            for task in tasks.iter_mut() {
                if task.done || busy.contains(&(task.contract, task.shard_id)) {
                    continue;
                }
                if task.check_done() {
                    task.phase = TaskPhase::Done;
                    info!(contract = %task.contract, shard = task.shard_id, "Shard sync done");
                    events.push(SyncEvent::ShardDone {
                        contract: task.contract,
                        shard_id: task.shard_id,
                    });
                }
            }
            if !tasks.is_empty()
                && tasks.iter().all(|t| t.done)
                && !self.sync_done.swap(true, Ordering::Relaxed)
            {
                info!("All shards synced");
                events.push(SyncEvent::AllShardDone);
            }
        }
        for event in events {
            let _ = self.events.send(event);
        }
    }

    // ------------------------------------------------------------------
    // One-shot requests
    // ------------------------------------------------------------------

    /// Fetch and store blobs for `[origin, end)` from one advertising peer,
    /// bypassing the task machinery. Returns the number of blobs written.
    pub async fn request_range(&self, contract: Address, origin: KvIndex, end: KvIndex) -> Result<u64> {
        let shard_id = shard_of(origin, self.storage.kv_entries());
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = BlobsByRangeRequest {
            request_id,
            contract,
            shard_id,
            origin,
            limit: end.saturating_sub(origin),
            bytes: self.cfg.max_response_bytes,
        };
        self.one_shot(contract, shard_id, &self.range_protocol, request_id, request, |p| {
            (origin..end).contains(&p.blob_index)
        })
        .await
    }

    /// Fetch and store blobs for the given indices (all within one shard)
    /// from one advertising peer. Returns the number of blobs written.
    pub async fn request_list(&self, contract: Address, indices: Vec<KvIndex>) -> Result<u64> {
        let first = *indices.first().context("empty index list")?;
        let shard_id = shard_of(first, self.storage.kv_entries());
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let wanted = indices.clone();
        let request = BlobsByListRequest {
            request_id,
            contract,
            shard_id,
            indices,
        };
        self.one_shot(contract, shard_id, &self.list_protocol, request_id, request, move |p| {
            wanted.contains(&p.blob_index)
        })
        .await
    }

    async fn one_shot<T, F>(
        &self,
        contract: Address,
        shard_id: ShardId,
        protocol: &str,
        request_id: u64,
        request: T,
        wanted: F,
    ) -> Result<u64>
    where
        T: Encode,
        F: Fn(&BlobPayload) -> bool,
    {
        let peer = self
            .state
            .lock()
            .peers
            .pick_peer(contract, shard_id, usize::MAX)
            .with_context(|| format!("no connected peer advertises shard {shard_id}"))?;

        let response: BlobsResponse = tokio::time::timeout(self.cfg.request_timeout, async {
            let mut stream = self.host.open_stream(peer, protocol).await?;
            write_frame(&mut stream, &request).await?;
            Ok::<_, anyhow::Error>(read_frame(&mut stream, MAX_FRAME_SIZE).await?)
        })
        .await
        .map_err(|_| anyhow!("request timed out"))??;

        if response.request_id != request_id || response.status != STATUS_OK {
            return Err(anyhow!("bad response: status {}", response.status));
        }

        let mut written = 0u64;
        for payload in response.payloads.iter().filter(|p| wanted(p)) {
            match self.verify_and_store(payload) {
                Ok(()) => written += 1,
                Err(reason) => {
                    debug!(kv = payload.blob_index, reason = %reason, "Rejected blob payload");
                }
            }
        }
        Ok(written)
    }
}
