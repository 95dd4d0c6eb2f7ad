//! Persistent sync progress using ReDB.
//!
//! Task progress is saved per `(contract, shard)` under the `"sync-status"`
//! table so a restarted node resumes where it left off instead of
//! re-fetching whole shards.
//!
//! # Data Model
//!
//! Key: `contract (20 bytes) || shard_id (8 bytes big-endian)`.
//! Value: JSON [`TaskRecord`] — the sub-task cursors, the heal indices
//! (deadlines are not persisted; a reloaded index retries immediately) and
//! the empty-fill cursor.
//!
//! # Crash Recovery
//!
//! `load_tasks` drops records for shards that are no longer locally held
//! (deleting the stale keys) and synthesizes fresh tasks for held shards
//! that have no record yet, so the in-memory task list always covers
//! exactly the local shard set.

#![allow(clippy::result_large_err)]

use crate::task::{Task, TaskRecord};
use common::{Address, ShardId};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// Table holding one record per locally held shard.
const SYNC_STATUS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sync-status");

const KEY_LEN: usize = 28;

fn task_key(contract: Address, shard_id: ShardId) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..20].copy_from_slice(contract.as_bytes());
    key[20..].copy_from_slice(&shard_id.to_be_bytes());
    key
}

fn parse_key(key: &[u8]) -> Option<(Address, ShardId)> {
    if key.len() != KEY_LEN {
        return None;
    }
    let mut contract = [0u8; 20];
    contract.copy_from_slice(&key[..20]);
    let shard_id = u64::from_be_bytes(key[20..].try_into().ok()?);
    Some((Address(contract), shard_id))
}

/// Persistent store for per-shard sync progress.
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    /// Open or create the database at the given path. An unopenable
    /// database is a fatal initialization failure for the sync core.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, redb::Error> {
        let db = Database::create(path)?;

        // Ensure the table exists
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SYNC_STATUS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Persist every task in one transaction. Callers run
    /// [`crate::task::clean_tasks`] first so the stored form is canonical.
    pub fn save_tasks(&self, tasks: &[Task]) -> Result<(), redb::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SYNC_STATUS_TABLE)?;
            for task in tasks {
                let key = task_key(task.contract, task.shard_id);
                match serde_json::to_vec(&task.to_record()) {
                    Ok(json) => {
                        table.insert(key.as_slice(), json.as_slice())?;
                    }
                    Err(e) => {
                        warn!(
                            contract = %task.contract,
                            shard = task.shard_id,
                            error = %e,
                            "Failed to serialize task record, skipping"
                        );
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load progress for the given local shard set.
    ///
    /// Held shards without a record get a fresh task; records for shards no
    /// longer held are deleted. Returns tasks ordered by shard id.
    pub fn load_tasks(
        &self,
        contract: Address,
        local_shards: &[ShardId],
        kv_entries: u64,
        last_kv: u64,
        max_subtask_span: u64,
    ) -> Result<Vec<Task>, redb::Error> {
        let wanted: BTreeSet<ShardId> = local_shards.iter().copied().collect();
        let mut records: Vec<(ShardId, TaskRecord)> = Vec::new();
        let mut stale: Vec<Vec<u8>> = Vec::new();

        {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SYNC_STATUS_TABLE)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let Some((rec_contract, shard_id)) = parse_key(key.value()) else {
                    stale.push(key.value().to_vec());
                    continue;
                };
                if rec_contract != contract || !wanted.contains(&shard_id) {
                    debug!(
                        contract = %rec_contract,
                        shard = shard_id,
                        "Dropping persisted task for shard no longer held"
                    );
                    stale.push(key.value().to_vec());
                    continue;
                }
                match serde_json::from_slice::<TaskRecord>(value.value()) {
                    Ok(record) => records.push((shard_id, record)),
                    Err(e) => {
                        warn!(shard = shard_id, error = %e, "Corrupt task record, recreating");
                        stale.push(key.value().to_vec());
                    }
                }
            }
        }

        if !stale.is_empty() {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(SYNC_STATUS_TABLE)?;
                for key in &stale {
                    table.remove(key.as_slice())?;
                }
            }
            write_txn.commit()?;
        }

        let mut tasks: Vec<Task> = Vec::with_capacity(wanted.len());
        for shard_id in &wanted {
            match records.iter().find(|(id, _)| id == shard_id) {
                Some((_, record)) => {
                    tasks.push(Task::from_record(
                        contract, *shard_id, kv_entries, last_kv, record,
                    ));
                }
                None => {
                    tasks.push(Task::new(
                        contract,
                        *shard_id,
                        kv_entries,
                        last_kv,
                        max_subtask_span,
                    ));
                }
            }
        }
        Ok(tasks)
    }

    /// Number of persisted records.
    pub fn len(&self) -> Result<usize, redb::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SYNC_STATUS_TABLE)?;
        let mut count = 0;
        for _ in table.iter()? {
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, redb::Error> {
        Ok(self.len()? == 0)
    }
}
