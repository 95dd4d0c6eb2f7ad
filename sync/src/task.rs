//! Per-shard sync work tracking.
//!
//! A [`Task`] owns everything still to do for one `(contract, shard)` pair:
//! contiguous [`SubTask`] ranges scheduled for range requests, a
//! [`HealTask`] of individual indices retried through list requests, and
//! the cursor of the empty-fill pass over the tail beyond the chain's last
//! populated index.
//!
//! Invariants maintained here:
//! - an index is either pending inside a sub-task (`[next..=last]`) or in
//!   the heal set, never both;
//! - at creation, sub-tasks plus the empty-fill range cover the shard's
//!   full index range exactly;
//! - `done` is sticky within a run and recomputed from persisted state on
//!   restart.

use common::{Address, KvIndex, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A contiguous range `[first, last]` (inclusive) scheduled for range
/// requests. `next` is the fetch cursor; the sub-task is drained once
/// `next > last`. `running` marks an in-flight range request so a range is
/// never requested twice concurrently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubTask {
    pub first: KvIndex,
    pub last: KvIndex,
    pub next: KvIndex,
    pub running: bool,
}

impl SubTask {
    pub fn is_drained(&self) -> bool {
        self.next > self.last
    }

    /// Entries not yet fetched.
    pub fn pending(&self) -> u64 {
        (self.last + 1).saturating_sub(self.next)
    }
}

/// Individual indices to retry, each with a retry deadline in Unix millis.
/// Taking a batch removes the entries, which doubles as the in-flight
/// reservation; failed batches are re-inserted with a fresh deadline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealTask {
    indices: BTreeMap<KvIndex, u64>,
}

impl HealTask {
    pub fn insert(&mut self, kv_index: KvIndex, deadline_ms: u64) {
        self.indices.insert(kv_index, deadline_ms);
    }

    pub fn insert_all(&mut self, indices: impl IntoIterator<Item = KvIndex>, deadline_ms: u64) {
        for idx in indices {
            self.indices.insert(idx, deadline_ms);
        }
    }

    /// Remove and return up to `max` indices whose deadline has passed.
    pub fn take_expired(&mut self, now_ms: u64, max: usize) -> Vec<KvIndex> {
        let ready: Vec<KvIndex> = self
            .indices
            .iter()
            .filter(|(_, deadline)| **deadline <= now_ms)
            .map(|(idx, _)| *idx)
            .take(max)
            .collect();
        for idx in &ready {
            self.indices.remove(idx);
        }
        ready
    }

    pub fn contains(&self, kv_index: KvIndex) -> bool {
        self.indices.contains_key(&kv_index)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = KvIndex> + '_ {
        self.indices.keys().copied()
    }
}

/// Lifecycle of a task within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// No advertising peer seen yet.
    Pending,
    /// Range requests in progress.
    Syncing,
    /// Ranges drained; only heal retries and empty-fill remain.
    Healing,
    /// Everything verified and written.
    Done,
}

/// All sync work for one `(contract, shard)` pair.
#[derive(Clone, Debug)]
pub struct Task {
    pub contract: Address,
    pub shard_id: ShardId,
    /// Full shard range `[start, end)`.
    pub start: KvIndex,
    pub end: KvIndex,
    pub sub_tasks: Vec<SubTask>,
    pub heal: HealTask,
    pub done: bool,
    pub phase: TaskPhase,
    /// First index of the empty-fill range (the chain's last populated
    /// index clamped into the shard).
    pub empty_start: KvIndex,
    /// Empty-fill cursor; the pass is complete once it reaches `end`.
    pub empty_next: KvIndex,
    /// Unix millis of the last accepted write, for stall reporting.
    pub last_progress_ms: u64,
}

impl Task {
    /// Build a fresh task: the syncable prefix `[start, cap)` split into
    /// sub-tasks of at most `max_span` entries, an empty heal set, and the
    /// empty-fill range `[cap, end)`, where `cap` clamps the chain's last
    /// populated index into the shard.
    pub fn new(
        contract: Address,
        shard_id: ShardId,
        kv_entries: u64,
        last_kv: KvIndex,
        max_span: u64,
    ) -> Self {
        let start = shard_id * kv_entries;
        let end = (shard_id + 1) * kv_entries;
        let cap = last_kv.clamp(start, end);

        let mut sub_tasks = Vec::new();
        let mut first = start;
        while first < cap {
            let last = (first + max_span).min(cap) - 1;
            sub_tasks.push(SubTask {
                first,
                last,
                next: first,
                running: false,
            });
            first = last + 1;
        }

        Task {
            contract,
            shard_id,
            start,
            end,
            sub_tasks,
            heal: HealTask::default(),
            done: false,
            phase: TaskPhase::Pending,
            empty_start: cap,
            empty_next: cap,
            last_progress_ms: common::now_millis(),
        }
    }

    /// The next dispatchable range: `[origin, end)` taken from the first
    /// sub-task that is neither drained nor already running, capped at
    /// `batch` entries. Returns the sub-task's position so the caller can
    /// mark it running under the same lock.
    pub fn next_range(&self, batch: u64) -> Option<(usize, KvIndex, KvIndex)> {
        self.sub_tasks
            .iter()
            .position(|st| !st.running && !st.is_drained())
            .map(|pos| {
                let st = &self.sub_tasks[pos];
                (pos, st.next, (st.next + batch).min(st.last + 1))
            })
    }

    pub fn ranges_drained(&self) -> bool {
        self.sub_tasks.iter().all(|st| st.is_drained())
    }

    pub fn empty_fill_complete(&self) -> bool {
        self.empty_next >= self.end
    }

    /// Entries still pending across all sub-tasks.
    pub fn pending_entries(&self) -> u64 {
        self.sub_tasks.iter().map(|st| st.pending()).sum()
    }

    /// Whether this run can consider the task finished. `done` stays sticky
    /// once set.
    pub fn check_done(&mut self) -> bool {
        if !self.done
            && self.ranges_drained()
            && self.heal.is_empty()
            && self.empty_fill_complete()
        {
            self.done = true;
        }
        self.done
    }
}

/// Drop drained sub-tasks and settle `done` flags. Run before every save so
/// the persisted form is canonical (`save -> load -> save` is the identity).
pub fn clean_tasks(tasks: &mut [Task]) {
    for task in tasks.iter_mut() {
        task.sub_tasks.retain(|st| !st.is_drained());
        task.check_done();
        if task.done {
            task.phase = TaskPhase::Done;
        }
    }
}

// ============================================================================
// Persisted form
// ============================================================================

/// Serialized task progress. Heal deadlines are dropped on purpose: a
/// reloaded index is retried immediately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub sub_tasks: Vec<SubTaskRecord>,
    pub heal_indices: Vec<KvIndex>,
    pub done: bool,
    pub empty_next: KvIndex,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskRecord {
    pub first: KvIndex,
    pub last: KvIndex,
    pub next: KvIndex,
}

impl Task {
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            sub_tasks: self
                .sub_tasks
                .iter()
                .map(|st| SubTaskRecord {
                    first: st.first,
                    last: st.last,
                    next: st.next,
                })
                .collect(),
            heal_indices: self.heal.indices().collect(),
            done: self.done,
            empty_next: self.empty_next,
        }
    }

    /// Rebuild a task from its persisted record. Sub-tasks that fall
    /// entirely beyond the current syncable prefix are dropped (their slots
    /// are owned by the empty-fill pass); heal deadlines reset to zero.
    pub fn from_record(
        contract: Address,
        shard_id: ShardId,
        kv_entries: u64,
        last_kv: KvIndex,
        record: &TaskRecord,
    ) -> Self {
        let start = shard_id * kv_entries;
        let end = (shard_id + 1) * kv_entries;
        let cap = last_kv.clamp(start, end);

        let mut sub_tasks: Vec<SubTask> = record
            .sub_tasks
            .iter()
            .filter(|st| st.next < cap && st.first < cap)
            .map(|st| SubTask {
                first: st.first,
                last: st.last.min(cap - 1),
                next: st.next,
                running: false,
            })
            .collect();
        sub_tasks.sort_by_key(|st| st.first);

        let mut heal = HealTask::default();
        heal.insert_all(record.heal_indices.iter().copied(), 0);

        // `done` is never trusted from disk: the controller recomputes it
        // from the restored sub-tasks, heal set and empty-fill cursor.
        Task {
            contract,
            shard_id,
            start,
            end,
            sub_tasks,
            heal,
            done: false,
            phase: TaskPhase::Pending,
            empty_start: cap,
            empty_next: record.empty_next.clamp(cap, end),
            last_progress_ms: common::now_millis(),
        }
    }
}
