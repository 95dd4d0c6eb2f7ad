//! Tuning constants for the sync core.
//!
//! These back the defaults of [`crate::client::SyncConfig`]; deployments
//! override them through the config rather than editing this file.

/// Maximum peers tracked by the sync client; additional connections are
/// rejected and closed.
pub const DEFAULT_MAX_PEERS: usize = 30;

/// Concurrent outstanding requests allowed per peer.
pub const DEFAULT_MAX_IN_FLIGHT_PER_PEER: usize = 2;

/// Largest span covered by a single sub-task, bounded so one range request
/// fits comfortably in a stream window.
pub const DEFAULT_MAX_SUBTASK_SPAN: u64 = 4096;

/// Largest number of entries requested in one range request.
pub const DEFAULT_MAX_REQUEST_ENTRIES: u64 = 32;

/// Largest number of heal indices packed into one list request.
pub const DEFAULT_LIST_BATCH: usize = 32;

/// Hard per-request deadline; expired requests are cancelled and their
/// indices routed to the heal task.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Base retry delay for heal indices; doubles per recorded peer failure.
pub const DEFAULT_HEAL_BACKOFF_MS: u64 = 100;

/// Ceiling on the heal retry delay.
pub const DEFAULT_HEAL_BACKOFF_MAX_MS: u64 = 1_000;

/// Exponent cap for the heal back-off doubling.
pub const HEAL_BACKOFF_MAX_SHIFT: u32 = 4;

/// Transport or validation faults tolerated before a peer is dropped.
pub const DEFAULT_MAX_PEER_FAILURES: u32 = 16;

/// Dispatch tick; also bounds how quickly expired heal deadlines are seen.
pub const DEFAULT_TICK_MS: u64 = 50;

/// Cadence of periodic task-state saves.
pub const DEFAULT_SAVE_INTERVAL_MS: u64 = 10_000;

/// Response byte budget advertised in range requests.
pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;

/// A shard whose heal set sees no progress for this long logs a stall
/// warning (it stays unfinished either way).
pub const DEFAULT_STALL_WARN_SECS: u64 = 60;

/// How long the server waits for a request frame on an accepted stream.
pub const SERVER_READ_TIMEOUT_SECS: u64 = 30;

/// Server-side cap on `limit` in a range request.
pub const MAX_RANGE_REQUEST_ENTRIES: u64 = 1024;

/// Server-side cap on the index count in a list request.
pub const MAX_LIST_REQUEST_ENTRIES: usize = 512;

/// Largest request frame the server will read.
pub const MAX_REQUEST_FRAME_BYTES: usize = 64 * 1024;
