//! Flush summaries, status snapshots, and running counters.

use crate::network::NetworkStatus;
use crate::retry::RetryStats;
use serde::Serialize;
use syncwell_protocol::NetworkTier;
use syncwell_store::StatusCounts;

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    /// Operations dispatched.
    pub dispatched: usize,
    /// Operations applied remotely, or found already applied.
    pub completed: usize,
    /// Operations whose local edit was superseded by a newer remote copy.
    pub superseded: usize,
    /// Conflicts detected.
    pub conflicts: usize,
    /// Operations parked, waiting on a manual decision or cancelled.
    pub parked: usize,
    /// Operations that ran out of retries or hit a permanent failure.
    pub failed: usize,
    /// Operations returned to pending because the cycle was interrupted.
    pub requeued: usize,
    /// The link went down or the queue was aborted during the cycle.
    pub interrupted: bool,
    /// Wall time of the cycle in milliseconds.
    pub duration_ms: u64,
}

impl FlushSummary {
    /// Operations that finished one way or another.
    pub fn finished(&self) -> usize {
        self.completed + self.superseded + self.parked + self.failed + self.requeued
    }
}

/// What the application is told about sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Remote calls may be attempted.
    pub online: bool,
    /// Connectivity state.
    pub network: NetworkStatus,
    /// Link-quality tier.
    pub tier: NetworkTier,
    /// Operations waiting to be flushed.
    pub pending_count: usize,
    /// Operations that need [`retry_failed`](super::OfflineManager::retry_failed).
    pub failed_count: usize,
    /// A flush cycle is running.
    pub sync_in_progress: bool,
    /// Some conflict waits on a manual decision.
    pub has_conflicts: bool,
    /// Errors still being handled.
    pub active_errors: usize,
    /// Flushing is paused by full isolation.
    pub paused: bool,
    /// Sync is disabled by strict isolation.
    pub available: bool,
}

/// Aggregate statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Operations by status.
    pub operations: StatusCounts,
    /// Total time spent disconnected, in milliseconds.
    pub offline_duration_ms: u64,
    /// Flush cycles run.
    pub flushes: u64,
    /// Operations applied remotely.
    pub operations_synced: u64,
    /// Estimated bytes sent to the remote backend.
    pub bytes_sent: u64,
    /// Estimated bytes saved by batching and by skipping identical content.
    pub bandwidth_saved: u64,
    /// Conflicts detected.
    pub conflicts_detected: u64,
    /// Conflicts resolved, automatically or by the application.
    pub conflicts_resolved: u64,
    /// Local edits superseded by newer remote copies.
    pub superseded: u64,
    /// Summary of the most recent flush.
    pub last_flush: Option<FlushSummary>,
    /// Retry statistics.
    pub retry: RetryStats,
}

/// Counters updated by the flush worker.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub flushes: u64,
    pub operations_synced: u64,
    pub bytes_sent: u64,
    pub bandwidth_saved: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub superseded: u64,
    pub last_flush: Option<FlushSummary>,
}

impl Counters {
    /// Records one remote request carrying `payload` bytes.
    pub fn sent(&mut self, payload: usize, overhead: u64) {
        self.bytes_sent += payload as u64 + overhead;
    }

    /// Records `requests` requests avoided, plus `payload` bytes not sent.
    pub fn saved(&mut self, requests: usize, payload: usize, overhead: u64) {
        self.bandwidth_saved += requests as u64 * overhead + payload as u64;
    }
}
