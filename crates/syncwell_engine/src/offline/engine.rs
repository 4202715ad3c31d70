//! State shared by the manager, the flush worker, and recovery.

use super::stats::Counters;
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::isolation::ErrorIsolator;
use crate::local::LocalStore;
use crate::network::NetworkMonitor;
use crate::remote::RemoteBackend;
use crate::retry::{RetryConditions, RetryManager};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use syncwell_protocol::{EntityKey, Operation, OperationStatus};
use syncwell_store::OperationStore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) struct SyncEngine {
    pub config: SyncConfig,
    pub store: Arc<OperationStore>,
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteBackend>,
    pub network: Arc<NetworkMonitor>,
    pub retry: RetryManager,
    pub conditions: RwLock<RetryConditions>,
    pub resolver: ConflictResolver,
    pub isolator: Arc<ErrorIsolator>,
    pub events: EventBus,
    pub counters: Mutex<Counters>,
    /// Serializes local-store writes made by the application and by sync,
    /// so sync never overwrites an edit it has not seen.
    pub local_writes: Mutex<()>,
    /// Held for the duration of a flush cycle.
    pub flush_gate: tokio::sync::Mutex<()>,
    pub flush_requested: AtomicBool,
    pub tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Returns an error if a flush cycle may not start now.
    pub fn check_flushable(&self) -> SyncResult<()> {
        if !self.isolator.is_available() {
            return Err(SyncError::Unavailable("strict isolation in effect".into()));
        }
        if self.isolator.is_flush_paused() {
            return Err(SyncError::Unavailable("flushing paused by isolation".into()));
        }
        if !self.network.is_connected() {
            return Err(SyncError::Offline);
        }
        Ok(())
    }

    /// Returns true while new operations may be dispatched.
    pub fn can_dispatch(&self) -> bool {
        self.check_flushable().is_ok()
    }

    /// Requests a flush cycle in the background.
    ///
    /// Requests made while a cycle runs are coalesced into one more cycle
    /// after it.
    pub fn kick(self: &Arc<Self>) {
        self.flush_requested.store(true, Ordering::SeqCst);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, flush request kept for later");
            return;
        };
        let this = Arc::clone(self);
        let task = runtime.spawn(async move { this.drain_requests().await });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn drain_requests(self: &Arc<Self>) {
        loop {
            let Ok(guard) = self.flush_gate.try_lock() else {
                // The running cycle will see the request.
                return;
            };
            if !self.flush_requested.swap(false, Ordering::SeqCst) {
                drop(guard);
                if self.flush_requested.load(Ordering::SeqCst) {
                    continue;
                }
                return;
            }
            match self.check_flushable() {
                Ok(()) => {
                    self.run_cycle().await;
                }
                Err(reason) => debug!(%reason, "flush skipped"),
            }
            drop(guard);
        }
    }

    /// Runs one flush cycle now, waiting for a running one to end first.
    pub async fn flush_now(self: &Arc<Self>) -> SyncResult<super::FlushSummary> {
        let guard = self.flush_gate.lock().await;
        self.flush_requested.store(false, Ordering::SeqCst);
        self.check_flushable()?;
        let summary = self.run_cycle().await;
        drop(guard);
        if self.flush_requested.load(Ordering::SeqCst) {
            self.kick();
        }
        Ok(summary)
    }

    /// Returns true if a live operation submitted after `op` touches `key`.
    pub fn has_later_ops(&self, key: &EntityKey, op: &Operation) -> bool {
        self.store
            .for_entity(key)
            .iter()
            .any(|other| other.sequence > op.sequence && other.status != OperationStatus::Completed)
    }

    /// Clears the needs-sync mark of every entity `op` touched, unless a
    /// later operation still has to sync it.
    pub fn mark_synced(&self, op: &Operation) {
        let _local = self.local_writes.lock();
        for key in op.touched_entities() {
            if self.has_later_ops(&key, op) {
                continue;
            }
            if let Err(e) = self.local.mark_synced(&key.entity_type, &key.entity_id) {
                warn!(entity = %key, error = %e, "could not clear sync mark");
            }
        }
    }

    /// Waits for background flush tasks and scheduled recoveries.
    pub async fn settle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            for task in tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        warn!(error = %e, "flush task panicked");
                    }
                }
            }
            // Recovery may request another flush.
            self.isolator.settle().await;
            if self.tasks.lock().is_empty() {
                break;
            }
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        self.events.emit(event);
    }
}
