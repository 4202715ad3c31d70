//! The application-facing sync manager.

use super::engine::SyncEngine;
use super::recovery::EngineRecovery;
use super::stats::{Counters, FlushSummary, SyncStats, SyncStatus};
use crate::config::SyncConfig;
use crate::conflict::{merge_payloads, ConflictResolver};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent, Subscription};
use crate::isolation::{
    BackgroundService, ErrorFilter, ErrorIsolator, RecoveryExecutor, RecoveryReport,
};
use crate::local::LocalStore;
use crate::network::{LinkHints, NetworkChange, NetworkMonitor, NetworkSnapshot};
use crate::remote::RemoteBackend;
use crate::retry::{RetryConditions, RetryManager, RetryStats};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use syncwell_protocol::{
    Conflict, ConflictId, ConflictKind, ConflictResolution, EntityKey, EntityRecord, ErrorId,
    ErrorRecord, NewOperation, Operation, OperationId, OperationKind, OperationStatus, ParkReason,
    ResolutionChoice, RetryAttempt, Timestamp,
};
use syncwell_store::{OperationStore, PurgeReport, WriteOrigin};
use tracing::{debug, info, warn};

/// Result of a manual conflict decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictOutcome {
    /// The resolved conflict.
    pub conflict: Conflict,
    /// Operation queued to carry the decision to the remote, if any.
    pub follow_up: Option<Operation>,
    /// Parked operations completed by the decision.
    pub completed: Vec<OperationId>,
}

/// Offline-first sync manager.
///
/// Application writes go to the local store first and are queued as
/// operations; a single flush worker drains the queue against the remote
/// backend whenever the link is up. Every call here returns without
/// waiting on the network, except [`flush`](Self::flush) and
/// [`recover_error`](Self::recover_error).
///
/// Must be created inside a Tokio runtime for background flushing;
/// without one, flush requests wait for an explicit `flush`.
pub struct OfflineManager {
    core: Arc<SyncEngine>,
}

impl OfflineManager {
    /// Creates a manager over `store`, re-applying isolation left in it.
    pub fn new(
        config: SyncConfig,
        store: Arc<OperationStore>,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
    ) -> Self {
        let network = Arc::new(NetworkMonitor::new(config.network.clone()));
        let events = EventBus::new();

        let core = Arc::new_cyclic(|weak: &Weak<SyncEngine>| {
            let executor: Arc<dyn RecoveryExecutor> = Arc::new(EngineRecovery {
                core: weak.clone(),
            });
            let isolator = Arc::new(ErrorIsolator::new(
                config.isolation.clone(),
                Arc::clone(&store),
                events.clone(),
                executor,
            ));
            SyncEngine {
                retry: RetryManager::new(config.retry.clone(), Arc::clone(&network)),
                conditions: RwLock::new(RetryConditions::new()),
                resolver: ConflictResolver::new(config.conflict.clone()),
                isolator,
                events,
                counters: Mutex::new(Counters::default()),
                local_writes: Mutex::new(()),
                flush_gate: tokio::sync::Mutex::new(()),
                flush_requested: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                config,
                store,
                local,
                remote,
                network,
            }
        });

        let restored = core.isolator.restore();
        debug!(restored, pending = core.store.counts().pending, "sync manager ready");
        Self { core }
    }

    // ------------------------------------------------------------------
    // Queueing
    // ------------------------------------------------------------------

    /// Performs a mutation locally and queues it for sync.
    ///
    /// Create requests without an id get a random one. The base version is
    /// taken from the local copy unless the request sets one. A local-store
    /// failure is returned as-is and nothing is queued.
    pub fn execute(&self, request: NewOperation) -> SyncResult<Operation> {
        let op = self.queue(request)?;
        if self.core.config.auto_flush && self.core.network.is_connected() {
            self.core.kick();
        }
        Ok(op)
    }

    /// Executes several mutations, higher priorities first.
    ///
    /// Results are returned in input order. A failure affects only its own
    /// request.
    pub fn execute_batch(&self, requests: Vec<NewOperation>) -> Vec<SyncResult<Operation>> {
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by_key(|&i| requests[i].priority);

        let mut slots: Vec<Option<NewOperation>> = requests.into_iter().map(Some).collect();
        let mut results: Vec<Option<SyncResult<Operation>>> = slots.iter().map(|_| None).collect();
        for i in order {
            if let Some(request) = slots[i].take() {
                results[i] = Some(self.queue(request));
            }
        }

        let queued = results.iter().filter(|r| matches!(r, Some(Ok(_)))).count();
        if queued > 0 && self.core.config.auto_flush && self.core.network.is_connected() {
            self.core.kick();
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(SyncError::InvalidState("request skipped".into()))))
            .collect()
    }

    fn queue(&self, request: NewOperation) -> SyncResult<Operation> {
        let request = self.prepare(request)?;
        let core = &self.core;
        let now = Timestamp::now();

        let op = {
            let _local = core.local_writes.lock();
            let mut request = request;
            let write = write_local(core.local.as_ref(), &request, now)?;
            if request.base_version.is_none() {
                request.base_version = self.base_version(&request).or(write.base_version);
            }
            let op = Operation::from_request(request, core.config.default_max_retries, now);
            match core.store.insert(op) {
                Ok(op) => op,
                Err(e) => {
                    write.undo(core.local.as_ref());
                    return Err(e.into());
                }
            }
        };

        debug!(
            operation_id = %op.id,
            kind = op.kind.as_str(),
            entity = ?op.entity_key(),
            priority = op.priority.as_str(),
            "operation queued"
        );
        core.emit(SyncEvent::OperationQueued {
            operation_id: op.id,
            entity: op.entity_key(),
        });
        Ok(op)
    }

    fn prepare(&self, mut request: NewOperation) -> SyncResult<NewOperation> {
        validate(&request)?;
        if request.kind == OperationKind::Create && request.entity_id.is_none() {
            request.entity_id = Some(uuid::Uuid::new_v4().to_string());
        }
        for dependency in &request.dependencies {
            if !self.core.store.contains(dependency) {
                return Err(SyncError::DependencyNotFound(*dependency));
            }
            let unrecoverable = self
                .core
                .store
                .get(dependency)
                .is_some_and(|op| matches!(op.parked, Some(ParkReason::Unrecoverable(_))));
            if unrecoverable {
                return Err(SyncError::DependencyIsolated(*dependency));
            }
        }
        Ok(request)
    }

    /// Base version inherited from an operation still queued for the same
    /// entity. The flush rebases it once that operation lands.
    fn base_version(&self, request: &NewOperation) -> Option<Timestamp> {
        let id = request.entity_id.as_ref()?;
        let key = EntityKey::new(request.entity_type.clone(), id.clone());
        self.core
            .store
            .for_entity(&key)
            .into_iter()
            .filter(|op| op.status != OperationStatus::Completed)
            .last()
            .and_then(|op| op.base_version)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Returns what the application is told about sync.
    pub fn get_status(&self) -> SyncStatus {
        let core = &self.core;
        let counts = core.store.counts();
        let snapshot = core.network.snapshot();
        SyncStatus {
            online: snapshot.is_connected(),
            network: snapshot.status,
            tier: snapshot.tier,
            pending_count: counts.pending + counts.in_flight,
            failed_count: counts.failed,
            sync_in_progress: core.flush_gate.try_lock().is_err(),
            has_conflicts: core.store.conflicts().iter().any(Conflict::is_active),
            active_errors: core.store.errors().iter().filter(|r| r.is_active()).count(),
            paused: core.isolator.is_flush_paused(),
            available: core.isolator.is_available(),
        }
    }

    /// Returns conflicts waiting on a decision.
    pub fn get_conflicts(&self) -> Vec<Conflict> {
        self.core
            .store
            .conflicts()
            .into_iter()
            .filter(Conflict::is_active)
            .collect()
    }

    /// Returns a conflict, resolved or not.
    pub fn get_conflict(&self, id: &ConflictId) -> Option<Conflict> {
        self.core.store.conflict(id)
    }

    /// Returns error records matching `filter`.
    pub fn get_errors(&self, filter: &ErrorFilter) -> Vec<ErrorRecord> {
        filter.apply(self.core.store.errors())
    }

    /// Returns aggregate retry statistics.
    pub fn get_retry_stats(&self) -> RetryStats {
        self.core.retry.stats()
    }

    /// Returns the recorded retry attempts of an operation.
    pub fn retry_history(&self, id: &OperationId) -> Vec<RetryAttempt> {
        self.core.retry.history(id)
    }

    /// Returns a live operation.
    pub fn operation(&self, id: &OperationId) -> Option<Operation> {
        self.core.store.get(id)
    }

    /// Returns every live operation in submission order.
    pub fn operations(&self) -> Vec<Operation> {
        self.core.store.operations()
    }

    /// Returns entities under partial isolation.
    pub fn isolated_entities(&self) -> Vec<EntityKey> {
        self.core.isolator.isolated_entities()
    }

    /// Returns the latest network snapshot.
    pub fn network(&self) -> NetworkSnapshot {
        self.core.network.snapshot()
    }

    /// Returns the operation store.
    pub fn store(&self) -> &Arc<OperationStore> {
        &self.core.store
    }

    /// Returns aggregate statistics.
    pub fn stats(&self) -> SyncStats {
        let core = &self.core;
        let counters = core.counters.lock();
        SyncStats {
            operations: core.store.counts(),
            offline_duration_ms: u64::try_from(core.network.offline_duration().as_millis())
                .unwrap_or(u64::MAX),
            flushes: counters.flushes,
            operations_synced: counters.operations_synced,
            bytes_sent: counters.bytes_sent,
            bandwidth_saved: counters.bandwidth_saved,
            conflicts_detected: counters.conflicts_detected,
            conflicts_resolved: counters.conflicts_resolved,
            superseded: counters.superseded,
            last_flush: counters.last_flush.clone(),
            retry: core.retry.stats(),
        }
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> Subscription {
        self.core.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Network
    // ------------------------------------------------------------------

    /// Records a connectivity report with link hints.
    pub fn set_network(&self, connected: bool, hints: LinkHints) -> NetworkSnapshot {
        let change = self.core.network.report(connected, hints);
        self.on_network_change(change)
    }

    /// Records a connectivity flip.
    pub fn set_online(&self, connected: bool) -> NetworkSnapshot {
        let change = self.core.network.set_online(connected);
        self.on_network_change(change)
    }

    fn on_network_change(&self, change: NetworkChange) -> NetworkSnapshot {
        let core = &self.core;
        if change.is_change() {
            core.emit(SyncEvent::NetworkChanged(change.current.clone()));
        }
        if change.reconnected() {
            if core.config.reset_failed_on_reconnect {
                match self.reset_failed(&[]) {
                    Ok(0) => {}
                    Ok(reset) => info!(reset, "failed operations reset on reconnect"),
                    Err(e) => warn!(error = %e, "could not reset failed operations"),
                }
            }
            if core.config.auto_flush {
                core.kick();
            }
        }
        change.current
    }

    // ------------------------------------------------------------------
    // Flushing and operation control
    // ------------------------------------------------------------------

    /// Runs a flush cycle now and returns its summary.
    ///
    /// Waits for a running cycle to end first. Fails with
    /// [`SyncError::Offline`] while disconnected and with
    /// [`SyncError::Unavailable`] while isolation pauses flushing.
    pub async fn flush(&self) -> SyncResult<FlushSummary> {
        self.core.flush_now().await
    }

    /// Moves failed operations back to `pending` with a fresh retry budget.
    ///
    /// An empty slice resets every failed operation. Named operations must
    /// all exist and be failed, or nothing is reset.
    pub fn retry_failed(&self, ids: &[OperationId]) -> SyncResult<usize> {
        let reset = self.reset_failed(ids)?;
        if reset > 0 && self.core.network.is_connected() {
            self.core.kick();
        }
        Ok(reset)
    }

    fn reset_failed(&self, ids: &[OperationId]) -> SyncResult<usize> {
        let store = &self.core.store;
        let targets: Vec<OperationId> = if ids.is_empty() {
            store
                .with_status(OperationStatus::Failed)
                .into_iter()
                .map(|op| op.id)
                .collect()
        } else {
            for id in ids {
                let op = store.get(id).ok_or(SyncError::OperationNotFound(*id))?;
                if op.status != OperationStatus::Failed {
                    return Err(SyncError::InvalidState(format!("{id} is {}", op.status)));
                }
            }
            ids.to_vec()
        };

        let now = Timestamp::now();
        for id in &targets {
            store.transition(id, OperationStatus::Pending, WriteOrigin::Local, now, |o| {
                o.retry_count = 0;
            })?;
            self.core.retry.forget(id);
            self.lift_for(id);
            debug!(operation_id = %id, "failed operation reset");
        }
        Ok(targets.len())
    }

    /// Lifts containment applied for an operation's errors, so the
    /// scheduler dispatches it again.
    fn lift_for(&self, id: &OperationId) {
        let core = &self.core;
        for record in core.store.errors() {
            if record.related_operation == Some(*id) && record.is_active() {
                core.isolator.lift(&record.id);
            }
        }
    }

    /// Cancels an operation.
    ///
    /// An operation inside a retry sequence is parked when the sequence
    /// notices; a pending or failed one is parked now. Parked operations
    /// keep their payload and can be resumed.
    pub fn cancel_operation(&self, id: &OperationId) -> SyncResult<()> {
        let core = &self.core;
        let op = core.store.get(id).ok_or(SyncError::OperationNotFound(*id))?;
        if core.retry.cancel(id) {
            info!(operation_id = %id, "retry sequence cancelled");
            return Ok(());
        }
        match op.status {
            OperationStatus::Pending | OperationStatus::Failed => {
                core.store.transition(
                    id,
                    OperationStatus::Isolated,
                    WriteOrigin::Local,
                    Timestamp::now(),
                    |o| o.parked = Some(ParkReason::Cancelled),
                )?;
                info!(operation_id = %id, "operation cancelled");
                Ok(())
            }
            status => Err(SyncError::InvalidState(format!("{id} is {status}"))),
        }
    }

    /// Returns a cancelled or unrecoverable operation to the queue.
    ///
    /// Operations waiting on a conflict are resumed by
    /// [`resolve_conflict`](Self::resolve_conflict) instead.
    pub fn resume_operation(&self, id: &OperationId) -> SyncResult<Operation> {
        let core = &self.core;
        let op = core.store.get(id).ok_or(SyncError::OperationNotFound(*id))?;
        if op.status != OperationStatus::Isolated {
            return Err(SyncError::InvalidState(format!("{id} is {}", op.status)));
        }
        if let Some(ParkReason::ManualConflict(conflict)) = &op.parked {
            return Err(SyncError::InvalidState(format!(
                "{id} waits on {conflict}"
            )));
        }

        let op = core.store.transition(
            id,
            OperationStatus::Pending,
            WriteOrigin::Local,
            Timestamp::now(),
            |o| {
                o.retry_count = 0;
                o.last_error = None;
            },
        )?;
        self.lift_for(id);
        core.retry.forget(id);
        info!(operation_id = %id, "operation resumed");
        if core.network.is_connected() {
            core.kick();
        }
        Ok(op)
    }

    /// Cancels every retry sequence. Their operations return to `pending`.
    pub fn abort_all(&self) -> usize {
        let aborted = self.core.retry.abort_all();
        if aborted > 0 {
            info!(aborted, "retry sequences aborted");
        }
        aborted
    }

    /// Replaces the conditions every retry must satisfy.
    pub fn set_retry_conditions(&self, conditions: RetryConditions) {
        *self.core.conditions.write() = conditions;
    }

    /// Deletes failed and isolated operations older than the retention
    /// window, with their terminal conflicts and errors.
    pub fn purge_expired(&self) -> SyncResult<PurgeReport> {
        let cutoff = Timestamp::now().minus(self.core.config.failed_retention);
        let report = self.core.store.purge(cutoff)?;
        info!(
            operations = report.operations,
            conflicts = report.conflicts,
            errors = report.errors,
            "expired records purged"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Applies a manual decision to an active conflict.
    ///
    /// `Local` queues the current local copy on top of the remote version.
    /// `Remote` writes the remote snapshot locally. `Merge` writes the
    /// merged payload locally and queues it; delete conflicts cannot be
    /// merged. Operations parked on the conflict complete.
    pub fn resolve_conflict(
        &self,
        id: &ConflictId,
        choice: ResolutionChoice,
    ) -> SyncResult<ConflictOutcome> {
        let core = &self.core;
        let conflict = core
            .store
            .conflict(id)
            .ok_or(SyncError::ConflictNotFound(*id))?;
        if !conflict.is_active() {
            return Err(SyncError::InvalidState(format!(
                "{id} is already resolved as {}",
                conflict.resolution.as_str()
            )));
        }
        if choice == ResolutionChoice::Merge && conflict.kind == ConflictKind::DeleteConflict {
            return Err(SyncError::InvalidState(format!(
                "{id} is a delete conflict and cannot be merged"
            )));
        }

        let key = conflict.entity_key();
        let now = Timestamp::now();
        let owner = core
            .store
            .get(&conflict.operation_id)
            .map(|op| op.owner_id)
            .unwrap_or_default();

        let (resolution, follow_up) = {
            let _local = core.local_writes.lock();
            let current = core
                .local
                .get(&key.entity_type, &key.entity_id)?
                .filter(|record| !record.deleted);

            let (resolution, request) = match choice {
                ResolutionChoice::Local => {
                    let request = match current {
                        Some(record) if !conflict.local_snapshot.is_null() => {
                            NewOperation::update(&key.entity_type, &key.entity_id, record.data)
                        }
                        _ => NewOperation::delete(&key.entity_type, &key.entity_id),
                    };
                    (ConflictResolution::Local, Some(request))
                }
                ResolutionChoice::Remote => {
                    let mut record = EntityRecord::new(
                        &key.entity_id,
                        conflict.remote_snapshot.clone(),
                        conflict.remote_timestamp,
                    );
                    let remote_deleted = conflict.kind == ConflictKind::DeleteConflict
                        && !conflict.local_snapshot.is_null();
                    if remote_deleted {
                        record = record.tombstone(conflict.remote_timestamp);
                    }
                    core.local.put(&key.entity_type, record)?;
                    (ConflictResolution::Remote, None)
                }
                ResolutionChoice::Merge => {
                    let base = current
                        .map(|record| record.data)
                        .unwrap_or_else(|| conflict.local_snapshot.clone());
                    let merged = merge_payloads(&base, &conflict.remote_snapshot);
                    core.local.put(
                        &key.entity_type,
                        EntityRecord::new(&key.entity_id, merged.clone(), now),
                    )?;
                    let request = NewOperation::update(&key.entity_type, &key.entity_id, merged);
                    (ConflictResolution::Merge, Some(request))
                }
            };

            let follow_up = match request {
                Some(request) => {
                    let request = request
                        .with_owner(owner)
                        .with_base_version(conflict.remote_timestamp);
                    let op = Operation::from_request(request, core.config.default_max_retries, now);
                    Some(core.store.insert(op)?)
                }
                None => None,
            };
            (resolution, follow_up)
        };

        let conflict = core.store.update_conflict(id, |c| {
            c.resolve(resolution, now);
        })?;
        core.counters.lock().conflicts_resolved += 1;

        let marker = ParkReason::ManualConflict(id.to_string());
        let mut completed = Vec::new();
        for op in core.store.with_status(OperationStatus::Isolated) {
            if op.parked.as_ref() != Some(&marker) {
                continue;
            }
            let op = core.store.transition(
                &op.id,
                OperationStatus::Completed,
                WriteOrigin::Local,
                now,
                |o| o.last_error = None,
            )?;
            core.retry.forget(&op.id);
            core.isolator.resolve_for_operation(&op.id)?;
            core.mark_synced(&op);
            completed.push(op.id);
        }

        info!(
            conflict_id = %id,
            entity = %key,
            resolution = resolution.as_str(),
            completed = completed.len(),
            "conflict resolved"
        );
        if let Some(op) = &follow_up {
            core.emit(SyncEvent::OperationQueued {
                operation_id: op.id,
                entity: op.entity_key(),
            });
            if core.config.auto_flush && core.network.is_connected() {
                core.kick();
            }
        }
        Ok(ConflictOutcome {
            conflict,
            follow_up,
            completed,
        })
    }

    // ------------------------------------------------------------------
    // Errors and isolation
    // ------------------------------------------------------------------

    /// Runs the recovery strategy of an active error now.
    pub async fn recover_error(&self, id: &ErrorId) -> SyncResult<RecoveryReport> {
        self.core.isolator.recover(id).await
    }

    /// Removes the containment applied for an error.
    pub fn lift_isolation(&self, id: &ErrorId) -> bool {
        self.core.isolator.lift(id)
    }

    /// Registers a background service that full isolation pauses.
    pub fn register_service(&self, service: Arc<dyn BackgroundService>) {
        self.core.isolator.services().register(service);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Waits until background flushes and scheduled recoveries are done.
    pub async fn settle(&self) {
        self.core.settle().await;
    }

    /// Stops background work. Queued operations stay in the store.
    pub fn shutdown(&self) {
        let core = &self.core;
        core.retry.abort_all();
        core.isolator.shutdown();
        for task in core.tasks.lock().drain(..) {
            task.abort();
        }
        info!("sync manager shut down");
    }
}

impl std::fmt::Debug for OfflineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineManager")
            .field("store", &self.core.store)
            .field("network", &self.core.network.snapshot().status)
            .finish_non_exhaustive()
    }
}

fn validate(request: &NewOperation) -> SyncResult<()> {
    if request.entity_type.trim().is_empty() {
        return Err(SyncError::Validation("entity type is empty".into()));
    }
    match request.kind {
        OperationKind::Create | OperationKind::Update => {
            if request.kind == OperationKind::Update && request.entity_id.is_none() {
                return Err(SyncError::Validation("update needs an entity id".into()));
            }
            if !request.payload.is_object() {
                return Err(SyncError::Validation(format!(
                    "{} payload must be an object",
                    request.kind.as_str()
                )));
            }
        }
        OperationKind::Delete => {
            if request.entity_id.is_none() {
                return Err(SyncError::Validation("delete needs an entity id".into()));
            }
        }
        OperationKind::Batch => {
            let items = request
                .payload
                .as_array()
                .filter(|items| !items.is_empty())
                .ok_or_else(|| SyncError::Validation("batch needs at least one record".into()))?;
            if !items
                .iter()
                .all(|item| item.get("id").and_then(Value::as_str).is_some())
            {
                return Err(SyncError::Validation(
                    "every batch record needs a string id".into(),
                ));
            }
        }
    }
    Ok(())
}

/// A local write that can be undone if queueing fails.
struct LocalWrite {
    entity_type: String,
    previous: Vec<(String, Option<EntityRecord>)>,
    base_version: Option<Timestamp>,
}

impl LocalWrite {
    fn undo(self, local: &dyn LocalStore) {
        for (id, previous) in self.previous {
            let result = match previous {
                Some(record) => local.put(&self.entity_type, record),
                None => local.delete(&self.entity_type, &id),
            };
            if let Err(e) = result {
                warn!(entity_type = %self.entity_type, %id, error = %e, "could not undo local write");
            }
        }
    }
}

fn write_local(
    local: &dyn LocalStore,
    request: &NewOperation,
    now: Timestamp,
) -> SyncResult<LocalWrite> {
    let entity_type = request.entity_type.as_str();
    let mut write = LocalWrite {
        entity_type: entity_type.to_string(),
        previous: Vec::new(),
        base_version: None,
    };

    match request.kind {
        OperationKind::Batch => {
            let items = request.payload.as_array().map(Vec::as_slice).unwrap_or_default();
            for item in items {
                let Some(id) = item.get("id").and_then(Value::as_str) else {
                    continue;
                };
                let result = local.get(entity_type, id).and_then(|previous| {
                    local.put(entity_type, EntityRecord::new(id, item.clone(), now))?;
                    Ok(previous)
                });
                match result {
                    Ok(previous) => write.previous.push((id.to_string(), previous)),
                    Err(e) => {
                        write.undo(local);
                        return Err(e);
                    }
                }
            }
        }
        kind => {
            let id = request
                .entity_id
                .as_deref()
                .ok_or_else(|| SyncError::Validation("entity id missing".into()))?;
            let previous = local.get(entity_type, id)?;
            write.base_version = previous.as_ref().map(|record| record.updated_at);
            if kind == OperationKind::Delete {
                local.delete(entity_type, id)?;
            } else {
                local.put(entity_type, EntityRecord::new(id, request.payload.clone(), now))?;
            }
            write.previous.push((id.to_string(), previous));
        }
    }
    Ok(write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsolationConfig, RetryConfig};
    use crate::local::MemoryLocalStore;
    use crate::remote::MemoryRemote;
    use serde_json::json;
    use std::time::Duration;
    use syncwell_protocol::{ErrorKind, Priority};

    struct Harness {
        manager: OfflineManager,
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemote>,
    }

    fn config() -> SyncConfig {
        SyncConfig::new()
            .with_auto_flush(false)
            .with_retry(
                RetryConfig::new(3)
                    .with_base_delay(Duration::from_millis(100))
                    .with_jitter(0.0),
            )
            .with_isolation(IsolationConfig::default().with_auto_recover(false))
    }

    fn harness(config: SyncConfig) -> Harness {
        let store = Arc::new(OperationStore::in_memory().unwrap());
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let manager = OfflineManager::new(config, store, local.clone(), remote.clone());
        Harness {
            manager,
            local,
            remote,
        }
    }

    fn card(id: &str, title: &str) -> NewOperation {
        NewOperation::create_with_id("card", id, json!({ "title": title }))
    }

    /// Local and remote copies of `c1` edited concurrently.
    fn diverged(h: &Harness) {
        h.local
            .put(
                "card",
                EntityRecord::new("c1", json!({ "title": "mine" }), Timestamp::from_millis(1_000)),
            )
            .unwrap();
        h.remote.put_external(
            "card",
            EntityRecord::new("c1", json!({ "title": "theirs" }), Timestamp::from_millis(2_000)),
        );
    }

    #[tokio::test]
    async fn execute_while_offline_writes_locally_and_queues() {
        let h = harness(config());
        let mut events = h.manager.subscribe();

        let op = h.manager.execute(card("c1", "a")).unwrap();

        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(h.local.get("card", "c1").unwrap().unwrap().data["title"], "a");
        let status = h.manager.get_status();
        assert!(!status.online);
        assert_eq!(status.pending_count, 1);
        assert!(!status.sync_in_progress);
        assert_eq!(h.remote.calls().upserts, 0);
        assert!(matches!(
            events.try_recv(),
            Some(SyncEvent::OperationQueued { operation_id, .. }) if operation_id == op.id
        ));
    }

    #[tokio::test]
    async fn create_without_id_gets_one() {
        let h = harness(config());
        let op = h
            .manager
            .execute(NewOperation::create("card", json!({ "title": "x" })))
            .unwrap();
        let id = op.entity_id.unwrap();
        assert!(h.local.get("card", &id).unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let h = harness(config());
        let no_id = NewOperation {
            entity_id: None,
            ..NewOperation::update("card", "c1", json!({}))
        };
        assert!(matches!(h.manager.execute(no_id), Err(SyncError::Validation(_))));
        assert!(matches!(
            h.manager.execute(NewOperation::batch("card", vec![])),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            h.manager.execute(NewOperation::update("card", "c1", json!("text"))),
            Err(SyncError::Validation(_))
        ));

        let missing = OperationId::new();
        assert!(matches!(
            h.manager.execute(card("c1", "a").depends_on(missing)),
            Err(SyncError::DependencyNotFound(id)) if id == missing
        ));
        assert_eq!(h.manager.store().counts().live(), 0);
    }

    #[tokio::test]
    async fn local_failure_queues_nothing() {
        let h = harness(config());
        h.local.set_fail_writes(true);

        let err = h.manager.execute(card("c1", "a")).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Database);
        assert_eq!(h.manager.store().counts().live(), 0);
    }

    #[tokio::test]
    async fn flush_while_offline_is_refused() {
        let h = harness(config());
        h.manager.execute(card("c1", "a")).unwrap();
        assert!(matches!(h.manager.flush().await, Err(SyncError::Offline)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_flushes_the_queue() {
        let h = harness(config().with_auto_flush(true));
        h.manager.execute(card("c1", "a")).unwrap();
        h.manager.execute(card("c2", "b")).unwrap();
        let mut events = h.manager.subscribe();

        h.manager.set_online(true);
        h.manager.settle().await;

        assert_eq!(h.remote.get("card", "c1").unwrap().data["title"], "a");
        assert_eq!(h.remote.get("card", "c2").unwrap().data["title"], "b");
        assert!(h.local.query_pending("card").unwrap().is_empty());
        let stats = h.manager.stats();
        assert_eq!(stats.operations_synced, 2);
        assert_eq!(stats.operations.archived, 2);
        assert_eq!(stats.last_flush.unwrap().completed, 2);

        let names: Vec<&str> = events.drain().iter().map(SyncEvent::name).collect();
        assert_eq!(names.first(), Some(&"network-changed"));
        assert_eq!(names.last(), Some(&"sync-complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let h = harness(config());
        h.remote.fail_next(1, ErrorKind::Network);
        h.manager.execute(card("c1", "a")).unwrap();
        h.manager.set_online(true);

        let summary = h.manager.flush().await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(h.remote.get("card", "c1").unwrap().data["title"], "a");
        let stats = h.manager.get_retry_stats();
        assert_eq!(stats.overall.succeeded, 1);
        assert_eq!(stats.overall.delays, 1);
        let errors = h.manager.get_errors(&ErrorFilter::all());
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].is_active());
        assert!(h.manager.isolated_entities().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_follow_up_does_not_starve_its_older_dependency() {
        let h = harness(config());
        let first = h
            .manager
            .execute(card("c1", "a").with_priority(Priority::Low))
            .unwrap();
        let second = h
            .manager
            .execute(
                NewOperation::update("card", "c1", json!({ "title": "b" }))
                    .with_priority(Priority::Critical)
                    .depends_on(first.id),
            )
            .unwrap();
        h.manager.set_online(true);

        let summary = h.manager.flush().await.unwrap();

        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.completed, 2);
        assert!(h.manager.store().is_done(&first.id));
        assert!(h.manager.store().is_done(&second.id));
        assert_eq!(h.remote.get("card", "c1").unwrap().data["title"], "b");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_fails_until_reset() {
        let h = harness(config());
        h.remote.fail_next(1, ErrorKind::Validation);
        let op = h.manager.execute(card("c1", "a")).unwrap();
        h.manager.set_online(true);

        let summary = h.manager.flush().await.unwrap();
        assert_eq!(summary.failed, 1);
        let failed = h.manager.operation(&op.id).unwrap();
        assert_eq!(failed.status, OperationStatus::Failed);
        assert!(failed.last_error.is_some());
        assert_eq!(failed.payload, json!({ "title": "a" }));
        assert_eq!(h.manager.get_status().failed_count, 1);

        assert_eq!(h.manager.retry_failed(&[]).unwrap(), 1);
        let summary = h.manager.flush().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(h.remote.get("card", "c1").is_some());
    }

    #[tokio::test]
    async fn retry_failed_rejects_pending_operations() {
        let h = harness(config());
        let op = h.manager.execute(card("c1", "a")).unwrap();
        assert!(matches!(
            h.manager.retry_failed(&[op.id]),
            Err(SyncError::InvalidState(_))
        ));
        assert!(matches!(
            h.manager.retry_failed(&[OperationId::new()]),
            Err(SyncError::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_and_resume() {
        let h = harness(config());
        let op = h.manager.execute(card("c1", "a")).unwrap();

        h.manager.cancel_operation(&op.id).unwrap();
        let parked = h.manager.operation(&op.id).unwrap();
        assert_eq!(parked.status, OperationStatus::Isolated);
        assert_eq!(parked.parked, Some(ParkReason::Cancelled));

        let resumed = h.manager.resume_operation(&op.id).unwrap();
        assert_eq!(resumed.status, OperationStatus::Pending);
        assert_eq!(resumed.parked, None);
        assert!(h.manager.resume_operation(&op.id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_local_edit_is_superseded() {
        let h = harness(config());
        h.manager.execute(card("c1", "mine")).unwrap();
        let later = Timestamp::now().plus(Duration::from_secs(3600));
        h.remote.put_external(
            "card",
            EntityRecord::new("c1", json!({ "title": "theirs" }), later),
        );
        h.manager.set_online(true);

        let summary = h.manager.flush().await.unwrap();

        assert_eq!(summary.superseded, 1);
        assert_eq!(h.local.get("card", "c1").unwrap().unwrap().data["title"], "theirs");
        assert_eq!(h.remote.calls().upserts, 0);
        assert_eq!(h.manager.stats().superseded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_conflict_parks_until_resolved() {
        let h = harness(config());
        diverged(&h);
        let op = h
            .manager
            .execute(NewOperation::delete("card", "c1"))
            .unwrap();
        assert_eq!(op.base_version, Some(Timestamp::from_millis(1_000)));
        h.manager.set_online(true);

        let summary = h.manager.flush().await.unwrap();
        assert_eq!(summary.parked, 1);
        assert_eq!(summary.conflicts, 1);

        let conflicts = h.manager.get_conflicts();
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::DeleteConflict);
        assert_eq!(conflict.resolution, ConflictResolution::Manual);
        assert_eq!(
            h.manager.operation(&op.id).unwrap().parked,
            Some(ParkReason::ManualConflict(conflict.id.to_string()))
        );
        assert!(h.manager.get_status().has_conflicts);
        assert!(matches!(
            h.manager.resume_operation(&op.id),
            Err(SyncError::InvalidState(_))
        ));

        let outcome = h
            .manager
            .resolve_conflict(&conflict.id, ResolutionChoice::Remote)
            .unwrap();

        assert_eq!(outcome.conflict.resolution, ConflictResolution::Remote);
        assert_eq!(outcome.completed, vec![op.id]);
        assert!(outcome.follow_up.is_none());
        let record = h.local.get("card", "c1").unwrap().unwrap();
        assert!(!record.deleted);
        assert_eq!(record.data["title"], "theirs");
        assert!(h.manager.get_conflicts().is_empty());
        assert!(!h.remote.get("card", "c1").unwrap().deleted);
        assert!(h
            .manager
            .resolve_conflict(&conflict.id, ResolutionChoice::Local)
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn local_choice_queues_follow_up() {
        let h = harness(config());
        diverged(&h);
        h.manager.execute(NewOperation::delete("card", "c1")).unwrap();
        h.manager.set_online(true);
        h.manager.flush().await.unwrap();
        let conflict = h.manager.get_conflicts().remove(0);

        assert!(matches!(
            h.manager.resolve_conflict(&conflict.id, ResolutionChoice::Merge),
            Err(SyncError::InvalidState(_))
        ));
        let outcome = h
            .manager
            .resolve_conflict(&conflict.id, ResolutionChoice::Local)
            .unwrap();
        let follow_up = outcome.follow_up.unwrap();
        assert_eq!(follow_up.kind, OperationKind::Delete);
        assert_eq!(follow_up.base_version, Some(Timestamp::from_millis(2_000)));

        let summary = h.manager.flush().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert!(h.remote.get("card", "c1").unwrap().deleted);
        assert_eq!(h.manager.stats().conflicts_resolved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_returns_operations_to_the_queue() {
        let h = harness(config());
        h.remote.set_latency(Some(Duration::from_secs(1)));
        h.manager.execute(card("c1", "a")).unwrap();
        h.manager.execute(card("c2", "b")).unwrap();
        h.manager.set_online(true);
        let manager = Arc::new(h.manager);

        let flushing = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.set_online(false);
        let summary = flushing.await.unwrap().unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.requeued, 2);
        assert_eq!(manager.store().counts().pending, 2);
        assert!(manager.get_errors(&ErrorFilter::all()).is_empty());
        assert!(h.remote.records("card").is_empty());
    }

    #[tokio::test]
    async fn batch_requests_queue_by_priority() {
        let h = harness(config());
        let results = h.manager.execute_batch(vec![
            card("c1", "low").with_priority(Priority::Low),
            card("c2", "critical").with_priority(Priority::Critical),
            NewOperation::delete("", "c3"),
        ]);

        assert_eq!(results.len(), 3);
        let low = results[0].as_ref().unwrap();
        let critical = results[1].as_ref().unwrap();
        assert!(critical.sequence < low.sequence);
        assert!(matches!(results[2], Err(SyncError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_operation_uses_one_request() {
        let h = harness(config());
        h.manager
            .execute(NewOperation::batch(
                "card",
                vec![json!({ "id": "c1", "n": 1 }), json!({ "id": "c2", "n": 2 })],
            ))
            .unwrap();
        h.manager.set_online(true);

        h.manager.flush().await.unwrap();

        assert_eq!(h.remote.records("card").len(), 2);
        assert!(h.manager.stats().bandwidth_saved >= 512);
        assert!(h.local.query_pending("card").unwrap().is_empty());
    }
}
