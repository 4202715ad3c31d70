//! The flush cycle.
//!
//! A cycle repeatedly asks the scheduler for ready operations, dispatches
//! them as tasks up to the concurrency limit, and folds each task's
//! outcome into a [`FlushSummary`]. Every task owns one retry sequence:
//! fetch the remote copy, detect and resolve conflicts, apply, and on
//! failure capture the error and wait out the retry delay.

use super::engine::SyncEngine;
use super::scheduler::select_ready;
use super::stats::FlushSummary;
use crate::conflict::{detect, Detection};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::retry::{
    explicit_severity, FailureContext, RetryDecision, RetryInterrupt, RetrySequence, StopReason,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use syncwell_protocol::{
    Conflict, ConflictId, ConflictResolution, EntityKey, EntityRecord, ErrorRecord, Operation,
    OperationId, OperationKind, OperationStatus, ParkReason, Timestamp,
};
use syncwell_store::WriteOrigin;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// What happened on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Sent,
    /// Remote content already matched.
    Unchanged,
    /// A newer remote copy replaced the local edit.
    Superseded,
    Resolved(ConflictResolution),
    /// Waiting on the application.
    Manual(ConflictId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Superseded,
    Parked,
    Failed,
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outcome {
    settled: Settled,
    conflict: bool,
}

impl Outcome {
    fn plain(settled: Settled) -> Self {
        Self {
            settled,
            conflict: false,
        }
    }
}

impl FlushSummary {
    fn record(&mut self, outcome: Outcome) {
        if outcome.conflict {
            self.conflicts += 1;
        }
        match outcome.settled {
            Settled::Completed => self.completed += 1,
            Settled::Superseded => self.superseded += 1,
            Settled::Parked => self.parked += 1,
            Settled::Failed => self.failed += 1,
            Settled::Requeued => {
                self.requeued += 1;
                self.interrupted = true;
            }
        }
    }
}

impl SyncEngine {
    /// Runs one flush cycle. The caller holds the flush gate.
    pub(crate) async fn run_cycle(self: &Arc<Self>) -> FlushSummary {
        let started = Instant::now();
        let limit = self.config.max_concurrency.max(1);
        let mut summary = FlushSummary::default();
        let mut running: HashMap<OperationId, Vec<EntityKey>> = HashMap::new();
        let mut tasks: JoinSet<(OperationId, Outcome)> = JoinSet::new();
        let mut dispatching = true;
        info!(pending = self.store.counts().pending, "flush started");

        loop {
            if dispatching && !self.can_dispatch() {
                dispatching = false;
                summary.interrupted = true;
            }
            if dispatching && running.len() < limit {
                let slots = (limit - running.len()).min(self.config.flush_batch_size);
                let busy: BTreeSet<EntityKey> = running.values().flatten().cloned().collect();
                let pending = self.store.pending();
                let (ready, held) = select_ready(
                    &pending,
                    &busy,
                    slots,
                    |id| self.store.is_done(id),
                    |key| self.isolator.is_entity_isolated(key),
                );
                for (id, hold) in &held {
                    trace!(operation_id = %id, ?hold, "operation held back");
                }
                let dispatched = self.dispatch(ready, &mut running, &mut tasks);
                if dispatched > 0 {
                    summary.dispatched += dispatched;
                    self.emit(SyncEvent::SyncProgress {
                        completed: summary.finished(),
                        total: summary.dispatched,
                    });
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((id, outcome)) => {
                    running.remove(&id);
                    summary.record(outcome);
                    if outcome.settled == Settled::Requeued {
                        dispatching = false;
                    }
                    self.emit(SyncEvent::SyncProgress {
                        completed: summary.finished(),
                        total: summary.dispatched,
                    });
                }
                Err(e) => {
                    error!(error = %e, "flush task failed");
                    dispatching = false;
                }
            }
        }

        // Entries left here belong to tasks that died.
        for id in running.keys() {
            match self.store.transition(
                id,
                OperationStatus::Pending,
                WriteOrigin::Sync,
                Timestamp::now(),
                |_| {},
            ) {
                Ok(_) => summary.requeued += 1,
                Err(e) => error!(operation_id = %id, error = %e, "could not requeue operation"),
            }
        }
        if self.config.archive_completed {
            if let Err(e) = self.store.archive_completed() {
                warn!(error = %e, "could not archive completed operations");
            }
        }

        summary.duration_ms = millis(started.elapsed());
        {
            let mut counters = self.counters.lock();
            counters.flushes += 1;
            counters.last_flush = Some(summary.clone());
        }
        info!(
            dispatched = summary.dispatched,
            completed = summary.completed,
            failed = summary.failed,
            conflicts = summary.conflicts,
            interrupted = summary.interrupted,
            duration_ms = summary.duration_ms,
            "flush finished"
        );
        self.emit(SyncEvent::SyncComplete(summary.clone()));
        summary
    }

    fn dispatch(
        self: &Arc<Self>,
        ready: Vec<Operation>,
        running: &mut HashMap<OperationId, Vec<EntityKey>>,
        tasks: &mut JoinSet<(OperationId, Outcome)>,
    ) -> usize {
        let mut count = 0;
        for op in ready {
            let op = match self.store.transition(
                &op.id,
                OperationStatus::InFlight,
                WriteOrigin::Sync,
                Timestamp::now(),
                |_| {},
            ) {
                Ok(op) => op,
                Err(e) => {
                    warn!(operation_id = %op.id, error = %e, "could not dispatch operation");
                    continue;
                }
            };
            debug!(
                operation_id = %op.id,
                kind = op.kind.as_str(),
                entity = ?op.entity_key(),
                "operation dispatched"
            );
            running.insert(op.id, op.touched_entities());
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let id = op.id;
                (id, this.process(op).await)
            });
            count += 1;
        }
        count
    }

    /// Drives one operation to a settled state.
    async fn process(self: Arc<Self>, op: Operation) -> Outcome {
        let mut op = op;
        let budget = op.max_retries.saturating_sub(op.retry_count);
        let mut sequence = self.retry.begin(Some(op.id));

        loop {
            let result = tokio::select! {
                result = tokio::time::timeout(self.config.remote_timeout, self.apply(&op)) => {
                    result.unwrap_or_else(|_| Err(SyncError::Timeout(self.config.remote_timeout)))
                }
                _ = sequence.cancelled() => Err(SyncError::Cancelled),
                _ = self.network.wait_disconnected() => Err(SyncError::Offline),
            };
            let error = match result {
                Ok(applied) => return self.complete(op, sequence, applied),
                Err(error) => error,
            };
            if let Some(interrupt) = sequence.interruption() {
                return self.interrupted(op, sequence, interrupt);
            }
            if matches!(error, SyncError::Offline) || !self.network.is_connected() {
                return self.interrupted(op, sequence, RetryInterrupt::Offline);
            }

            let record = self.capture(&error, &op);
            let mut context = FailureContext::from_error(&error);
            if let Some(severity) = record
                .as_ref()
                .and_then(|r| explicit_severity(r.kind, r.severity))
            {
                context = context.with_severity(severity);
            }
            let conditions = self.conditions.read().clone();

            match self.retry.decide(&mut sequence, &context, budget, &conditions) {
                RetryDecision::Retry(delay) => {
                    let message = error.to_string();
                    match self.store.update(&op.id, WriteOrigin::Sync, |o| {
                        o.retry_count += 1;
                        o.last_error = Some(message);
                    }) {
                        Ok(updated) => op = updated,
                        Err(e) => {
                            error!(operation_id = %op.id, error = %e, "could not record retry");
                            return self.interrupted(op, sequence, RetryInterrupt::Aborted);
                        }
                    }
                    if let Err(interrupt) = self.retry.wait(&sequence, delay).await {
                        return self.interrupted(op, sequence, interrupt);
                    }
                }
                RetryDecision::GiveUp(StopReason::Interrupted(interrupt)) => {
                    return self.interrupted(op, sequence, interrupt);
                }
                RetryDecision::GiveUp(reason) => return self.fail(op, sequence, &error, reason),
            }
        }
    }

    fn capture(&self, error: &SyncError, op: &Operation) -> Option<ErrorRecord> {
        let context = BTreeMap::from([
            ("attempt".to_string(), (op.retry_count + 1).to_string()),
            ("operation_kind".to_string(), op.kind.as_str().to_string()),
        ]);
        match self.isolator.capture(error, Some(op), context) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(operation_id = %op.id, error = %e, "could not capture error");
                None
            }
        }
    }

    fn complete(&self, op: Operation, sequence: RetrySequence, applied: Applied) -> Outcome {
        let now = Timestamp::now();
        self.retry.succeed(sequence);

        if let Applied::Manual(conflict_id) = applied {
            let parked = ParkReason::ManualConflict(conflict_id.to_string());
            match self.store.transition(
                &op.id,
                OperationStatus::Isolated,
                WriteOrigin::Sync,
                now,
                |o| o.parked = Some(parked),
            ) {
                Ok(_) => info!(operation_id = %op.id, %conflict_id, "operation parked on conflict"),
                Err(e) => error!(operation_id = %op.id, error = %e, "could not park operation"),
            }
            return Outcome {
                settled: Settled::Parked,
                conflict: true,
            };
        }

        if let Err(e) = self.store.transition(
            &op.id,
            OperationStatus::Completed,
            WriteOrigin::Sync,
            now,
            |o| o.last_error = None,
        ) {
            error!(operation_id = %op.id, error = %e, "could not complete operation");
            return Outcome::plain(Settled::Requeued);
        }
        self.retry.forget(&op.id);
        if let Err(e) = self.isolator.resolve_for_operation(&op.id) {
            warn!(operation_id = %op.id, error = %e, "could not close errors");
        }
        self.mark_synced(&op);
        if matches!(
            applied,
            Applied::Sent | Applied::Resolved(ConflictResolution::Local)
        ) {
            self.counters.lock().operations_synced += 1;
        }
        debug!(operation_id = %op.id, ?applied, "operation completed");

        Outcome {
            settled: if applied == Applied::Superseded {
                Settled::Superseded
            } else {
                Settled::Completed
            },
            conflict: matches!(applied, Applied::Resolved(_)),
        }
    }

    fn interrupted(
        &self,
        op: Operation,
        sequence: RetrySequence,
        interrupt: RetryInterrupt,
    ) -> Outcome {
        self.retry.finish(sequence, false);
        let now = Timestamp::now();
        match interrupt {
            RetryInterrupt::Cancelled => {
                match self.store.transition(
                    &op.id,
                    OperationStatus::Isolated,
                    WriteOrigin::Sync,
                    now,
                    |o| o.parked = Some(ParkReason::Cancelled),
                ) {
                    Ok(_) => info!(operation_id = %op.id, "operation cancelled"),
                    Err(e) => error!(operation_id = %op.id, error = %e, "could not park operation"),
                }
                Outcome::plain(Settled::Parked)
            }
            RetryInterrupt::Aborted | RetryInterrupt::Offline => {
                match self.store.transition(
                    &op.id,
                    OperationStatus::Pending,
                    WriteOrigin::Sync,
                    now,
                    |_| {},
                ) {
                    Ok(_) => debug!(operation_id = %op.id, ?interrupt, "operation returned to queue"),
                    Err(e) => error!(operation_id = %op.id, error = %e, "could not requeue operation"),
                }
                Outcome::plain(Settled::Requeued)
            }
        }
    }

    fn fail(
        &self,
        op: Operation,
        sequence: RetrySequence,
        error: &SyncError,
        reason: StopReason,
    ) -> Outcome {
        let attempts = sequence.attempts();
        self.retry.finish(sequence, false);
        let message = error.to_string();
        match self.store.transition(
            &op.id,
            OperationStatus::Failed,
            WriteOrigin::Sync,
            Timestamp::now(),
            |o| o.last_error = Some(message.clone()),
        ) {
            Ok(_) => warn!(
                operation_id = %op.id,
                attempts,
                ?reason,
                error = %message,
                "operation failed"
            ),
            Err(e) => error!(operation_id = %op.id, error = %e, "could not mark operation failed"),
        }
        Outcome::plain(Settled::Failed)
    }

    /// One attempt: compare with the remote copy and apply.
    async fn apply(&self, op: &Operation) -> SyncResult<Applied> {
        if op.kind == OperationKind::Batch {
            return self.push_batch(op).await;
        }
        let id = op
            .entity_id
            .as_deref()
            .ok_or_else(|| SyncError::Validation(format!("{} has no entity id", op.id)))?;
        let theirs = self.remote.fetch(&op.entity_type, id).await?;

        match detect(op, theirs.as_ref(), Timestamp::now()) {
            Detection::Clean => {
                self.push(op, id).await?;
                Ok(Applied::Sent)
            }
            Detection::Identical => {
                debug!(operation_id = %op.id, "remote already matches");
                self.counters.lock().saved(
                    1,
                    op.payload_size(),
                    self.config.request_overhead_bytes,
                );
                Ok(Applied::Unchanged)
            }
            Detection::Stale { remote } => {
                debug!(operation_id = %op.id, remote_updated_at = %remote.updated_at, "local edit superseded");
                self.adopt(op, &remote)?;
                self.counters.lock().superseded += 1;
                Ok(Applied::Superseded)
            }
            Detection::Conflict(conflict) => match theirs {
                Some(remote) => self.reconcile(op, id, conflict, remote).await,
                None => Err(SyncError::InvalidState(format!(
                    "conflict on {} without a remote copy",
                    conflict.entity_key()
                ))),
            },
        }
    }

    async fn reconcile(
        &self,
        op: &Operation,
        id: &str,
        mut conflict: Conflict,
        remote: EntityRecord,
    ) -> SyncResult<Applied> {
        let verdict = self.resolver.resolve(&conflict);
        conflict.similarity = verdict.similarity;
        info!(
            operation_id = %op.id,
            entity = %conflict.entity_key(),
            kind = conflict.kind.as_str(),
            resolution = verdict.resolution.as_str(),
            similarity = ?verdict.similarity,
            "conflict detected"
        );

        match verdict.resolution {
            ConflictResolution::Local => self.push(op, id).await?,
            ConflictResolution::Remote => self.adopt(op, &remote)?,
            _ => return self.defer(conflict),
        }
        conflict.resolve(verdict.resolution, Timestamp::now());
        self.record_conflict(conflict)?;
        Ok(Applied::Resolved(verdict.resolution))
    }

    fn defer(&self, mut conflict: Conflict) -> SyncResult<Applied> {
        let key = conflict.entity_key();
        if let Some(existing) = self.store.active_conflict(&key) {
            debug!(entity = %key, conflict_id = %existing.id, "entity already waits on a decision");
            return Ok(Applied::Manual(existing.id));
        }
        conflict.resolve(ConflictResolution::Manual, Timestamp::now());
        let conflict = self.record_conflict(conflict)?;
        warn!(entity = %key, conflict_id = %conflict.id, "conflict needs a manual decision");
        Ok(Applied::Manual(conflict.id))
    }

    pub(crate) fn record_conflict(&self, conflict: Conflict) -> SyncResult<Conflict> {
        let conflict = self.store.insert_conflict(conflict)?;
        {
            let mut counters = self.counters.lock();
            counters.conflicts_detected += 1;
            if !conflict.is_active() {
                counters.conflicts_resolved += 1;
            }
        }
        self.emit(SyncEvent::ConflictDetected {
            conflict_id: conflict.id,
            entity: conflict.entity_key(),
            kind: conflict.kind,
        });
        Ok(conflict)
    }

    async fn push(&self, op: &Operation, id: &str) -> SyncResult<()> {
        let overhead = self.config.request_overhead_bytes;
        if op.kind == OperationKind::Delete {
            self.remote.soft_delete(&op.entity_type, id).await?;
            self.counters.lock().sent(0, overhead);
            return Ok(());
        }
        let record = EntityRecord::new(id, op.payload.clone(), op.created_at);
        let ack = self.remote.upsert(&op.entity_type, record).await?;
        self.counters.lock().sent(op.payload_size(), overhead);
        self.track_version(op, &EntityKey::new(op.entity_type.clone(), ack.id), ack.updated_at);
        Ok(())
    }

    async fn push_batch(&self, op: &Operation) -> SyncResult<Applied> {
        let items = op
            .payload
            .as_array()
            .ok_or_else(|| SyncError::Validation(format!("{} payload is not an array", op.id)))?;
        let records = items
            .iter()
            .map(|item| {
                item.get("id")
                    .and_then(Value::as_str)
                    .map(|id| EntityRecord::new(id, item.clone(), op.created_at))
                    .ok_or_else(|| {
                        SyncError::Validation(format!("{} has an element without an id", op.id))
                    })
            })
            .collect::<SyncResult<Vec<_>>>()?;
        let count = records.len();

        let acks = self.remote.upsert_batch(&op.entity_type, records).await?;
        {
            let overhead = self.config.request_overhead_bytes;
            let mut counters = self.counters.lock();
            counters.sent(op.payload_size(), overhead);
            counters.saved(count.saturating_sub(1), 0, overhead);
        }
        for ack in acks {
            self.track_version(op, &EntityKey::new(op.entity_type.clone(), ack.id), ack.updated_at);
        }
        Ok(Applied::Sent)
    }

    /// Records the version the remote assigned to our write.
    ///
    /// Operations queued after `op` for the same entity were based on our
    /// write, so they are rebased on it. Otherwise the local copy is
    /// stamped, and the next edit is based on it.
    fn track_version(&self, op: &Operation, key: &EntityKey, at: Timestamp) {
        let _local = self.local_writes.lock();
        let later: Vec<OperationId> = self
            .store
            .for_entity(key)
            .into_iter()
            .filter(|other| {
                other.sequence > op.sequence && other.status != OperationStatus::Completed
            })
            .map(|other| other.id)
            .collect();
        if !later.is_empty() {
            for id in later {
                if let Err(e) = self.store.update(&id, WriteOrigin::Sync, |o| {
                    o.base_version = Some(at);
                }) {
                    warn!(operation_id = %id, error = %e, "could not rebase operation");
                }
            }
            return;
        }
        let result = self
            .local
            .get(&key.entity_type, &key.entity_id)
            .and_then(|current| match current {
                Some(mut record) if !record.deleted => {
                    record.updated_at = at;
                    self.local.put(&key.entity_type, record)
                }
                _ => Ok(()),
            });
        if let Err(e) = result {
            warn!(entity = %key, error = %e, "could not record remote version");
        }
    }

    /// Writes the remote copy locally unless newer local edits are queued.
    fn adopt(&self, op: &Operation, remote: &EntityRecord) -> SyncResult<()> {
        let key = EntityKey::new(op.entity_type.clone(), remote.id.clone());
        let _local = self.local_writes.lock();
        if self.has_later_ops(&key, op) {
            debug!(entity = %key, "newer local edits queued, remote copy not adopted");
            return Ok(());
        }
        self.local.put(&op.entity_type, remote.clone())
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_records_outcomes() {
        let mut summary = FlushSummary {
            dispatched: 3,
            ..FlushSummary::default()
        };
        summary.record(Outcome {
            settled: Settled::Completed,
            conflict: true,
        });
        summary.record(Outcome::plain(Settled::Failed));
        assert!(!summary.interrupted);
        summary.record(Outcome::plain(Settled::Requeued));

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.requeued, 1);
        assert!(summary.interrupted);
        assert_eq!(summary.finished(), 3);
    }
}
