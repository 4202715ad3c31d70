//! Error capture, containment, and recovery scheduling.

use super::recovery::{run_strategy, RecoveryExecutor, RecoveryReport, RecoveryStrategy};
use super::services::ServiceRegistry;
use crate::config::IsolationConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use syncwell_protocol::{
    EntityKey, ErrorId, ErrorKind, ErrorRecord, ErrorStatus, IsolationLevel, Operation,
    OperationId, OperationStatus, ParkReason, Severity, Timestamp,
};
use syncwell_store::{OperationStore, StoreError, WriteOrigin};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct Containment {
    entities: BTreeMap<EntityKey, BTreeSet<ErrorId>>,
    full: BTreeSet<ErrorId>,
    strict: BTreeSet<ErrorId>,
}

impl Containment {
    fn remove(&mut self, id: &ErrorId) -> bool {
        let mut removed = self.full.remove(id);
        removed |= self.strict.remove(id);
        self.entities.retain(|_, errors| {
            removed |= errors.remove(id);
            !errors.is_empty()
        });
        removed
    }
}

/// Captures failures raised during sync, contains them, and drives
/// recovery.
///
/// Handling depends on severity:
///
/// | severity | handling |
/// |----------|----------|
/// | critical | isolate, recover immediately |
/// | high     | isolate, recover after `high_recovery_delay` |
/// | medium   | logged; isolate and recover after `medium_recovery_delay` |
/// | low      | logged and marked ignored |
///
/// Containment is bookkeeping the scheduler and the manager consult:
/// partial isolation blocks the affected entities, full isolation pauses
/// the flush worker and registered services, strict isolation also marks
/// sync unavailable.
pub struct ErrorIsolator {
    config: IsolationConfig,
    store: Arc<OperationStore>,
    events: EventBus,
    services: ServiceRegistry,
    executor: Arc<dyn RecoveryExecutor>,
    containment: Mutex<Containment>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ErrorIsolator {
    /// Creates an isolator.
    pub fn new(
        config: IsolationConfig,
        store: Arc<OperationStore>,
        events: EventBus,
        executor: Arc<dyn RecoveryExecutor>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            services: ServiceRegistry::new(),
            executor,
            containment: Mutex::new(Containment::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Returns the registered background services.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Captures a failure.
    ///
    /// If the operation already has an active record of the same kind, that
    /// record's retry count is refreshed instead of creating a new one.
    pub fn capture(
        self: &Arc<Self>,
        failure: &SyncError,
        operation: Option<&Operation>,
        context: BTreeMap<String, String>,
    ) -> SyncResult<ErrorRecord> {
        let now = Timestamp::now();
        let kind = failure.kind();

        if let Some(op) = operation {
            if let Some(existing) = self.store.active_error_for(&op.id) {
                if existing.kind == kind {
                    let record = self.store.update_error(&existing.id, |r| {
                        r.retry_count = op.retry_count;
                        r.message = failure.to_string();
                        r.updated_at = now;
                    })?;
                    debug!(error_id = %record.id, operation_id = %op.id, "error repeated");
                    return Ok(record);
                }
            }
        }

        let mut record = ErrorRecord::new(kind, failure.to_string(), now);
        record.retryable = failure.is_retryable();
        record.context = context;
        if let Some(op) = operation {
            record.related_operation = Some(op.id);
            record.retry_count = op.retry_count;
            record.max_retries = op.max_retries;
            record.affected_entities = op
                .touched_entities()
                .iter()
                .map(ToString::to_string)
                .collect();
        }
        if kind == ErrorKind::Integrity {
            record.escalate(Severity::Critical);
        }
        record.recovery_strategy = Some(RecoveryStrategy::for_kind(kind).name);

        let record = self.store.insert_error(record)?;
        match record.severity {
            Severity::Critical => error!(
                error_id = %record.id,
                kind = kind.as_str(),
                severity = record.severity.as_str(),
                message = %record.message,
                "critical sync error"
            ),
            Severity::High | Severity::Medium => warn!(
                error_id = %record.id,
                kind = kind.as_str(),
                severity = record.severity.as_str(),
                message = %record.message,
                "sync error"
            ),
            Severity::Low => info!(
                error_id = %record.id,
                kind = kind.as_str(),
                message = %record.message,
                "sync error ignored"
            ),
        }
        self.events.emit(SyncEvent::ErrorDetected {
            error_id: record.id,
            kind,
            severity: record.severity,
        });

        let record = self.store.update_error(&record.id, |r| {
            r.transition(ErrorStatus::Analyzing, now);
        })?;
        if record.severity == Severity::Low {
            return Ok(self.store.update_error(&record.id, |r| {
                r.transition(ErrorStatus::Ignored, now);
            })?);
        }

        if record.severity == Severity::Medium {
            if self.config.auto_recover {
                self.schedule_recovery(record.id, self.config.medium_recovery_delay, true);
            }
            return Ok(record);
        }

        let level = self.level_for(&record);
        let record = if level == IsolationLevel::None {
            record
        } else {
            self.isolate(&record, level)?
        };

        if self.config.auto_recover {
            let delay = match record.severity {
                Severity::Critical => Duration::ZERO,
                _ => self.config.high_recovery_delay,
            };
            self.schedule_recovery(record.id, delay, false);
        }
        Ok(record)
    }

    fn level_for(&self, record: &ErrorRecord) -> IsolationLevel {
        if record.kind == ErrorKind::Integrity {
            self.config.level.max(IsolationLevel::Full)
        } else {
            self.config.level
        }
    }

    fn contain(&self, record: &ErrorRecord, level: IsolationLevel) {
        let mut containment = self.containment.lock();
        match level {
            IsolationLevel::None => {}
            IsolationLevel::Partial => {
                for key in record.affected_entities.iter().filter_map(|e| EntityKey::parse(e)) {
                    containment.entities.entry(key).or_default().insert(record.id);
                }
            }
            IsolationLevel::Full => {
                containment.full.insert(record.id);
            }
            IsolationLevel::Strict => {
                containment.full.insert(record.id);
                containment.strict.insert(record.id);
            }
        }
        drop(containment);
        if level >= IsolationLevel::Full {
            self.services.pause_all(&record.message);
        }
    }

    fn isolate(&self, record: &ErrorRecord, level: IsolationLevel) -> SyncResult<ErrorRecord> {
        self.contain(record, level);
        let now = Timestamp::now();
        let record = self.store.update_error(&record.id, |r| {
            r.transition(ErrorStatus::Isolated, now);
            r.isolation = Some(level);
        })?;
        warn!(
            error_id = %record.id,
            level = level.as_str(),
            entities = record.affected_entities.len(),
            "error isolated"
        );
        self.events.emit(SyncEvent::ErrorIsolated {
            error_id: record.id,
            level,
        });
        Ok(record)
    }

    /// Re-applies containment for records that were isolated when the store
    /// was last closed, and schedules their recovery. Medium errors still
    /// waiting out their delay get a fresh one.
    pub fn restore(self: &Arc<Self>) -> usize {
        let mut isolated = 0;
        for record in self.store.errors() {
            match record.status {
                ErrorStatus::Isolated => {
                    if let Some(level) = record.isolation {
                        self.contain(&record, level);
                    }
                    if self.config.auto_recover {
                        self.schedule_recovery(record.id, Duration::ZERO, false);
                    }
                    isolated += 1;
                }
                ErrorStatus::Analyzing if self.config.auto_recover => {
                    self.schedule_recovery(record.id, self.config.medium_recovery_delay, true);
                }
                _ => {}
            }
        }
        if isolated > 0 {
            info!(errors = isolated, "restored isolation state");
        }
        isolated
    }

    /// Isolates a medium error whose delay ran out while it was still
    /// unresolved.
    fn isolate_late(&self, id: &ErrorId) -> SyncResult<()> {
        let Some(record) = self.store.error(id) else {
            return Ok(());
        };
        if record.status != ErrorStatus::Analyzing {
            return Ok(());
        }
        let level = self.level_for(&record);
        if level != IsolationLevel::None {
            self.isolate(&record, level)?;
        }
        Ok(())
    }

    fn schedule_recovery(self: &Arc<Self>, id: ErrorId, delay: Duration, isolate_first: bool) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(error_id = %id, "no runtime, recovery not scheduled");
            return;
        };
        let this = Arc::clone(self);
        let task = runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !this.store.error(&id).is_some_and(|r| r.is_active()) {
                return;
            }
            if isolate_first {
                if let Err(e) = this.isolate_late(&id) {
                    warn!(error_id = %id, error = %e, "could not isolate error");
                }
            }
            if let Err(e) = this.recover(&id).await {
                warn!(error_id = %id, error = %e, "recovery could not run");
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Runs the recovery strategy of an active error now.
    pub async fn recover(&self, id: &ErrorId) -> SyncResult<RecoveryReport> {
        let record = self
            .store
            .error(id)
            .ok_or_else(|| SyncError::InvalidState(format!("{id} not found")))?;
        if !record.is_active() {
            return Err(SyncError::InvalidState(format!(
                "{id} is already {}",
                record.status
            )));
        }
        if record.status == ErrorStatus::Recovering {
            return Err(SyncError::InvalidState(format!("{id} is already recovering")));
        }

        let strategy = RecoveryStrategy::for_kind(record.kind);
        let record = self.store.update_error(id, |r| {
            r.transition(ErrorStatus::Recovering, Timestamp::now());
        })?;
        info!(error_id = %id, strategy = %strategy.name, "recovery started");
        self.events.emit(SyncEvent::RecoveryStarted {
            error_id: *id,
            strategy: strategy.name.clone(),
        });

        let report = run_strategy(&strategy, self.executor.as_ref(), &record).await;
        let now = Timestamp::now();

        if report.succeeded() {
            let updated = self.finish_error(id, |r| {
                r.transition(ErrorStatus::Recovered, now);
            })?;
            if updated.is_some() {
                self.lift(id);
                info!(error_id = %id, strategy = %strategy.name, "recovery completed");
                self.events.emit(SyncEvent::RecoveryCompleted { error_id: *id });
            }
            return Ok(report);
        }

        let reason = report
            .failure_reason()
            .unwrap_or_else(|| "recovery failed".to_string());
        let updated = self.finish_error(id, |r| {
            r.transition(ErrorStatus::Failed, now);
            r.context.insert("recovery_failure".into(), reason.clone());
        })?;
        if updated.is_none() {
            return Ok(report);
        }
        error!(error_id = %id, strategy = %strategy.name, reason = %reason, "recovery failed");

        if record.retryable {
            self.lift(id);
        } else if let Some(op_id) = record.related_operation {
            self.park_unrecoverable(&op_id, &reason)?;
        }
        self.events.emit(SyncEvent::RecoveryFailed {
            error_id: *id,
            reason,
        });
        Ok(report)
    }

    fn finish_error(
        &self,
        id: &ErrorId,
        edit: impl FnOnce(&mut ErrorRecord),
    ) -> SyncResult<Option<ErrorRecord>> {
        match self.store.update_error(id, edit) {
            Ok(record) => Ok(Some(record)),
            // Resolved concurrently, e.g. the operation completed.
            Err(StoreError::Immutable { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn park_unrecoverable(&self, op_id: &OperationId, reason: &str) -> SyncResult<()> {
        let Some(op) = self.store.get(op_id) else {
            return Ok(());
        };
        if !matches!(op.status, OperationStatus::Failed | OperationStatus::Pending) {
            return Ok(());
        }
        self.store.transition(
            op_id,
            OperationStatus::Isolated,
            WriteOrigin::Sync,
            Timestamp::now(),
            |op| op.parked = Some(ParkReason::Unrecoverable(reason.to_string())),
        )?;
        warn!(operation_id = %op_id, reason, "operation parked as unrecoverable");
        Ok(())
    }

    /// Marks every active error of a completed operation as recovered and
    /// lifts its containment. Returns how many records were closed.
    pub fn resolve_for_operation(&self, op_id: &OperationId) -> SyncResult<usize> {
        let open: Vec<ErrorId> = self
            .store
            .errors()
            .into_iter()
            .filter(|r| r.is_active() && r.related_operation.as_ref() == Some(op_id))
            .map(|r| r.id)
            .collect();
        let now = Timestamp::now();
        let mut closed = 0;
        for id in open {
            let updated = self.finish_error(&id, |r| {
                r.transition(ErrorStatus::Recovering, now);
                r.transition(ErrorStatus::Recovered, now);
                r.context
                    .insert("resolved_by".into(), "operation completed".into());
            })?;
            if updated.is_some() {
                self.lift(&id);
                self.events.emit(SyncEvent::RecoveryCompleted { error_id: id });
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(operation_id = %op_id, closed, "errors resolved by completion");
        }
        Ok(closed)
    }

    /// Removes the containment an error applied. Returns false if it had
    /// none.
    pub fn lift(&self, id: &ErrorId) -> bool {
        let mut containment = self.containment.lock();
        let removed = containment.remove(id);
        let none_full = containment.full.is_empty();
        drop(containment);
        if removed {
            info!(error_id = %id, "isolation lifted");
        }
        if none_full {
            self.services.resume_all();
        }
        removed
    }

    /// Returns true if an active error blocks the entity.
    pub fn is_entity_isolated(&self, key: &EntityKey) -> bool {
        self.containment.lock().entities.contains_key(key)
    }

    /// Returns every blocked entity.
    pub fn isolated_entities(&self) -> Vec<EntityKey> {
        self.containment.lock().entities.keys().cloned().collect()
    }

    /// Returns true while full or strict isolation is in effect.
    pub fn is_flush_paused(&self) -> bool {
        !self.containment.lock().full.is_empty()
    }

    /// Returns false while strict isolation is in effect.
    pub fn is_available(&self) -> bool {
        self.containment.lock().strict.is_empty()
    }

    /// Waits for every scheduled recovery to finish.
    pub async fn settle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        warn!(error = %e, "recovery task panicked");
                    }
                }
            }
        }
    }

    /// Cancels scheduled recoveries.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ErrorIsolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorIsolator")
            .field("config", &self.config)
            .field("containment", &*self.containment.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::recovery::RecoveryAction;
    use crate::isolation::services::FlagService;
    use async_trait::async_trait;
    use serde_json::json;
    use syncwell_protocol::NewOperation;

    #[derive(Default)]
    struct Executor {
        fail: Mutex<Vec<RecoveryAction>>,
        ran: Mutex<Vec<RecoveryAction>>,
    }

    #[async_trait]
    impl RecoveryExecutor for Executor {
        async fn perform(&self, action: &RecoveryAction, _error: &ErrorRecord) -> SyncResult<()> {
            self.ran.lock().push(action.clone());
            if self.fail.lock().contains(action) {
                return Err(SyncError::External("still broken".into()));
            }
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<OperationStore>,
        executor: Arc<Executor>,
        isolator: Arc<ErrorIsolator>,
        events: crate::events::Subscription,
    }

    fn fixture(config: IsolationConfig) -> Fixture {
        let store = Arc::new(OperationStore::in_memory().unwrap());
        let executor = Arc::new(Executor::default());
        let bus = EventBus::new();
        let events = bus.subscribe();
        let isolator = Arc::new(ErrorIsolator::new(
            config,
            Arc::clone(&store),
            bus,
            executor.clone(),
        ));
        Fixture {
            store,
            executor,
            isolator,
            events,
        }
    }

    fn queued(store: &OperationStore) -> Operation {
        let op = Operation::from_request(
            NewOperation::update("card", "c1", json!({"front": "a"})),
            3,
            Timestamp::now(),
        );
        store.insert(op).unwrap()
    }

    fn manual() -> IsolationConfig {
        IsolationConfig::default().with_auto_recover(false)
    }

    #[tokio::test]
    async fn low_severity_is_ignored() {
        let f = fixture(manual());
        let op = queued(&f.store);
        let record = f
            .isolator
            .capture(&SyncError::Validation("bad".into()), Some(&op), BTreeMap::new())
            .unwrap();
        assert_eq!(record.status, ErrorStatus::Ignored);
        assert!(!f.isolator.is_entity_isolated(&EntityKey::new("card", "c1")));
    }

    #[tokio::test]
    async fn partial_isolation_blocks_entity() {
        let mut f = fixture(manual());
        let op = queued(&f.store);
        let record = f
            .isolator
            .capture(&SyncError::LocalStore("disk full".into()), Some(&op), BTreeMap::new())
            .unwrap();

        assert_eq!(record.status, ErrorStatus::Isolated);
        assert_eq!(record.isolation, Some(IsolationLevel::Partial));
        assert_eq!(record.recovery_strategy.as_deref(), Some("database-repair"));
        assert!(record.affected_entities.contains("card:c1"));
        assert!(f.isolator.is_entity_isolated(&EntityKey::new("card", "c1")));
        assert!(!f.isolator.is_flush_paused());

        let names: Vec<_> = f.events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["error-detected", "error-isolated"]);
    }

    #[tokio::test]
    async fn medium_severity_is_only_logged_at_capture() {
        let mut f = fixture(manual().with_level(IsolationLevel::Full));
        let op = queued(&f.store);
        let record = f
            .isolator
            .capture(&SyncError::Network("reset".into()), Some(&op), BTreeMap::new())
            .unwrap();

        assert_eq!(record.severity, Severity::Medium);
        assert_eq!(record.status, ErrorStatus::Analyzing);
        assert_eq!(record.isolation, None);
        assert!(!f.isolator.is_flush_paused());
        assert!(!f.isolator.is_entity_isolated(&EntityKey::new("card", "c1")));
        let names: Vec<_> = f.events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["error-detected"]);
    }

    #[tokio::test(start_paused = true)]
    async fn medium_error_is_isolated_when_its_delay_runs_out() {
        let mut f = fixture(IsolationConfig::default().with_level(IsolationLevel::Full));
        f.executor.fail.lock().push(RecoveryAction::WaitForConnectivity);
        let op = queued(&f.store);
        let record = f
            .isolator
            .capture(&SyncError::Network("reset".into()), Some(&op), BTreeMap::new())
            .unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(f.store.error(&record.id).unwrap().status, ErrorStatus::Analyzing);
        assert!(!f.isolator.is_flush_paused());

        f.isolator.settle().await;
        let record = f.store.error(&record.id).unwrap();
        assert_eq!(record.isolation, Some(IsolationLevel::Full));
        assert_eq!(record.status, ErrorStatus::Failed);
        // Retryable, so the failed recovery lifts the pause again.
        assert!(!f.isolator.is_flush_paused());
        let names: Vec<_> = f.events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["error-detected", "error-isolated", "recovery-started", "recovery-failed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn medium_error_resolved_before_its_delay_is_never_isolated() {
        let mut f = fixture(IsolationConfig::default().with_level(IsolationLevel::Full));
        let op = queued(&f.store);
        let record = f
            .isolator
            .capture(&SyncError::Timeout(Duration::from_secs(5)), Some(&op), BTreeMap::new())
            .unwrap();
        assert_eq!(f.isolator.resolve_for_operation(&op.id).unwrap(), 1);

        f.isolator.settle().await;
        let record = f.store.error(&record.id).unwrap();
        assert_eq!(record.status, ErrorStatus::Recovered);
        assert_eq!(record.isolation, None);
        assert!(f.executor.ran.lock().is_empty());
        let names: Vec<_> = f.events.drain().iter().map(|e| e.name()).collect();
        assert!(!names.contains(&"error-isolated"));
    }

    #[tokio::test]
    async fn repeated_error_updates_existing_record() {
        let f = fixture(manual());
        let op = queued(&f.store);
        let first = f
            .isolator
            .capture(&SyncError::Network("reset".into()), Some(&op), BTreeMap::new())
            .unwrap();
        let op = f
            .store
            .update(&op.id, WriteOrigin::Sync, |o| o.retry_count = 2)
            .unwrap();
        let second = f
            .isolator
            .capture(&SyncError::Network("reset again".into()), Some(&op), BTreeMap::new())
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.retry_count, 2);
        assert_eq!(f.store.errors().len(), 1);
    }

    #[tokio::test]
    async fn integrity_escalates_to_full_isolation() {
        let f = fixture(manual());
        let service = Arc::new(FlagService::new("pull"));
        f.isolator.services().register(service.clone());

        let record = f
            .isolator
            .capture(&SyncError::Integrity("crc mismatch".into()), None, BTreeMap::new())
            .unwrap();
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.isolation, Some(IsolationLevel::Full));
        assert!(f.isolator.is_flush_paused());
        assert!(f.isolator.is_available());
        assert!(service.is_paused());

        let report = f.isolator.recover(&record.id).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(f.store.error(&record.id).unwrap().status, ErrorStatus::Recovered);
        assert!(!f.isolator.is_flush_paused());
        assert!(!service.is_paused());
    }

    #[tokio::test]
    async fn strict_isolation_marks_unavailable() {
        let f = fixture(manual().with_level(IsolationLevel::Strict));
        let record = f
            .isolator
            .capture(&SyncError::Authentication("401".into()), None, BTreeMap::new())
            .unwrap();
        assert!(!f.isolator.is_available());
        assert!(f.isolator.lift(&record.id));
        assert!(f.isolator.is_available());
    }

    #[tokio::test]
    async fn failed_recovery_parks_non_retryable_operation() {
        let f = fixture(manual());
        let op = queued(&f.store);
        let op = f
            .store
            .transition(&op.id, OperationStatus::InFlight, WriteOrigin::Sync, Timestamp::now(), |_| {})
            .unwrap();
        let op = f
            .store
            .transition(&op.id, OperationStatus::Failed, WriteOrigin::Sync, Timestamp::now(), |_| {})
            .unwrap();
        f.executor.fail.lock().push(RecoveryAction::RetryOperation);

        let record = f
            .isolator
            .capture(&SyncError::Version("schema 9".into()), Some(&op), BTreeMap::new())
            .unwrap();
        let report = f.isolator.recover(&record.id).await.unwrap();

        assert!(!report.succeeded());
        let record = f.store.error(&record.id).unwrap();
        assert_eq!(record.status, ErrorStatus::Failed);
        assert!(record.context.contains_key("recovery_failure"));
        let op = f.store.get(&op.id).unwrap();
        assert_eq!(op.status, OperationStatus::Isolated);
        assert!(matches!(op.parked, Some(ParkReason::Unrecoverable(_))));
        // Containment stays until lifted by hand.
        assert!(f.isolator.is_entity_isolated(&EntityKey::new("card", "c1")));
    }

    #[tokio::test]
    async fn failed_recovery_of_retryable_error_lifts_isolation() {
        let f = fixture(manual());
        let op = queued(&f.store);
        f.executor.fail.lock().push(RecoveryAction::RepairStore);
        let record = f
            .isolator
            .capture(&SyncError::LocalStore("disk full".into()), Some(&op), BTreeMap::new())
            .unwrap();
        assert!(f.isolator.is_entity_isolated(&EntityKey::new("card", "c1")));

        let report = f.isolator.recover(&record.id).await.unwrap();
        assert!(!report.succeeded());
        assert!(!f.isolator.is_entity_isolated(&EntityKey::new("card", "c1")));
        assert_eq!(f.store.get(&op.id).unwrap().status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn completion_resolves_errors() {
        let f = fixture(manual());
        let op = queued(&f.store);
        let record = f
            .isolator
            .capture(&SyncError::Network("reset".into()), Some(&op), BTreeMap::new())
            .unwrap();

        assert_eq!(f.isolator.resolve_for_operation(&op.id).unwrap(), 1);
        assert_eq!(f.store.error(&record.id).unwrap().status, ErrorStatus::Recovered);
        assert!(f.isolator.isolated_entities().is_empty());
        assert!(f.isolator.recover(&record.id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_recovery_waits_by_severity() {
        let f = fixture(IsolationConfig::default());
        let record = f
            .isolator
            .capture(&SyncError::LocalStore("disk full".into()), None, BTreeMap::new())
            .unwrap();
        assert_eq!(record.severity, Severity::High);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(f.store.error(&record.id).unwrap().status, ErrorStatus::Isolated);

        f.isolator.settle().await;
        assert_eq!(f.store.error(&record.id).unwrap().status, ErrorStatus::Recovered);
        assert_eq!(
            *f.executor.ran.lock(),
            vec![RecoveryAction::CheckIntegrity, RecoveryAction::RepairStore]
        );
    }

    #[tokio::test]
    async fn restore_reapplies_containment() {
        let f = fixture(manual());
        let op = queued(&f.store);
        f.isolator
            .capture(&SyncError::LocalStore("disk full".into()), Some(&op), BTreeMap::new())
            .unwrap();

        let reopened = Arc::new(ErrorIsolator::new(
            manual(),
            Arc::clone(&f.store),
            EventBus::new(),
            f.executor.clone(),
        ));
        assert_eq!(reopened.restore(), 1);
        assert!(reopened.is_entity_isolated(&EntityKey::new("card", "c1")));
    }
}
