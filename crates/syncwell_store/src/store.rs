//! The operation record store.
//!
//! Holds operations, archived operation ids, conflicts, and error records
//! in four framed logs, with in-memory indexes by status and by entity.
//! Every write enters the [`WriteGate`] first, so application mutations
//! always go ahead of queued sync writes.

use crate::backend::{FileLog, LogBackend, MemoryLog};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::gate::{GateStats, WriteGate, WriteOrigin};
use crate::table::{CompactReport, ReplayReport, Row, Table, VerifyReport};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use syncwell_protocol::{
    Conflict, ConflictId, EntityKey, ErrorId, ErrorRecord, Operation, OperationId,
    OperationKind, OperationStatus, ParkReason, Priority, Timestamp,
};
use tracing::{debug, info, warn};

impl Row for Operation {
    type Key = OperationId;
    fn key(&self) -> OperationId {
        self.id
    }
}

impl Row for Conflict {
    type Key = ConflictId;
    fn key(&self) -> ConflictId {
        self.id
    }
}

impl Row for ErrorRecord {
    type Key = ErrorId;
    fn key(&self) -> ErrorId {
        self.id
    }
}

/// What remains of a completed operation after archiving.
///
/// The payload is dropped; the id stays so dependency checks on it keep
/// succeeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedOperation {
    /// Operation id.
    pub id: OperationId,
    /// Mutation type.
    pub kind: OperationKind,
    /// Entity type.
    pub entity_type: String,
    /// Entity id, if known.
    pub entity_id: Option<String>,
    /// Submission order.
    pub sequence: u64,
    /// When the operation completed.
    pub completed_at: Timestamp,
}

impl Row for ArchivedOperation {
    type Key = OperationId;
    fn key(&self) -> OperationId {
        self.id
    }
}

impl From<&Operation> for ArchivedOperation {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id,
            kind: op.kind,
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            sequence: op.sequence,
            completed_at: op.updated_at,
        }
    }
}

/// Operation counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Waiting to be flushed.
    pub pending: usize,
    /// Being applied.
    pub in_flight: usize,
    /// Completed, not yet archived.
    pub completed: usize,
    /// Failed.
    pub failed: usize,
    /// Parked.
    pub isolated: usize,
    /// Archived.
    pub archived: usize,
}

impl StatusCounts {
    fn bump(&mut self, status: OperationStatus, by: usize) {
        match status {
            OperationStatus::Pending => self.pending += by,
            OperationStatus::InFlight => self.in_flight += by,
            OperationStatus::Completed => self.completed += by,
            OperationStatus::Failed => self.failed += by,
            OperationStatus::Isolated => self.isolated += by,
        }
    }

    /// Operations still held in full.
    #[must_use]
    pub fn live(&self) -> usize {
        self.pending + self.in_flight + self.completed + self.failed + self.isolated
    }
}

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Operations by status.
    pub operations: StatusCounts,
    /// Conflicts still needing attention.
    pub active_conflicts: usize,
    /// All retained conflicts.
    pub conflicts: usize,
    /// Errors still being handled.
    pub active_errors: usize,
    /// All retained errors.
    pub errors: usize,
    /// Combined size of all logs.
    pub log_bytes: u64,
    /// Superseded frames across all logs.
    pub dead_frames: u64,
}

/// What opening the store found.
#[derive(Debug, Clone, Default)]
pub struct OpenReport {
    /// Replay report per table.
    pub tables: Vec<(&'static str, ReplayReport)>,
    /// In-flight operations returned to pending.
    pub requeued: usize,
}

/// Compaction outcome per table.
#[derive(Debug, Clone, Default)]
pub struct CompactSummary {
    /// Report per table.
    pub tables: Vec<(&'static str, CompactReport)>,
}

impl CompactSummary {
    /// Total bytes reclaimed.
    #[must_use]
    pub fn bytes_reclaimed(&self) -> u64 {
        self.tables
            .iter()
            .map(|(_, r)| r.bytes_before.saturating_sub(r.bytes_after))
            .sum()
    }
}

/// Records removed by a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Failed or parked operations removed.
    pub operations: usize,
    /// Resolved conflicts removed.
    pub conflicts: usize,
    /// Finished error records removed.
    pub errors: usize,
}

/// Verification outcome.
#[derive(Debug, Clone, Default)]
pub struct StoreVerifyReport {
    /// Report per table.
    pub tables: Vec<(&'static str, VerifyReport)>,
    /// Cross-record problems.
    pub problems: Vec<String>,
}

impl StoreVerifyReport {
    /// Returns true if no table or cross-record problem was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty() && self.tables.iter().all(|(_, r)| r.is_clean())
    }

    /// Every problem, table problems first.
    pub fn all_problems(&self) -> impl Iterator<Item = &String> {
        self.tables
            .iter()
            .flat_map(|(_, r)| r.problems.iter())
            .chain(self.problems.iter())
    }
}

/// Shared in-memory logs, for tests that reopen a store without a disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogs {
    /// Operations log.
    pub operations: MemoryLog,
    /// Archive log.
    pub archive: MemoryLog,
    /// Conflicts log.
    pub conflicts: MemoryLog,
    /// Errors log.
    pub errors: MemoryLog,
}

type QueueKey = (Priority, u64, OperationId);

fn queue_key(op: &Operation) -> QueueKey {
    (op.priority, op.sequence, op.id)
}

struct Inner {
    operations: Table<Operation>,
    archive: Table<ArchivedOperation>,
    conflicts: Table<Conflict>,
    errors: Table<ErrorRecord>,
    by_status: HashMap<OperationStatus, BTreeSet<QueueKey>>,
    by_entity: BTreeMap<EntityKey, BTreeSet<(u64, OperationId)>>,
    active_conflicts: BTreeMap<EntityKey, ConflictId>,
    next_sequence: u64,
    compaction_threshold: u64,
}

impl Inner {
    fn index(&mut self, op: &Operation) {
        self.by_status
            .entry(op.status)
            .or_default()
            .insert(queue_key(op));
        for key in op.touched_entities() {
            self.by_entity
                .entry(key)
                .or_default()
                .insert((op.sequence, op.id));
        }
    }

    fn unindex(&mut self, op: &Operation) {
        if let Some(set) = self.by_status.get_mut(&op.status) {
            set.remove(&queue_key(op));
        }
        for key in op.touched_entities() {
            if let Some(set) = self.by_entity.get_mut(&key) {
                set.remove(&(op.sequence, op.id));
                if set.is_empty() {
                    self.by_entity.remove(&key);
                }
            }
        }
    }

    fn insert(&mut self, mut op: Operation) -> StoreResult<Operation> {
        if self.operations.contains(&op.id) || self.archive.contains(&op.id) {
            return Err(StoreError::InvalidArgument(format!(
                "operation {} already exists",
                op.id
            )));
        }
        op.sequence = self.next_sequence;
        self.operations.upsert(op.clone())?;
        self.next_sequence += 1;
        self.index(&op);
        Ok(op)
    }

    fn replace(&mut self, previous: &Operation, next: Operation) -> StoreResult<()> {
        self.operations.upsert(next.clone())?;
        self.unindex(previous);
        self.index(&next);
        self.maybe_compact()
    }

    fn remove_operation(&mut self, id: &OperationId) -> StoreResult<Option<Operation>> {
        let removed = self.operations.remove(id)?;
        if let Some(op) = &removed {
            self.unindex(op);
        }
        Ok(removed)
    }

    fn ordered(&self, status: OperationStatus) -> Vec<Operation> {
        self.by_status
            .get(&status)
            .into_iter()
            .flatten()
            .filter_map(|(_, _, id)| self.operations.get(id).cloned())
            .collect()
    }

    fn is_done(&self, id: &OperationId) -> bool {
        self.archive.contains(id)
            || self
                .operations
                .get(id)
                .is_some_and(|op| op.status == OperationStatus::Completed)
    }

    fn maybe_compact(&mut self) -> StoreResult<()> {
        let threshold = self.compaction_threshold;
        if threshold == 0 {
            return Ok(());
        }
        if self.operations.dead_frames() >= threshold {
            self.operations.compact()?;
        }
        if self.archive.dead_frames() >= threshold {
            self.archive.compact()?;
        }
        if self.conflicts.dead_frames() >= threshold {
            self.conflicts.compact()?;
        }
        if self.errors.dead_frames() >= threshold {
            self.errors.compact()?;
        }
        Ok(())
    }
}

/// Durable store for operations, conflicts, and error records.
///
/// # Concurrency
///
/// Reads take a shared lock and never wait on the gate. Writes pass the
/// two-tier gate, then take the exclusive lock for the duration of one
/// record change.
pub struct OperationStore {
    gate: WriteGate,
    inner: RwLock<Inner>,
    config: StoreConfig,
    _dir: Option<StoreDir>,
}

impl std::fmt::Debug for OperationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("OperationStore")
            .field("operations", &inner.operations.len())
            .field("archived", &inner.archive.len())
            .field("conflicts", &inner.conflicts.len())
            .field("errors", &inner.errors.len())
            .finish_non_exhaustive()
    }
}

impl OperationStore {
    /// Opens (or creates) a store in `path`, holding its directory lock.
    pub fn open(path: &Path, config: StoreConfig) -> StoreResult<(Self, OpenReport)> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let operations: Box<dyn LogBackend> = Box::new(FileLog::open(&dir.operations_path())?);
        let archive: Box<dyn LogBackend> = Box::new(FileLog::open(&dir.archive_path())?);
        let conflicts: Box<dyn LogBackend> = Box::new(FileLog::open(&dir.conflicts_path())?);
        let errors: Box<dyn LogBackend> = Box::new(FileLog::open(&dir.errors_path())?);
        info!(path = %path.display(), "opening operation store");
        Self::from_logs([operations, archive, conflicts, errors], config, Some(dir))
    }

    /// Opens a store over shared in-memory logs.
    pub fn open_memory(logs: &MemoryLogs, config: StoreConfig) -> StoreResult<(Self, OpenReport)> {
        let backends: [Box<dyn LogBackend>; 4] = [
            Box::new(logs.operations.clone()),
            Box::new(logs.archive.clone()),
            Box::new(logs.conflicts.clone()),
            Box::new(logs.errors.clone()),
        ];
        Self::from_logs(backends, config, None)
    }

    /// Creates an empty store that lives only in memory.
    pub fn in_memory() -> StoreResult<Self> {
        let config = StoreConfig::default().sync_on_write(false);
        Self::open_memory(&MemoryLogs::default(), config).map(|(store, _)| store)
    }

    fn from_logs(
        logs: [Box<dyn LogBackend>; 4],
        config: StoreConfig,
        dir: Option<StoreDir>,
    ) -> StoreResult<(Self, OpenReport)> {
        let sync = config.sync_on_write;
        let [operations, archive, conflicts, errors] = logs;
        let (operations, ops_report) = Table::open("operations", operations, sync)?;
        let (archive, archive_report) = Table::open("archive", archive, sync)?;
        let (conflicts, conflicts_report) = Table::open("conflicts", conflicts, sync)?;
        let (errors, errors_report) = Table::open("errors", errors, sync)?;

        let mut inner = Inner {
            operations,
            archive,
            conflicts,
            errors,
            by_status: HashMap::new(),
            by_entity: BTreeMap::new(),
            active_conflicts: BTreeMap::new(),
            next_sequence: 1,
            compaction_threshold: config.compaction_threshold,
        };

        let live: Vec<Operation> = inner.operations.values().cloned().collect();
        let mut max_sequence = inner
            .archive
            .values()
            .map(|a| a.sequence)
            .max()
            .unwrap_or(0);
        for op in &live {
            max_sequence = max_sequence.max(op.sequence);
            inner.index(op);
        }
        inner.next_sequence = max_sequence + 1;

        let mut active: Vec<&Conflict> = inner.conflicts.values().filter(|c| c.is_active()).collect();
        active.sort_by_key(|c| c.detected_at);
        let active: Vec<(EntityKey, ConflictId)> =
            active.into_iter().map(|c| (c.entity_key(), c.id)).collect();
        for (key, id) in active {
            if let Some(previous) = inner.active_conflicts.insert(key.clone(), id) {
                warn!(entity = %key, kept = %id, shadowed = %previous, "multiple active conflicts for entity");
            }
        }

        let now = Timestamp::now();
        let mut requeued = 0;
        for op in live.iter().filter(|op| op.status == OperationStatus::InFlight) {
            let mut next = op.clone();
            if next.transition(OperationStatus::Pending, now) {
                inner.replace(op, next)?;
                requeued += 1;
            }
        }
        if requeued > 0 {
            warn!(requeued, "returned interrupted in-flight operations to pending");
        }

        let report = OpenReport {
            tables: vec![
                ("operations", ops_report),
                ("archive", archive_report),
                ("conflicts", conflicts_report),
                ("errors", errors_report),
            ],
            requeued,
        };
        info!(
            operations = inner.operations.len(),
            archived = inner.archive.len(),
            conflicts = inner.conflicts.len(),
            errors = inner.errors.len(),
            next_sequence = inner.next_sequence,
            "operation store ready"
        );

        Ok((
            Self {
                gate: WriteGate::new(),
                inner: RwLock::new(inner),
                config,
                _dir: dir,
            },
            report,
        ))
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns write-gate contention counters.
    #[must_use]
    pub fn gate_stats(&self) -> GateStats {
        self.gate.stats()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Persists a new operation and assigns its sequence number.
    pub fn insert(&self, op: Operation) -> StoreResult<Operation> {
        let _permit = self.gate.enter(WriteOrigin::Local);
        let stored = self.inner.write().insert(op)?;
        debug!(operation_id = %stored.id, sequence = stored.sequence, "operation stored");
        Ok(stored)
    }

    /// Persists several operations with consecutive sequence numbers.
    pub fn insert_all(&self, ops: Vec<Operation>) -> StoreResult<Vec<Operation>> {
        let _permit = self.gate.enter(WriteOrigin::Local);
        let mut inner = self.inner.write();
        ops.into_iter().map(|op| inner.insert(op)).collect()
    }

    /// Returns an operation by id.
    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.inner.read().operations.get(id).cloned()
    }

    /// Returns true if the id names a live or archived operation.
    pub fn contains(&self, id: &OperationId) -> bool {
        let inner = self.inner.read();
        inner.operations.contains(id) || inner.archive.contains(id)
    }

    /// Returns true if the operation completed, whether or not it has been
    /// archived since.
    pub fn is_done(&self, id: &OperationId) -> bool {
        self.inner.read().is_done(id)
    }

    /// Returns an archived operation by id.
    pub fn archived(&self, id: &OperationId) -> Option<ArchivedOperation> {
        self.inner.read().archive.get(id).cloned()
    }

    /// Applies `edit` and moves the operation to `next`.
    ///
    /// `edit` may change counters, errors and park reasons; identity,
    /// sequence, and status are restored before the transition is checked.
    pub fn transition(
        &self,
        id: &OperationId,
        next: OperationStatus,
        origin: WriteOrigin,
        now: Timestamp,
        edit: impl FnOnce(&mut Operation),
    ) -> StoreResult<Operation> {
        let _permit = self.gate.enter(origin);
        let mut inner = self.inner.write();
        let previous = inner
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("operation", id))?;

        let mut op = previous.clone();
        edit(&mut op);
        op.id = previous.id;
        op.sequence = previous.sequence;
        op.status = previous.status;
        if !op.transition(next, now) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: previous.status,
                to: next,
            });
        }
        inner.replace(&previous, op.clone())?;
        debug!(operation_id = %id, from = %previous.status, to = %next, "operation transitioned");
        Ok(op)
    }

    /// Applies `edit` without changing status.
    pub fn update(
        &self,
        id: &OperationId,
        origin: WriteOrigin,
        edit: impl FnOnce(&mut Operation),
    ) -> StoreResult<Operation> {
        let _permit = self.gate.enter(origin);
        let mut inner = self.inner.write();
        let previous = inner
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("operation", id))?;

        let mut op = previous.clone();
        edit(&mut op);
        op.id = previous.id;
        op.sequence = previous.sequence;
        op.status = previous.status;
        inner.replace(&previous, op.clone())?;
        Ok(op)
    }

    /// Returns every live operation in submission order.
    pub fn operations(&self) -> Vec<Operation> {
        let inner = self.inner.read();
        let mut ops: Vec<Operation> = inner.operations.values().cloned().collect();
        ops.sort_by_key(|op| op.sequence);
        ops
    }

    /// Returns operations with `status`, ordered by priority, then
    /// submission order.
    pub fn with_status(&self, status: OperationStatus) -> Vec<Operation> {
        self.inner.read().ordered(status)
    }

    /// Returns pending operations in dispatch order.
    pub fn pending(&self) -> Vec<Operation> {
        self.with_status(OperationStatus::Pending)
    }

    /// Returns live operations touching `key`, in submission order.
    pub fn for_entity(&self, key: &EntityKey) -> Vec<Operation> {
        let inner = self.inner.read();
        inner
            .by_entity
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|(_, id)| inner.operations.get(id).cloned())
            .collect()
    }

    /// Returns operation counts by status.
    pub fn counts(&self) -> StatusCounts {
        let inner = self.inner.read();
        let mut counts = StatusCounts {
            archived: inner.archive.len(),
            ..StatusCounts::default()
        };
        for (status, set) in &inner.by_status {
            counts.bump(*status, set.len());
        }
        counts
    }

    /// Moves every completed operation to the archive.
    pub fn archive_completed(&self) -> StoreResult<usize> {
        let _permit = self.gate.enter(WriteOrigin::Sync);
        let mut inner = self.inner.write();
        let done = inner.ordered(OperationStatus::Completed);
        for op in &done {
            inner.archive.upsert(ArchivedOperation::from(op))?;
            inner.remove_operation(&op.id)?;
        }
        inner.maybe_compact()?;
        if !done.is_empty() {
            debug!(archived = done.len(), "completed operations archived");
        }
        Ok(done.len())
    }

    /// Removes records that stopped changing before `cutoff`.
    ///
    /// Covers failed operations, parked operations not waiting on a manual
    /// conflict, resolved conflicts, and finished error records.
    pub fn purge(&self, cutoff: Timestamp) -> StoreResult<PurgeReport> {
        let _permit = self.gate.enter(WriteOrigin::Sync);
        let mut inner = self.inner.write();
        let mut report = PurgeReport::default();

        let stale_ops: Vec<OperationId> = inner
            .operations
            .values()
            .filter(|op| op.updated_at < cutoff)
            .filter(|op| match op.status {
                OperationStatus::Failed => true,
                OperationStatus::Isolated => {
                    !matches!(op.parked, Some(ParkReason::ManualConflict(_)))
                }
                _ => false,
            })
            .map(|op| op.id)
            .collect();
        for id in &stale_ops {
            inner.remove_operation(id)?;
        }
        report.operations = stale_ops.len();

        let stale_conflicts: Vec<ConflictId> = inner
            .conflicts
            .values()
            .filter(|c| c.resolved_at.is_some_and(|at| at < cutoff))
            .map(|c| c.id)
            .collect();
        for id in &stale_conflicts {
            inner.conflicts.remove(id)?;
        }
        report.conflicts = stale_conflicts.len();

        let stale_errors: Vec<ErrorId> = inner
            .errors
            .values()
            .filter(|e| !e.is_active() && e.updated_at < cutoff)
            .map(|e| e.id)
            .collect();
        for id in &stale_errors {
            inner.errors.remove(id)?;
        }
        report.errors = stale_errors.len();

        inner.maybe_compact()?;
        if report != PurgeReport::default() {
            info!(
                operations = report.operations,
                conflicts = report.conflicts,
                errors = report.errors,
                "purged expired records"
            );
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Persists a conflict.
    ///
    /// Fails if the entity already has an active conflict.
    pub fn insert_conflict(&self, conflict: Conflict) -> StoreResult<Conflict> {
        let _permit = self.gate.enter(WriteOrigin::Sync);
        let mut inner = self.inner.write();
        let key = conflict.entity_key();
        if conflict.is_active() && inner.active_conflicts.contains_key(&key) {
            return Err(StoreError::ActiveConflictExists {
                entity: key.to_string(),
            });
        }
        inner.conflicts.upsert(conflict.clone())?;
        if conflict.is_active() {
            inner.active_conflicts.insert(key, conflict.id);
        }
        Ok(conflict)
    }

    /// Returns a conflict by id.
    pub fn conflict(&self, id: &ConflictId) -> Option<Conflict> {
        self.inner.read().conflicts.get(id).cloned()
    }

    /// Returns the active conflict for an entity, if any.
    pub fn active_conflict(&self, key: &EntityKey) -> Option<Conflict> {
        let inner = self.inner.read();
        inner
            .active_conflicts
            .get(key)
            .and_then(|id| inner.conflicts.get(id))
            .cloned()
    }

    /// Returns all retained conflicts, oldest first.
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut all: Vec<Conflict> = self.inner.read().conflicts.values().cloned().collect();
        all.sort_by_key(|c| (c.detected_at, c.id));
        all
    }

    /// Applies `edit` to an active conflict.
    ///
    /// Terminal conflicts are immutable. Entity and operation references
    /// cannot be changed.
    pub fn update_conflict(
        &self,
        id: &ConflictId,
        edit: impl FnOnce(&mut Conflict),
    ) -> StoreResult<Conflict> {
        let _permit = self.gate.enter(WriteOrigin::Local);
        let mut inner = self.inner.write();
        let previous = inner
            .conflicts
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("conflict", id))?;
        if !previous.is_active() {
            return Err(StoreError::Immutable {
                what: "conflict",
                id: id.to_string(),
            });
        }

        let mut conflict = previous.clone();
        edit(&mut conflict);
        conflict.id = previous.id;
        conflict.entity_type = previous.entity_type.clone();
        conflict.entity_id = previous.entity_id.clone();
        conflict.operation_id = previous.operation_id;

        inner.conflicts.upsert(conflict.clone())?;
        if !conflict.is_active() {
            inner.active_conflicts.remove(&conflict.entity_key());
        }
        inner.maybe_compact()?;
        Ok(conflict)
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Persists an error record.
    pub fn insert_error(&self, record: ErrorRecord) -> StoreResult<ErrorRecord> {
        let _permit = self.gate.enter(WriteOrigin::Sync);
        self.inner.write().errors.upsert(record.clone())?;
        Ok(record)
    }

    /// Returns an error record by id.
    pub fn error(&self, id: &ErrorId) -> Option<ErrorRecord> {
        self.inner.read().errors.get(id).cloned()
    }

    /// Returns all retained error records, oldest first.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        let mut all: Vec<ErrorRecord> = self.inner.read().errors.values().cloned().collect();
        all.sort_by_key(|e| (e.detected_at, e.id));
        all
    }

    /// Returns the active error record tied to an operation, if any.
    pub fn active_error_for(&self, operation: &OperationId) -> Option<ErrorRecord> {
        self.inner
            .read()
            .errors
            .values()
            .filter(|e| e.is_active() && e.related_operation.as_ref() == Some(operation))
            .max_by_key(|e| e.detected_at)
            .cloned()
    }

    /// Applies `edit` to an active error record.
    pub fn update_error(
        &self,
        id: &ErrorId,
        edit: impl FnOnce(&mut ErrorRecord),
    ) -> StoreResult<ErrorRecord> {
        let _permit = self.gate.enter(WriteOrigin::Sync);
        let mut inner = self.inner.write();
        let previous = inner
            .errors
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("error", id))?;
        if !previous.is_active() {
            return Err(StoreError::Immutable {
                what: "error",
                id: id.to_string(),
            });
        }

        let mut record = previous.clone();
        edit(&mut record);
        record.id = previous.id;
        record.detected_at = previous.detected_at;
        record.severity = record.severity.max(previous.severity);

        inner.errors.upsert(record.clone())?;
        inner.maybe_compact()?;
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Returns store-wide counters.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let operations = self.counts();
        let inner = self.inner.read();
        Ok(StoreStats {
            operations,
            active_conflicts: inner.active_conflicts.len(),
            conflicts: inner.conflicts.len(),
            active_errors: inner.errors.values().filter(|e| e.is_active()).count(),
            errors: inner.errors.len(),
            log_bytes: inner.operations.log_size()?
                + inner.archive.log_size()?
                + inner.conflicts.log_size()?
                + inner.errors.log_size()?,
            dead_frames: inner.operations.dead_frames()
                + inner.archive.dead_frames()
                + inner.conflicts.dead_frames()
                + inner.errors.dead_frames(),
        })
    }

    /// Rewrites every log with one frame per live record.
    pub fn compact(&self) -> StoreResult<CompactSummary> {
        let _permit = self.gate.enter(WriteOrigin::Sync);
        let mut inner = self.inner.write();
        let summary = CompactSummary {
            tables: vec![
                ("operations", inner.operations.compact()?),
                ("archive", inner.archive.compact()?),
                ("conflicts", inner.conflicts.compact()?),
                ("errors", inner.errors.compact()?),
            ],
        };
        info!(bytes_reclaimed = summary.bytes_reclaimed(), "store compacted");
        Ok(summary)
    }

    /// Re-reads every log and checks cross-record references.
    pub fn verify(&self) -> StoreResult<StoreVerifyReport> {
        let inner = self.inner.read();
        let mut report = StoreVerifyReport {
            tables: vec![
                ("operations", inner.operations.verify()?),
                ("archive", inner.archive.verify()?),
                ("conflicts", inner.conflicts.verify()?),
                ("errors", inner.errors.verify()?),
            ],
            problems: Vec::new(),
        };

        for op in inner.operations.values() {
            if inner.archive.contains(&op.id) {
                report
                    .problems
                    .push(format!("{} is both live and archived", op.id));
            }
            for dep in &op.dependencies {
                if !inner.operations.contains(dep) && !inner.archive.contains(dep) {
                    report
                        .problems
                        .push(format!("{} depends on unknown operation {dep}", op.id));
                }
            }
            if op.status == OperationStatus::Isolated && op.parked.is_none() {
                report
                    .problems
                    .push(format!("{} is isolated without a park reason", op.id));
            }
        }

        let mut active_per_entity: BTreeMap<EntityKey, usize> = BTreeMap::new();
        for conflict in inner.conflicts.values().filter(|c| c.is_active()) {
            *active_per_entity.entry(conflict.entity_key()).or_default() += 1;
        }
        for (key, count) in active_per_entity {
            if count > 1 {
                report
                    .problems
                    .push(format!("entity {key} has {count} active conflicts"));
            }
        }

        let mut sequences = BTreeSet::new();
        for seq in inner
            .operations
            .values()
            .map(|op| op.sequence)
            .chain(inner.archive.values().map(|a| a.sequence))
        {
            if !sequences.insert(seq) {
                report
                    .problems
                    .push(format!("sequence {seq} is assigned twice"));
            }
        }

        Ok(report)
    }
}
