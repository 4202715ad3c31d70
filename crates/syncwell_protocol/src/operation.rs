//! Queued operations.

use crate::ids::{EntityKey, OperationId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Type of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
    /// Several records of one entity type written together.
    ///
    /// The payload is a JSON array of objects, each carrying an `id` field.
    Batch,
}

impl OperationKind {
    /// Returns the lowercase name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Batch => "batch",
        }
    }
}

/// Dispatch priority. Variants are declared from most to least urgent, so
/// the derived ordering sorts critical work first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Must go out before anything else.
    Critical,
    /// Ahead of routine work.
    High,
    /// Routine work.
    #[default]
    Normal,
    /// Background work.
    Low,
}

impl Priority {
    /// Returns the lowercase name of this priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be flushed.
    Pending,
    /// Currently being applied to the remote backend.
    InFlight,
    /// Applied remotely (or superseded by the remote copy).
    Completed,
    /// Retries exhausted or the failure was not retryable.
    Failed,
    /// Parked: unrecoverable, cancelled, or waiting for manual resolution.
    Isolated,
}

impl OperationStatus {
    /// Returns the lowercase name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Isolated => "isolated",
        }
    }

    /// Parses a status name as produced by [`Self::as_str`].
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(OperationStatus::Pending),
            "in_flight" | "in-flight" => Some(OperationStatus::InFlight),
            "completed" => Some(OperationStatus::Completed),
            "failed" => Some(OperationStatus::Failed),
            "isolated" => Some(OperationStatus::Isolated),
            _ => None,
        }
    }

    /// Returns true if the transition `self -> next` is allowed.
    ///
    /// Status moves forward only, with these exceptions:
    /// - `failed -> pending` when a retry budget is reset
    /// - `isolated -> pending` when a parked operation is resumed
    /// - `in_flight -> pending` when a flush is paused or aborted
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Isolated)
                | (InFlight, Completed)
                | (InFlight, Failed)
                | (InFlight, Isolated)
                | (InFlight, Pending)
                | (Failed, Pending)
                | (Failed, Isolated)
                | (Isolated, Pending)
                | (Isolated, Completed)
        )
    }

    /// Returns true if no automatic transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Isolated)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an operation was parked in [`OperationStatus::Isolated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum ParkReason {
    /// A conflict needs a manual decision.
    ManualConflict(String),
    /// The retry sequence was cancelled by the application.
    Cancelled,
    /// Error isolation marked the failure unrecoverable.
    Unrecoverable(String),
}

/// A mutation queued for application to the remote backend.
///
/// # Invariants
///
/// - `status` only changes through [`OperationStatus::can_transition_to`]
/// - every id in `dependencies` must be `completed` before the operation
///   may enter `in_flight`
/// - `sequence` is the submission order and never changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID.
    pub id: OperationId,
    /// Mutation type.
    pub kind: OperationKind,
    /// Entity type (table), e.g. `card`.
    pub entity_type: String,
    /// Entity id. `None` for creates until the backend assigns one.
    pub entity_id: Option<String>,
    /// Entity payload. `null` for deletes.
    pub payload: Value,
    /// Owner of the mutation.
    pub owner_id: String,
    /// When the mutation happened locally.
    pub created_at: Timestamp,
    /// Last-modified time of the entity version this edit was based on.
    pub base_version: Option<Timestamp>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Operations that must complete first.
    pub dependencies: BTreeSet<OperationId>,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Submission order, assigned by the store.
    pub sequence: u64,
    /// Last status change.
    pub updated_at: Timestamp,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Set while the operation is parked.
    pub parked: Option<ParkReason>,
}

impl Operation {
    /// Builds a pending operation from an application request.
    pub fn from_request(request: NewOperation, default_max_retries: u32, now: Timestamp) -> Self {
        Self {
            id: OperationId::new(),
            kind: request.kind,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            payload: request.payload,
            owner_id: request.owner_id,
            created_at: now,
            base_version: request.base_version,
            priority: request.priority,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            dependencies: request.dependencies,
            status: OperationStatus::Pending,
            sequence: 0,
            updated_at: now,
            last_error: None,
            parked: None,
        }
    }

    /// Returns the entity key, if the entity id is known.
    pub fn entity_key(&self) -> Option<EntityKey> {
        self.entity_id
            .as_ref()
            .map(|id| EntityKey::new(self.entity_type.clone(), id.clone()))
    }

    /// Returns every entity key the operation touches.
    ///
    /// Batch operations touch one entity per element that carries an `id`.
    pub fn touched_entities(&self) -> Vec<EntityKey> {
        match self.kind {
            OperationKind::Batch => self
                .payload
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("id").and_then(Value::as_str))
                        .map(|id| EntityKey::new(self.entity_type.clone(), id))
                        .collect()
                })
                .unwrap_or_default(),
            _ => self.entity_key().into_iter().collect(),
        }
    }

    /// Moves to `next`, returning false (and leaving the status unchanged)
    /// if the transition is not allowed.
    pub fn transition(&mut self, next: OperationStatus, now: Timestamp) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        if next != OperationStatus::Isolated {
            self.parked = None;
        }
        true
    }

    /// Returns true if the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Approximate encoded size of the payload in bytes.
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0)
    }
}

/// An application request to perform a local mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Mutation type.
    pub kind: OperationKind,
    /// Entity type.
    pub entity_type: String,
    /// Entity id, if already known.
    pub entity_id: Option<String>,
    /// Entity payload.
    pub payload: Value,
    /// Owner of the mutation.
    pub owner_id: String,
    /// Dispatch priority.
    pub priority: Priority,
    /// Operations that must complete first.
    pub dependencies: BTreeSet<OperationId>,
    /// Retry budget override.
    pub max_retries: Option<u32>,
    /// Version of the entity this edit was based on.
    pub base_version: Option<Timestamp>,
}

impl NewOperation {
    fn new(
        kind: OperationKind,
        entity_type: impl Into<String>,
        entity_id: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            entity_type: entity_type.into(),
            entity_id,
            payload,
            owner_id: String::new(),
            priority: Priority::Normal,
            dependencies: BTreeSet::new(),
            max_retries: None,
            base_version: None,
        }
    }

    /// Creates a new entity. The id may be assigned by the store.
    pub fn create(entity_type: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationKind::Create, entity_type, None, payload)
    }

    /// Creates a new entity with a caller-chosen id.
    pub fn create_with_id(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(
            OperationKind::Create,
            entity_type,
            Some(entity_id.into()),
            payload,
        )
    }

    /// Updates an existing entity.
    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(
            OperationKind::Update,
            entity_type,
            Some(entity_id.into()),
            payload,
        )
    }

    /// Deletes an entity.
    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(
            OperationKind::Delete,
            entity_type,
            Some(entity_id.into()),
            Value::Null,
        )
    }

    /// Writes several records of one type together.
    pub fn batch(entity_type: impl Into<String>, records: Vec<Value>) -> Self {
        Self::new(OperationKind::Batch, entity_type, None, Value::Array(records))
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the owner.
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: OperationId) -> Self {
        self.dependencies.insert(id);
        self
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Records the version this edit was based on.
    #[must_use]
    pub fn with_base_version(mut self, version: Timestamp) -> Self {
        self.base_version = Some(version);
        self
    }
}
