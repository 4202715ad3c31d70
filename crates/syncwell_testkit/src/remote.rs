//! A remote backend with per-entity failure scripts and a call log.
//!
//! [`ScriptedRemote`] stores records in a [`MemoryRemote`] and records every
//! call it receives, so tests can assert on the order in which the engine
//! reached the remote side.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use syncwell_engine::{MemoryRemote, RemoteBackend, SyncError, SyncResult, UpsertAck};
use syncwell_protocol::{EntityKey, EntityRecord, ErrorKind, Timestamp};

/// Remote method that was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `upsert`, or one record of `upsert_batch`.
    Upsert,
    /// `soft_delete`.
    Delete,
    /// `fetch`.
    Fetch,
    /// `fetch_changed_since`.
    FetchChanged,
}

/// One logged remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    /// Method.
    pub kind: CallKind,
    /// Entity the call addressed. `fetch_changed_since` uses id `*`.
    pub entity: EntityKey,
    /// Record payload, for upserts.
    pub data: Option<Value>,
    /// Failure injected into the call, if any.
    pub failed: Option<ErrorKind>,
}

impl RemoteCall {
    /// Whether the call wrote to the remote store.
    pub fn is_write(&self) -> bool {
        self.failed.is_none() && matches!(self.kind, CallKind::Upsert | CallKind::Delete)
    }
}

/// A [`RemoteBackend`] that fails calls for chosen entities on demand.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    inner: MemoryRemote,
    script: Mutex<HashMap<EntityKey, VecDeque<ErrorKind>>>,
    log: Mutex<Vec<RemoteCall>>,
}

impl ScriptedRemote {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the backing store.
    pub fn inner(&self) -> &MemoryRemote {
        &self.inner
    }

    /// Makes the next `count` calls addressing one entity fail with `kind`.
    pub fn fail_entity(&self, entity_type: &str, id: &str, count: usize, kind: ErrorKind) {
        self.script
            .lock()
            .entry(EntityKey::new(entity_type, id))
            .or_default()
            .extend(std::iter::repeat(kind).take(count));
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.set_latency(latency);
    }

    /// Stores a record as if another client wrote it.
    pub fn put_external(&self, entity_type: &str, record: EntityRecord) {
        self.inner.put_external(entity_type, record);
    }

    /// Returns the stored version of a record.
    pub fn get(&self, entity_type: &str, id: &str) -> Option<EntityRecord> {
        self.inner.get(entity_type, id)
    }

    /// Returns every call received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.log.lock().clone()
    }

    /// Returns the calls that addressed one entity.
    pub fn calls_for(&self, entity_type: &str, id: &str) -> Vec<RemoteCall> {
        let key = EntityKey::new(entity_type, id);
        self.log
            .lock()
            .iter()
            .filter(|call| call.entity == key)
            .cloned()
            .collect()
    }

    /// Position in the log of the first call addressing an entity.
    pub fn first_call(&self, key: &EntityKey) -> Option<usize> {
        self.log.lock().iter().position(|call| &call.entity == key)
    }

    /// Position in the log of the last successful write to an entity.
    pub fn last_write(&self, key: &EntityKey) -> Option<usize> {
        self.log
            .lock()
            .iter()
            .rposition(|call| &call.entity == key && call.is_write())
    }

    /// Highest number of concurrent calls seen for a single entity.
    pub fn max_concurrent_per_entity(&self) -> usize {
        self.inner.max_concurrent_per_entity()
    }

    fn enter(
        &self,
        kind: CallKind,
        entity: EntityKey,
        data: Option<Value>,
    ) -> SyncResult<()> {
        let failed = self
            .script
            .lock()
            .get_mut(&entity)
            .and_then(VecDeque::pop_front);
        self.log.lock().push(RemoteCall {
            kind,
            entity: entity.clone(),
            data,
            failed,
        });
        match failed {
            Some(kind) => Err(SyncError::from_kind(
                kind,
                format!("scripted failure for {entity}"),
            )),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteBackend for ScriptedRemote {
    async fn upsert(&self, entity_type: &str, record: EntityRecord) -> SyncResult<UpsertAck> {
        self.enter(
            CallKind::Upsert,
            EntityKey::new(entity_type, record.id.clone()),
            Some(record.data.clone()),
        )?;
        self.inner.upsert(entity_type, record).await
    }

    async fn soft_delete(&self, entity_type: &str, id: &str) -> SyncResult<()> {
        self.enter(CallKind::Delete, EntityKey::new(entity_type, id), None)?;
        self.inner.soft_delete(entity_type, id).await
    }

    async fn fetch_changed_since(
        &self,
        entity_type: &str,
        since: Timestamp,
    ) -> SyncResult<Vec<EntityRecord>> {
        self.enter(CallKind::FetchChanged, EntityKey::new(entity_type, "*"), None)?;
        self.inner.fetch_changed_since(entity_type, since).await
    }

    async fn fetch(&self, entity_type: &str, id: &str) -> SyncResult<Option<EntityRecord>> {
        self.enter(CallKind::Fetch, EntityKey::new(entity_type, id), None)?;
        self.inner.fetch(entity_type, id).await
    }
}
