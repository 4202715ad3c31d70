//! The remote backend client, as seen by the sync engine.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use syncwell_protocol::{EntityKey, EntityRecord, ErrorKind, Timestamp};

/// Acknowledgement of a remote write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertAck {
    /// Id under which the record is stored remotely.
    pub id: String,
    /// Remote last-modified time after the write.
    pub updated_at: Timestamp,
}

/// Per-entity access to the remote store.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Creates or replaces a record.
    async fn upsert(&self, entity_type: &str, record: EntityRecord) -> SyncResult<UpsertAck>;

    /// Marks a record deleted.
    async fn soft_delete(&self, entity_type: &str, id: &str) -> SyncResult<()>;

    /// Returns records of a type modified after `since`, tombstones
    /// included.
    async fn fetch_changed_since(
        &self,
        entity_type: &str,
        since: Timestamp,
    ) -> SyncResult<Vec<EntityRecord>>;

    /// Creates or replaces several records of one type.
    ///
    /// Backends with a bulk endpoint override this; the default sends one
    /// upsert per record and stops at the first failure.
    async fn upsert_batch(
        &self,
        entity_type: &str,
        records: Vec<EntityRecord>,
    ) -> SyncResult<Vec<UpsertAck>> {
        let mut acks = Vec::with_capacity(records.len());
        for record in records {
            acks.push(self.upsert(entity_type, record).await?);
        }
        Ok(acks)
    }

    /// Returns the current remote version of one record.
    async fn fetch(&self, entity_type: &str, id: &str) -> SyncResult<Option<EntityRecord>> {
        let all = self
            .fetch_changed_since(entity_type, Timestamp::from_millis(0))
            .await?;
        Ok(all.into_iter().find(|record| record.id == id))
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    records: BTreeMap<EntityKey, EntityRecord>,
    failures: VecDeque<ErrorKind>,
    clock: u64,
    calls: RemoteCalls,
    active: HashMap<EntityKey, usize>,
    active_total: usize,
    max_active_per_entity: usize,
    max_active_total: usize,
}

/// Call counters of a [`MemoryRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCalls {
    /// `upsert` calls, failed ones included.
    pub upserts: usize,
    /// `soft_delete` calls.
    pub deletes: usize,
    /// `fetch` and `fetch_changed_since` calls.
    pub fetches: usize,
}

/// An in-memory [`RemoteBackend`] with scripted failures and latency.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryRemote {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record as if another client wrote it.
    pub fn put_external(&self, entity_type: &str, record: EntityRecord) {
        let mut state = self.state.lock();
        state.clock = state.clock.max(record.updated_at.as_millis());
        state
            .records
            .insert(EntityKey::new(entity_type, record.id.clone()), record);
    }

    /// Makes the next `count` calls fail with an error of `kind`.
    pub fn fail_next(&self, count: usize, kind: ErrorKind) {
        let mut state = self.state.lock();
        state.failures.extend(std::iter::repeat(kind).take(count));
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Returns the stored version of a record.
    pub fn get(&self, entity_type: &str, id: &str) -> Option<EntityRecord> {
        self.state
            .lock()
            .records
            .get(&EntityKey::new(entity_type, id))
            .cloned()
    }

    /// Returns every stored record of a type.
    pub fn records(&self, entity_type: &str) -> Vec<EntityRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|(key, _)| key.entity_type == entity_type)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Returns call counters.
    pub fn calls(&self) -> RemoteCalls {
        self.state.lock().calls
    }

    /// Highest number of concurrent calls seen for a single entity.
    pub fn max_concurrent_per_entity(&self) -> usize {
        self.state.lock().max_active_per_entity
    }

    /// Highest number of concurrent calls seen overall.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_active_total
    }

    async fn enter(&self, key: EntityKey) -> SyncResult<CallGuard<'_>> {
        {
            let mut state = self.state.lock();
            let count = state.active.entry(key.clone()).or_insert(0);
            *count += 1;
            let count = *count;
            state.active_total += 1;
            state.max_active_per_entity = state.max_active_per_entity.max(count);
            state.max_active_total = state.max_active_total.max(state.active_total);
        }
        let guard = CallGuard { remote: self, key };

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self.state.lock().failures.pop_front();
        match failure {
            Some(kind) => Err(SyncError::from_kind(kind, "scripted remote failure")),
            None => Ok(guard),
        }
    }
}

struct CallGuard<'a> {
    remote: &'a MemoryRemote,
    key: EntityKey,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.remote.state.lock();
        if let Some(count) = state.active.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                state.active.remove(&self.key);
            }
        }
        state.active_total = state.active_total.saturating_sub(1);
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn upsert(&self, entity_type: &str, mut record: EntityRecord) -> SyncResult<UpsertAck> {
        self.state.lock().calls.upserts += 1;
        let key = EntityKey::new(entity_type, record.id.clone());
        let _guard = self.enter(key.clone()).await?;

        let mut state = self.state.lock();
        state.clock = state.clock.max(Timestamp::now().as_millis()) + 1;
        record.updated_at = Timestamp::from_millis(state.clock);
        record.deleted = false;
        let ack = UpsertAck {
            id: record.id.clone(),
            updated_at: record.updated_at,
        };
        state.records.insert(key, record);
        Ok(ack)
    }

    async fn soft_delete(&self, entity_type: &str, id: &str) -> SyncResult<()> {
        self.state.lock().calls.deletes += 1;
        let key = EntityKey::new(entity_type, id);
        let _guard = self.enter(key.clone()).await?;

        let mut state = self.state.lock();
        state.clock = state.clock.max(Timestamp::now().as_millis()) + 1;
        let at = Timestamp::from_millis(state.clock);
        if let Some(record) = state.records.remove(&key) {
            state.records.insert(key, record.tombstone(at));
        }
        Ok(())
    }

    async fn fetch_changed_since(
        &self,
        entity_type: &str,
        since: Timestamp,
    ) -> SyncResult<Vec<EntityRecord>> {
        self.state.lock().calls.fetches += 1;
        let _guard = self.enter(EntityKey::new(entity_type, "*")).await?;
        Ok(self
            .records(entity_type)
            .into_iter()
            .filter(|record| record.updated_at > since)
            .collect())
    }

    async fn fetch(&self, entity_type: &str, id: &str) -> SyncResult<Option<EntityRecord>> {
        self.state.lock().calls.fetches += 1;
        let _guard = self.enter(EntityKey::new(entity_type, id)).await?;
        Ok(self.get(entity_type, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, at: u64) -> EntityRecord {
        EntityRecord::new(id, json!({"front": id}), Timestamp::from_millis(at))
    }

    #[tokio::test]
    async fn upsert_assigns_newer_timestamp() {
        let remote = MemoryRemote::new();
        remote.put_external("card", record("c1", 5));
        let ack = remote.upsert("card", record("c1", 1)).await.unwrap();
        assert!(ack.updated_at > Timestamp::from_millis(5));
        assert_eq!(remote.get("card", "c1").unwrap().updated_at, ack.updated_at);
    }

    #[tokio::test]
    async fn soft_delete_leaves_tombstone() {
        let remote = MemoryRemote::new();
        remote.put_external("card", record("c1", 5));
        remote.soft_delete("card", "c1").await.unwrap();
        assert!(remote.get("card", "c1").unwrap().deleted);

        remote.soft_delete("card", "missing").await.unwrap();
        assert!(remote.get("card", "missing").is_none());
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let remote = MemoryRemote::new();
        remote.fail_next(2, ErrorKind::Network);

        assert!(matches!(
            remote.fetch("card", "c1").await,
            Err(SyncError::Network(_))
        ));
        assert!(remote.upsert("card", record("c1", 1)).await.is_err());
        assert!(remote.upsert("card", record("c1", 1)).await.is_ok());
        assert_eq!(
            remote.calls(),
            RemoteCalls {
                upserts: 2,
                deletes: 0,
                fetches: 1
            }
        );
    }

    #[tokio::test]
    async fn fetch_changed_since_filters_by_time() {
        let remote = MemoryRemote::new();
        remote.put_external("card", record("c1", 5));
        remote.put_external("card", record("c2", 9));
        remote.put_external("tag", record("t1", 9));

        let changed = remote
            .fetch_changed_since("card", Timestamp::from_millis(6))
            .await
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "c2");
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_concurrency() {
        let remote = MemoryRemote::new();
        remote.set_latency(Some(Duration::from_millis(50)));
        let (a, b, c) = tokio::join!(
            remote.upsert("card", record("c1", 1)),
            remote.upsert("card", record("c1", 1)),
            remote.upsert("card", record("c2", 1)),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(remote.max_concurrent_per_entity(), 2);
        assert_eq!(remote.max_concurrent(), 3);
    }
}
