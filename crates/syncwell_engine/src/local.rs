//! The application's local storage engine, as seen by the sync engine.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use syncwell_protocol::{EntityKey, EntityRecord, Timestamp};

/// CRUD access to the local store.
///
/// Calls are synchronous: the application's write completes locally before
/// any network work is scheduled.
pub trait LocalStore: Send + Sync {
    /// Reads one record, including soft-deleted ones.
    fn get(&self, entity_type: &str, id: &str) -> SyncResult<Option<EntityRecord>>;

    /// Writes a record and marks it as needing sync.
    fn put(&self, entity_type: &str, record: EntityRecord) -> SyncResult<()>;

    /// Soft-deletes a record and marks it as needing sync.
    fn delete(&self, entity_type: &str, id: &str) -> SyncResult<()>;

    /// Returns records of a type that still need sync.
    fn query_pending(&self, entity_type: &str) -> SyncResult<Vec<EntityRecord>>;

    /// Clears the needs-sync mark on a record.
    fn mark_synced(&self, _entity_type: &str, _id: &str) -> SyncResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LocalState {
    records: BTreeMap<EntityKey, EntityRecord>,
    dirty: BTreeSet<EntityKey>,
}

/// An in-memory [`LocalStore`].
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    state: RwLock<LocalState>,
    fail_writes: AtomicBool,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns live and soft-deleted records of a type.
    pub fn records(&self, entity_type: &str) -> Vec<EntityRecord> {
        self.state
            .read()
            .records
            .iter()
            .filter(|(key, _)| key.entity_type == entity_type)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns true if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::LocalStore("local store rejected write".into()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, entity_type: &str, id: &str) -> SyncResult<Option<EntityRecord>> {
        let key = EntityKey::new(entity_type, id);
        Ok(self.state.read().records.get(&key).cloned())
    }

    fn put(&self, entity_type: &str, record: EntityRecord) -> SyncResult<()> {
        self.check_writable()?;
        let key = EntityKey::new(entity_type, record.id.clone());
        let mut state = self.state.write();
        state.dirty.insert(key.clone());
        state.records.insert(key, record);
        Ok(())
    }

    fn delete(&self, entity_type: &str, id: &str) -> SyncResult<()> {
        self.check_writable()?;
        let key = EntityKey::new(entity_type, id);
        let mut state = self.state.write();
        let Some(record) = state.records.remove(&key) else {
            return Ok(());
        };
        state
            .records
            .insert(key.clone(), record.tombstone(Timestamp::now()));
        state.dirty.insert(key);
        Ok(())
    }

    fn query_pending(&self, entity_type: &str) -> SyncResult<Vec<EntityRecord>> {
        let state = self.state.read();
        Ok(state
            .dirty
            .iter()
            .filter(|key| key.entity_type == entity_type)
            .filter_map(|key| state.records.get(key).cloned())
            .collect())
    }

    fn mark_synced(&self, entity_type: &str, id: &str) -> SyncResult<()> {
        self.state
            .write()
            .dirty
            .remove(&EntityKey::new(entity_type, id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> EntityRecord {
        EntityRecord::new(id, json!({"front": id}), Timestamp::from_millis(1))
    }

    #[test]
    fn put_marks_pending_until_synced() {
        let store = MemoryLocalStore::new();
        store.put("card", record("c1")).unwrap();
        store.put("folder", record("f1")).unwrap();

        assert_eq!(store.query_pending("card").unwrap().len(), 1);
        store.mark_synced("card", "c1").unwrap();
        assert!(store.query_pending("card").unwrap().is_empty());
        assert!(store.get("card", "c1").unwrap().is_some());
    }

    #[test]
    fn delete_leaves_tombstone() {
        let store = MemoryLocalStore::new();
        store.put("card", record("c1")).unwrap();
        store.mark_synced("card", "c1").unwrap();
        store.delete("card", "c1").unwrap();

        let stored = store.get("card", "c1").unwrap().unwrap();
        assert!(stored.deleted);
        assert_eq!(store.query_pending("card").unwrap().len(), 1);
    }

    #[test]
    fn delete_of_missing_record_is_noop() {
        let store = MemoryLocalStore::new();
        store.delete("card", "nope").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn failing_writes_surface_as_local_store_errors() {
        let store = MemoryLocalStore::new();
        store.set_fail_writes(true);
        let err = store.put("card", record("c1")).unwrap_err();
        assert!(matches!(err, SyncError::LocalStore(_)));
        assert!(store.is_empty());
    }
}
