//! Test fixtures and engine helpers.
//!
//! Provides a sync manager wired to in-memory collaborators, over either
//! an in-memory store or a store in a temporary directory.

use crate::remote::ScriptedRemote;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use syncwell_engine::{
    IsolationConfig, MemoryLocalStore, OfflineManager, RetryConfig, SyncConfig,
};
use syncwell_protocol::{NewOperation, Operation, OperationId};
use syncwell_store::{OpenReport, OperationStore, StoreConfig};
use tempfile::TempDir;

/// Entity type used by the fixtures.
pub const CARD: &str = "card";

/// Configuration for deterministic tests.
///
/// Flushes run only when the test asks for one, retry delays are short and
/// unjittered, and isolated errors are not recovered automatically.
pub fn test_config() -> SyncConfig {
    SyncConfig::new()
        .with_auto_flush(false)
        .with_retry(
            RetryConfig::new(3)
                .with_base_delay(Duration::from_millis(100))
                .with_jitter(0.0),
        )
        .with_isolation(IsolationConfig::default().with_auto_recover(false))
}

/// A create request for a card with one `title` field.
pub fn card(id: &str, title: &str) -> NewOperation {
    NewOperation::create_with_id(CARD, id, json!({ "title": title }))
}

/// An update request for a card.
pub fn card_update(id: &str, payload: Value) -> NewOperation {
    NewOperation::update(CARD, id, payload)
}

/// A sync manager with in-memory collaborators and automatic cleanup.
pub struct TestEngine {
    /// The manager under test.
    pub manager: Arc<OfflineManager>,
    /// The operation store behind the manager.
    pub store: Arc<OperationStore>,
    /// The application's local store.
    pub local: Arc<MemoryLocalStore>,
    /// The remote backend.
    pub remote: Arc<ScriptedRemote>,
    config: SyncConfig,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an engine over an in-memory store.
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Creates an engine over an in-memory store with `config`.
    pub fn memory_with(config: SyncConfig) -> Self {
        let store = Arc::new(OperationStore::in_memory().expect("Failed to open in-memory store"));
        Self::assemble(
            config,
            store,
            Arc::new(MemoryLocalStore::new()),
            Arc::new(ScriptedRemote::new()),
            None,
        )
    }

    /// Creates an engine over a store in a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let (store, _) = open_store(temp_dir.path());
        Self::assemble(
            test_config(),
            Arc::new(store),
            Arc::new(MemoryLocalStore::new()),
            Arc::new(ScriptedRemote::new()),
            Some(temp_dir),
        )
    }

    fn assemble(
        config: SyncConfig,
        store: Arc<OperationStore>,
        local: Arc<MemoryLocalStore>,
        remote: Arc<ScriptedRemote>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let manager = OfflineManager::new(
            config.clone(),
            Arc::clone(&store),
            local.clone(),
            remote.clone(),
        );
        Self {
            manager: Arc::new(manager),
            store,
            local,
            remote,
            config,
            temp_dir,
        }
    }

    /// Returns the store directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Simulates an application restart.
    ///
    /// The manager is shut down and the store closed, then both are opened
    /// again over the same directory. The local store and the remote
    /// backend survive the restart.
    ///
    /// # Panics
    ///
    /// Panics for in-memory engines, or if background work still holds the
    /// store.
    pub fn restart(self) -> (Self, OpenReport) {
        let Self {
            manager,
            store,
            local,
            remote,
            config,
            temp_dir,
        } = self;
        let temp_dir = temp_dir.expect("Only file-based engines can restart");

        manager.shutdown();
        drop(manager);
        assert_eq!(
            Arc::strong_count(&store),
            1,
            "store still referenced after shutdown"
        );
        drop(store);

        let (store, report) = open_store(temp_dir.path());
        let engine = Self::assemble(config, Arc::new(store), local, remote, Some(temp_dir));
        (engine, report)
    }

    /// Submits a request and returns the queued operation.
    pub fn execute(&self, request: NewOperation) -> Operation {
        self.manager
            .execute(request)
            .expect("Failed to execute request")
    }

    /// Returns the stored copy of an operation.
    pub fn operation(&self, id: &OperationId) -> Operation {
        self.manager
            .operation(id)
            .expect("Operation missing from the store")
    }
}

fn open_store(path: &Path) -> (OperationStore, OpenReport) {
    OperationStore::open(path, StoreConfig::new().sync_on_write(false))
        .expect("Failed to open store")
}

/// Runs a test with an in-memory engine.
///
/// # Example
///
/// ```rust,ignore
/// use syncwell_testkit::{card, with_engine};
///
/// #[test]
/// fn my_test() {
///     with_engine(|engine| {
///         engine.execute(card("c1", "a"));
///     });
/// }
/// ```
pub fn with_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::memory();
    f(&engine)
}

/// A current-thread runtime with paused time, for driving the engine from
/// inside synchronous test harnesses such as proptest.
pub fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("Failed to build runtime")
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncwell_protocol::OperationStatus;

    #[test]
    fn memory_engine_queues_offline() {
        with_engine(|engine| {
            let op = engine.execute(card("c1", "a"));
            assert_eq!(engine.operation(&op.id).status, OperationStatus::Pending);
            assert!(engine.path().is_none());
        });
    }

    #[test]
    fn file_engine_survives_restart() {
        let engine = TestEngine::file();
        let op = engine.execute(card("c1", "a"));
        assert!(engine.path().unwrap().exists());

        let (engine, report) = engine.restart();

        assert_eq!(report.requeued, 0);
        let restored = engine.operation(&op.id);
        assert_eq!(restored.payload, json!({ "title": "a" }));
        assert_eq!(restored.status, OperationStatus::Pending);
    }
}
