//! # Syncwell Engine
//!
//! Offline-first sync engine.
//!
//! Application writes land in a local store first and are queued as
//! operations in a durable [`OperationStore`](syncwell_store::OperationStore).
//! The [`OfflineManager`] flushes the queue against a [`RemoteBackend`]
//! whenever the link is up, and:
//!
//! - detects and resolves conflicts between local edits and remote copies
//! - retries failures with adaptive, network-aware backoff
//! - captures every failure as an error record, contains it, and runs a
//!   recovery strategy
//! - publishes typed [`SyncEvent`]s to subscribers
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use syncwell_engine::{MemoryLocalStore, MemoryRemote, OfflineManager, SyncConfig};
//! use syncwell_protocol::NewOperation;
//! use syncwell_store::OperationStore;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(OperationStore::in_memory()?);
//! let manager = OfflineManager::new(
//!     SyncConfig::default(),
//!     store,
//!     Arc::new(MemoryLocalStore::new()),
//!     Arc::new(MemoryRemote::new()),
//! );
//!
//! manager.execute(NewOperation::create_with_id("card", "c1", json!({ "title": "hello" })))?;
//! manager.set_online(true);
//! manager.settle().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod conflict;
mod error;
mod events;
pub mod isolation;
mod local;
mod network;
mod offline;
mod remote;
pub mod retry;

pub use config::{ConflictConfig, IsolationConfig, NetworkConfig, RetryConfig, SyncConfig};
pub use conflict::{ConflictResolver, Detection, Verdict};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, Subscription, SyncEvent};
pub use isolation::{
    BackgroundService, ErrorFilter, ErrorIsolator, FlagService, RecoveryAction, RecoveryReport,
    RecoveryStrategy,
};
pub use local::{LocalStore, MemoryLocalStore};
pub use network::{
    classify_tier, LinkHints, NetworkChange, NetworkMonitor, NetworkSnapshot, NetworkStatus,
};
pub use offline::{
    select_ready, ConflictOutcome, FlushSummary, Hold, OfflineManager, SyncStats, SyncStatus,
};
pub use remote::{MemoryRemote, RemoteBackend, RemoteCalls, UpsertAck};
pub use retry::{
    FailureContext, RetryConditions, RetryDecision, RetryInterrupt, RetryManager, RetryStats,
    StopReason,
};
