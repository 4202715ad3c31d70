//! The offline manager and its flush worker.
//!
//! [`OfflineManager`] accepts application writes, persists them as queued
//! operations, and drains the queue against the remote backend while the
//! link is up. At most one flush cycle runs at a time; inside a cycle,
//! independent operations are dispatched concurrently up to the configured
//! limit, never two for the same entity.

mod engine;
mod flush;
mod manager;
mod recovery;
mod scheduler;
mod stats;

pub use manager::{ConflictOutcome, OfflineManager};
pub use scheduler::{select_ready, Hold};
pub use stats::{FlushSummary, SyncStats, SyncStatus};
