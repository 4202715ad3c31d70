//! # Syncwell Store
//!
//! Durable storage for the Syncwell sync engine.
//!
//! Operations, archived operation ids, conflicts, and error records are
//! kept in append-only framed logs (one per record type) and replayed into
//! memory on open. The store provides:
//!
//! - atomic, checksummed record writes with torn-tail recovery
//! - indexes by status (in dispatch order) and by entity
//! - a two-tier write gate that admits application writes ahead of sync
//!   writes
//! - archiving, retention purges, compaction, and verification
//! - an advisory `LOCK` file so one process owns a store directory

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod dir;
mod error;
mod frame;
mod gate;
mod store;
mod table;

pub use backend::{FileLog, LogBackend, MemoryLog};
pub use config::StoreConfig;
pub use dir::StoreDir;
pub use error::{StoreError, StoreResult};
pub use frame::{compute_crc32, FrameType, FRAME_MAGIC, FRAME_VERSION};
pub use gate::{GatePermit, GateStats, WriteGate, WriteOrigin};
pub use store::{
    ArchivedOperation, CompactSummary, MemoryLogs, OpenReport, OperationStore, PurgeReport,
    StatusCounts, StoreStats, StoreVerifyReport,
};
pub use table::{CompactReport, ReplayReport, Row, Table, VerifyReport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
