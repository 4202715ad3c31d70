//! Error types for the operation record store.

use std::io;
use syncwell_protocol::{CodecError, OperationStatus};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the operation record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A log file is corrupted.
    #[error("log corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the bad frame.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// A record was not found.
    #[error("{what} not found: {id}")]
    NotFound {
        /// Record type.
        what: &'static str,
        /// Record id.
        id: String,
    },

    /// A status change was rejected.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Operation id.
        id: String,
        /// Current status.
        from: OperationStatus,
        /// Requested status.
        to: OperationStatus,
    },

    /// A second active conflict was recorded for the same entity.
    #[error("entity {entity} already has an active conflict")]
    ActiveConflictExists {
        /// Entity as `type:id`.
        entity: String,
    },

    /// A terminal record was modified.
    #[error("{what} {id} is terminal and cannot change")]
    Immutable {
        /// Record type.
        what: &'static str,
        /// Record id.
        id: String,
    },

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }
}
