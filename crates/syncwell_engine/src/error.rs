//! Error types for the sync engine.

use crate::isolation::classify_message;
use std::time::Duration;
use syncwell_protocol::{ConflictId, ErrorKind, OperationId};
use syncwell_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Every variant maps to one [`ErrorKind`]. Only [`SyncError::External`]
/// is classified from its message text.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport failure talking to the remote backend.
    #[error("network error: {0}")]
    Network(String),

    /// No connectivity.
    #[error("not connected")]
    Offline,

    /// A remote call exceeded its deadline.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend asked us to slow down.
    #[error("rate limited by remote backend")]
    RateLimited {
        /// Server-suggested wait, if any.
        retry_after: Option<Duration>,
    },

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The backend or the engine rejected the input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The remote copy diverged and could not be reconciled automatically.
    #[error("conflict on {entity}: {message}")]
    Conflict {
        /// Entity as `type:id`.
        entity: String,
        /// Description.
        message: String,
    },

    /// Stored data violates an invariant.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Incompatible schema or protocol version.
    #[error("version mismatch: {0}")]
    Version(String),

    /// The application's local store failed.
    #[error("local store error: {0}")]
    LocalStore(String),

    /// The operation record store failed.
    #[error("operation store error: {0}")]
    Store(#[from] StoreError),

    /// A declared dependency does not exist.
    #[error("dependency {0} does not exist")]
    DependencyNotFound(OperationId),

    /// A declared dependency is parked and cannot complete.
    #[error("dependency {0} is isolated")]
    DependencyIsolated(OperationId),

    /// Unknown operation.
    #[error("operation {0} not found")]
    OperationNotFound(OperationId),

    /// Unknown conflict.
    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),

    /// The request does not fit the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A retry sequence was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Sync is disabled by strict isolation.
    #[error("sync unavailable: {0}")]
    Unavailable(String),

    /// Failure reported by an uncontrolled dependency.
    #[error("{0}")]
    External(String),
}

impl SyncError {
    /// Creates an error of the given kind with a message.
    ///
    /// Used by backends that only know a category.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Network => Self::Network(message),
            ErrorKind::Database => Self::LocalStore(message),
            ErrorKind::Conflict => Self::Conflict {
                entity: String::new(),
                message,
            },
            ErrorKind::Validation => Self::Validation(message),
            ErrorKind::Timeout => Self::Timeout(Duration::ZERO),
            ErrorKind::Authentication => Self::Authentication(message),
            ErrorKind::RateLimit => Self::RateLimited { retry_after: None },
            ErrorKind::Integrity => Self::Integrity(message),
            ErrorKind::Version => Self::Version(message),
            ErrorKind::Unknown => Self::External(message),
        }
    }

    /// Returns the error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) | SyncError::Offline => ErrorKind::Network,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::RateLimited { .. } => ErrorKind::RateLimit,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::Validation(_)
            | SyncError::DependencyNotFound(_)
            | SyncError::DependencyIsolated(_)
            | SyncError::OperationNotFound(_)
            | SyncError::ConflictNotFound(_)
            | SyncError::InvalidState(_) => ErrorKind::Validation,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Integrity(_) => ErrorKind::Integrity,
            SyncError::Version(_) => ErrorKind::Version,
            SyncError::LocalStore(_) => ErrorKind::Database,
            SyncError::Store(StoreError::Corrupted { .. }) => ErrorKind::Integrity,
            SyncError::Store(_) => ErrorKind::Database,
            SyncError::Cancelled | SyncError::Unavailable(_) => ErrorKind::Unknown,
            SyncError::External(message) => classify_message(message),
        }
    }

    /// Returns true if this error can be retried.
    ///
    /// Integrity failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_)
            | SyncError::Offline
            | SyncError::Timeout(_)
            | SyncError::RateLimited { .. }
            | SyncError::LocalStore(_) => true,
            SyncError::Store(StoreError::Io(_)) => true,
            SyncError::External(_) => matches!(
                self.kind(),
                ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Unknown
            ),
            _ => false,
        }
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Network("connection reset".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(SyncError::RateLimited { retry_after: None }.is_retryable());
        assert!(!SyncError::Validation("missing field".into()).is_retryable());
        assert!(!SyncError::Integrity("hash mismatch".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn variants_carry_their_kind() {
        assert_eq!(SyncError::Offline.kind(), ErrorKind::Network);
        assert_eq!(
            SyncError::Store(StoreError::corrupted(8, "bad crc")).kind(),
            ErrorKind::Integrity
        );
        assert_eq!(SyncError::Store(StoreError::Locked).kind(), ErrorKind::Database);
        assert_eq!(
            SyncError::DependencyNotFound(OperationId::new()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn external_errors_are_classified_by_text() {
        let err = SyncError::External("upstream request timed out".into());
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());

        let err = SyncError::External("401 Unauthorized".into());
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(!err.is_retryable());
    }

    #[test]
    fn from_kind_round_trips_category() {
        for kind in ErrorKind::ALL {
            assert_eq!(SyncError::from_kind(kind, "x").kind(), kind, "{kind}");
        }
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::Offline.to_string(), "not connected");
        let err = SyncError::Conflict {
            entity: "card:c1".into(),
            message: "needs manual resolution".into(),
        };
        assert!(err.to_string().contains("card:c1"));
    }
}
