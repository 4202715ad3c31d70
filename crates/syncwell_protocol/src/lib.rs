//! # Syncwell Protocol
//!
//! Data model shared by every Syncwell crate.
//!
//! This crate provides:
//! - [`Operation`] and [`NewOperation`], the queued unit of sync work
//! - [`Conflict`] for local/remote divergence on a single entity
//! - [`ErrorRecord`], the captured diagnostic for a failure during sync
//! - [`RetryAttempt`] and the network/strategy vocabulary used for retries
//! - CBOR encoding/decoding and content digests
//!
//! This is a pure data crate with no I/O operations. Records reference each
//! other by id only; nothing embeds a live entity or another record.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod error;
mod error_record;
mod ids;
mod operation;
mod record;
mod retry;
mod time;

pub use codec::{content_digest, from_cbor, to_cbor};
pub use conflict::{Conflict, ConflictKind, ConflictResolution, ResolutionChoice};
pub use error::{CodecError, CodecResult};
pub use error_record::{ErrorKind, ErrorRecord, ErrorStatus, IsolationLevel, Severity};
pub use ids::{ConflictId, EntityKey, ErrorId, OperationId};
pub use operation::{
    NewOperation, Operation, OperationKind, OperationStatus, ParkReason, Priority,
};
pub use record::EntityRecord;
pub use retry::{AttemptOutcome, NetworkTier, RetryAttempt, RetryStrategy};
pub use time::Timestamp;
