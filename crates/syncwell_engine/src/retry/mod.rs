//! Retry policy and retry sequences.

mod conditions;
mod manager;
mod policy;
mod stats;

pub use conditions::{RetryConditions, RetryPredicate};
pub use manager::{
    RetryDecision, RetryFailure, RetryInterrupt, RetryManager, RetrySequence, StopReason,
};
pub use policy::{base_delay, compute_delay, explicit_severity, jitter, FailureContext};
pub use stats::{RetryBucket, RetryStats, SequenceOutcome};
