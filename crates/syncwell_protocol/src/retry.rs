//! Retry vocabulary: strategies, link tiers and attempt history entries.

use crate::error_record::{ErrorKind, Severity};
use crate::ids::OperationId;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Constant base delay.
    Fixed,
    /// `base * multiplier^(attempt - 1)`, capped.
    Exponential,
    /// Exponential, scaled by error category and severity.
    #[default]
    Adaptive,
}

impl RetryStrategy {
    /// Returns the lowercase name of this strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of current link quality.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTier {
    /// No hints available.
    #[default]
    Unknown,
    /// Very slow or lossy.
    Poor,
    /// Usable but slow.
    Fair,
    /// Normal broadband or 4G.
    Good,
    /// Fast, low latency.
    Excellent,
}

impl NetworkTier {
    /// Returns the lowercase name of this tier.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkTier::Unknown => "unknown",
            NetworkTier::Poor => "poor",
            NetworkTier::Fair => "fair",
            NetworkTier::Good => "good",
            NetworkTier::Excellent => "excellent",
        }
    }
}

impl fmt::Display for NetworkTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The attempt succeeded.
    Succeeded,
    /// The attempt failed and another one was scheduled.
    Retrying,
    /// The attempt failed and the sequence ended.
    GaveUp,
    /// The sequence was cancelled while waiting.
    Cancelled,
}

/// One entry of a retry history. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Operation the attempt belongs to, if any.
    pub operation_id: Option<OperationId>,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Delay scheduled after this attempt, in milliseconds.
    pub delay_ms: u64,
    /// Link tier observed when the delay was computed.
    pub network_tier: NetworkTier,
    /// Strategy in effect.
    pub strategy: RetryStrategy,
    /// Category of the failure, if the attempt failed.
    pub category: Option<ErrorKind>,
    /// Severity of the failure, if known.
    pub severity: Option<Severity>,
    /// Outcome.
    pub outcome: AttemptOutcome,
    /// When the attempt finished.
    pub at: Timestamp,
}
