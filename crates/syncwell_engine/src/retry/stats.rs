//! Aggregate retry statistics.

use serde::Serialize;
use std::collections::BTreeMap;
use syncwell_protocol::{ErrorKind, NetworkTier, RetryStrategy};

/// Counters for one group of retry sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RetryBucket {
    /// Sequences finished.
    pub sequences: u64,
    /// Sequences that ended in success.
    pub succeeded: u64,
    /// Attempts made across all sequences.
    pub attempts: u64,
    /// Delays scheduled across all sequences.
    pub delays: u64,
    /// Sum of scheduled delays in milliseconds.
    pub delay_ms: u64,
}

impl RetryBucket {
    fn record(&mut self, outcome: &SequenceOutcome) {
        self.sequences += 1;
        self.succeeded += u64::from(outcome.succeeded);
        self.attempts += u64::from(outcome.attempts);
        self.delays += u64::from(outcome.delays);
        self.delay_ms += outcome.delay_ms;
    }

    /// Fraction of sequences that succeeded.
    pub fn success_rate(&self) -> f64 {
        ratio(self.succeeded, self.sequences)
    }

    /// Mean attempts per sequence.
    pub fn average_attempts(&self) -> f64 {
        ratio(self.attempts, self.sequences)
    }

    /// Mean scheduled delay in milliseconds.
    pub fn average_delay_ms(&self) -> f64 {
        ratio(self.delay_ms, self.delays)
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Summary of one finished retry sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceOutcome {
    /// Strategy in effect.
    pub strategy: RetryStrategy,
    /// Category of the last failure, if any attempt failed.
    pub category: Option<ErrorKind>,
    /// Link tier when the sequence ended.
    pub tier: NetworkTier,
    /// Attempts made.
    pub attempts: u32,
    /// Delays scheduled.
    pub delays: u32,
    /// Sum of scheduled delays in milliseconds.
    pub delay_ms: u64,
    /// Whether the last attempt succeeded.
    pub succeeded: bool,
}

/// Retry statistics grouped by strategy, error category, and link tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    /// All sequences.
    pub overall: RetryBucket,
    /// Keyed by strategy name.
    pub by_strategy: BTreeMap<String, RetryBucket>,
    /// Keyed by error category name. Sequences without a failure are not
    /// counted here.
    pub by_category: BTreeMap<String, RetryBucket>,
    /// Keyed by link tier name.
    pub by_tier: BTreeMap<String, RetryBucket>,
}

impl RetryStats {
    /// Adds a finished sequence.
    pub fn record(&mut self, outcome: &SequenceOutcome) {
        self.overall.record(outcome);
        self.by_strategy
            .entry(outcome.strategy.as_str().to_string())
            .or_default()
            .record(outcome);
        if let Some(category) = outcome.category {
            self.by_category
                .entry(category.as_str().to_string())
                .or_default()
                .record(outcome);
        }
        self.by_tier
            .entry(outcome.tier.as_str().to_string())
            .or_default()
            .record(outcome);
    }
}
