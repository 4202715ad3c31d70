//! Configuration for the sync engine.

use std::collections::BTreeMap;
use std::time::Duration;
use syncwell_protocol::{ErrorKind, IsolationLevel, NetworkTier, RetryStrategy, Severity};

/// Configuration for the offline manager and its flush worker.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Operations dispatched concurrently within one flush cycle.
    pub max_concurrency: usize,
    /// Deadline for every remote call.
    pub remote_timeout: Duration,
    /// Ready operations selected per scheduling round.
    pub flush_batch_size: usize,
    /// Retry budget for operations that don't set one.
    pub default_max_retries: u32,
    /// How long failed or parked operations, resolved conflicts, and
    /// finished errors are kept.
    pub failed_retention: Duration,
    /// Whether completed operations are archived after each flush.
    pub archive_completed: bool,
    /// Whether reconnecting, or queueing while connected, starts a flush.
    pub auto_flush: bool,
    /// Whether failed operations get a fresh budget on reconnect.
    pub reset_failed_on_reconnect: bool,
    /// Per-request overhead used to estimate bandwidth saved by batching.
    pub request_overhead_bytes: u64,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Conflict configuration.
    pub conflict: ConflictConfig,
    /// Isolation configuration.
    pub isolation: IsolationConfig,
    /// Link classification thresholds.
    pub network: NetworkConfig,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_concurrency: 4,
            remote_timeout: Duration::from_secs(30),
            flush_batch_size: 50,
            default_max_retries: 3,
            failed_retention: Duration::from_secs(7 * 24 * 3600),
            archive_completed: true,
            auto_flush: true,
            reset_failed_on_reconnect: false,
            request_overhead_bytes: 512,
            retry: RetryConfig::default(),
            conflict: ConflictConfig::default(),
            isolation: IsolationConfig::default(),
            network: NetworkConfig::default(),
        }
    }

    /// Sets the dispatch concurrency limit (at least 1).
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// Sets the remote call timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Sets the scheduling batch size (at least 1).
    pub fn with_flush_batch_size(mut self, size: usize) -> Self {
        self.flush_batch_size = size.max(1);
        self
    }

    /// Sets the default retry budget.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Sets the retention window.
    pub fn with_failed_retention(mut self, retention: Duration) -> Self {
        self.failed_retention = retention;
        self
    }

    /// Sets whether completed operations are archived.
    pub fn with_archive_completed(mut self, archive: bool) -> Self {
        self.archive_completed = archive;
        self
    }

    /// Sets whether flushes start on their own.
    pub fn with_auto_flush(mut self, enabled: bool) -> Self {
        self.auto_flush = enabled;
        self
    }

    /// Sets whether reconnecting resets failed operations.
    pub fn with_reset_failed_on_reconnect(mut self, enabled: bool) -> Self {
        self.reset_failed_on_reconnect = enabled;
        self
    }

    /// Sets the per-request overhead estimate.
    pub fn with_request_overhead(mut self, bytes: u64) -> Self {
        self.request_overhead_bytes = bytes;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the conflict configuration.
    pub fn with_conflict(mut self, conflict: ConflictConfig) -> Self {
        self.conflict = conflict;
        self
    }

    /// Sets the isolation configuration.
    pub fn with_isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sets the link classification thresholds.
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// How delays grow between attempts.
    pub strategy: RetryStrategy,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any delay before jitter.
    pub max_delay: Duration,
    /// Growth factor for exponential and adaptive strategies.
    pub multiplier: f64,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Jitter ratio; 0.1 means ±10%.
    pub jitter: f64,
    /// Whether the link tier scales delays.
    pub network_aware: bool,
    /// Adaptive scaling per error category. Missing categories scale by 1.
    pub category_multipliers: BTreeMap<ErrorKind, f64>,
    /// Adaptive scaling per severity. Missing severities scale by 1.
    pub severity_multipliers: BTreeMap<Severity, f64>,
    /// Scaling per link tier. Missing tiers scale by 1.
    pub tier_multipliers: BTreeMap<NetworkTier, f64>,
    /// Attempts kept per operation in the retry history.
    pub history_limit: usize,
}

impl RetryConfig {
    /// Creates a configuration with `max_retries` retries and default
    /// multiplier tables.
    pub fn new(max_retries: u32) -> Self {
        Self {
            strategy: RetryStrategy::Adaptive,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_retries,
            jitter: 0.1,
            network_aware: true,
            category_multipliers: BTreeMap::from([
                (ErrorKind::RateLimit, 2.0),
                (ErrorKind::Network, 1.5),
                (ErrorKind::Timeout, 1.2),
            ]),
            severity_multipliers: BTreeMap::from([
                (Severity::Critical, 3.0),
                (Severity::High, 2.0),
                (Severity::Medium, 1.5),
            ]),
            tier_multipliers: BTreeMap::from([
                (NetworkTier::Poor, 3.0),
                (NetworkTier::Fair, 2.5),
                (NetworkTier::Good, 1.5),
                (NetworkTier::Excellent, 1.1),
            ]),
            history_limit: 50,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self::new(0)
            .with_base_delay(Duration::ZERO)
            .with_jitter(0.0)
    }

    /// Sets the strategy.
    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor. Values below 1 are treated as 1.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the jitter ratio, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// Sets whether the link tier scales delays.
    pub fn with_network_aware(mut self, enabled: bool) -> Self {
        self.network_aware = enabled;
        self
    }

    /// Overrides the multiplier for one error category.
    pub fn with_category_multiplier(mut self, kind: ErrorKind, factor: f64) -> Self {
        self.category_multipliers.insert(kind, factor.max(0.0));
        self
    }

    /// Overrides the multiplier for one severity.
    pub fn with_severity_multiplier(mut self, severity: Severity, factor: f64) -> Self {
        self.severity_multipliers.insert(severity, factor.max(0.0));
        self
    }

    /// Overrides the multiplier for one link tier.
    pub fn with_tier_multiplier(mut self, tier: NetworkTier, factor: f64) -> Self {
        self.tier_multipliers.insert(tier, factor.max(0.0));
        self
    }

    /// Sets how many attempts are kept per operation.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Multiplier for an error category.
    pub fn category_multiplier(&self, kind: ErrorKind) -> f64 {
        self.category_multipliers.get(&kind).copied().unwrap_or(1.0)
    }

    /// Multiplier for a severity.
    pub fn severity_multiplier(&self, severity: Severity) -> f64 {
        self.severity_multipliers.get(&severity).copied().unwrap_or(1.0)
    }

    /// Multiplier for a link tier.
    pub fn tier_multiplier(&self, tier: NetworkTier) -> f64 {
        self.tier_multipliers.get(&tier).copied().unwrap_or(1.0)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for conflict resolution.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Similarity above which a simultaneous edit is resolved by timestamp
    /// instead of being deferred to the application.
    pub similarity_threshold: f64,
}

impl ConflictConfig {
    /// Sets the similarity threshold, clamped to `0.0..=1.0`.
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold.clamp(0.0, 1.0);
        self
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
        }
    }
}

/// Configuration for error isolation and recovery.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    /// Containment applied when an error is isolated.
    pub level: IsolationLevel,
    /// Whether recovery strategies run automatically.
    pub auto_recover: bool,
    /// Wait before recovering a high-severity error.
    pub high_recovery_delay: Duration,
    /// Wait before recovering a medium-severity error.
    pub medium_recovery_delay: Duration,
}

impl IsolationConfig {
    /// Sets the isolation level.
    pub fn with_level(mut self, level: IsolationLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets whether recovery runs automatically.
    pub fn with_auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    /// Sets the recovery delays for high and medium severities.
    pub fn with_recovery_delays(mut self, high: Duration, medium: Duration) -> Self {
        self.high_recovery_delay = high;
        self.medium_recovery_delay = medium;
        self
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            level: IsolationLevel::Partial,
            auto_recover: true,
            high_recovery_delay: Duration::from_secs(5),
            medium_recovery_delay: Duration::from_secs(30),
        }
    }
}

/// Thresholds for link classification.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Round-trip time above which a connected link is `unstable`.
    pub unstable_rtt: Duration,
    /// Window in which connectivity flips are counted.
    pub flap_window: Duration,
    /// Flips within the window that mark the link `unstable`.
    pub flap_threshold: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            unstable_rtt: Duration::from_millis(2000),
            flap_window: Duration::from_secs(60),
            flap_threshold: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_max_concurrency(0)
            .with_remote_timeout(Duration::from_secs(5))
            .with_flush_batch_size(10)
            .with_auto_flush(false);

        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.remote_timeout, Duration::from_secs(5));
        assert_eq!(config.flush_batch_size, 10);
        assert!(!config.auto_flush);
    }

    #[test]
    fn retry_defaults_match_policy_tables() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.category_multiplier(ErrorKind::RateLimit), 2.0);
        assert_eq!(config.category_multiplier(ErrorKind::Validation), 1.0);
        assert_eq!(config.severity_multiplier(Severity::Critical), 3.0);
        assert_eq!(config.severity_multiplier(Severity::Low), 1.0);
        assert_eq!(config.tier_multiplier(NetworkTier::Poor), 3.0);
        assert_eq!(config.tier_multiplier(NetworkTier::Unknown), 1.0);
    }

    #[test]
    fn retry_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.jitter, 0.0);
    }

    #[test]
    fn multiplier_and_jitter_are_clamped() {
        let config = RetryConfig::default().with_multiplier(0.5).with_jitter(3.0);
        assert_eq!(config.multiplier, 1.0);
        assert_eq!(config.jitter, 1.0);
    }

    #[test]
    fn conflict_threshold_default() {
        assert_eq!(ConflictConfig::default().similarity_threshold, 0.8);
        let config = ConflictConfig::default().with_similarity_threshold(1.5);
        assert_eq!(config.similarity_threshold, 1.0);
    }
}
