//! Delay computation.

use crate::config::RetryConfig;
use crate::error::SyncError;
use rand::Rng;
use std::time::Duration;
use syncwell_protocol::{ErrorKind, NetworkTier, RetryStrategy, Severity};

/// What is known about a failed attempt when the next delay is computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureContext {
    /// Category of the failure.
    pub category: ErrorKind,
    /// Severity, set only when it was raised above the category default.
    pub severity: Option<Severity>,
    /// Whether the failure may be retried at all.
    pub retryable: bool,
    /// Minimum wait requested by the backend.
    pub retry_after: Option<Duration>,
}

impl FailureContext {
    /// A retryable failure of `category`.
    pub fn new(category: ErrorKind) -> Self {
        Self {
            category,
            severity: None,
            retryable: true,
            retry_after: None,
        }
    }

    /// Derives the context from an engine error.
    pub fn from_error(error: &SyncError) -> Self {
        Self {
            category: error.kind(),
            severity: None,
            retryable: error.is_retryable(),
            retry_after: error.retry_after(),
        }
    }

    /// Records an explicit severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Sets whether the failure may be retried.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Returns the delay after failed attempt `attempt` (1-based), before
/// jitter.
///
/// Strategy growth, adaptive scaling, and link-tier scaling are applied in
/// that order, then the result is capped at `max_delay`. A backend
/// `retry_after` raises the result. For exponential and adaptive
/// strategies the delay never shrinks as `attempt` grows.
pub fn base_delay(
    config: &RetryConfig,
    attempt: u32,
    context: &FailureContext,
    tier: NetworkTier,
) -> Duration {
    let base = config.base_delay.as_secs_f64() * 1000.0;
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let growth = config.multiplier.max(1.0).powi(exponent);

    let mut millis = match config.strategy {
        RetryStrategy::Fixed => base,
        RetryStrategy::Exponential => base * growth,
        RetryStrategy::Adaptive => {
            let severity = context
                .severity
                .map(|s| config.severity_multiplier(s))
                .unwrap_or(1.0);
            base * growth * config.category_multiplier(context.category) * severity
        }
    };
    if config.network_aware {
        millis *= config.tier_multiplier(tier);
    }

    // A zero base times an overflowed growth factor.
    if millis.is_nan() {
        millis = 0.0;
    }
    let cap = config.max_delay.as_secs_f64() * 1000.0;
    let micros = (millis.min(cap).max(0.0) * 1000.0).round();
    let mut delay = Duration::from_micros(micros as u64);
    if let Some(after) = context.retry_after {
        delay = delay.max(after);
    }
    delay
}

/// Severity to report for a failure, given the record's current value.
///
/// Only an escalation above the category default is reported, so delays
/// for routine failures scale by category alone.
pub fn explicit_severity(kind: ErrorKind, current: Severity) -> Option<Severity> {
    (current > kind.default_severity()).then_some(current)
}

/// Applies ±`ratio` uniform jitter, floored at zero.
pub fn jitter(delay: Duration, ratio: f64, rng: &mut impl Rng) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 + rng.gen_range(-ratio..=ratio);
    delay.mul_f64(factor.max(0.0))
}

/// Returns the jittered delay after failed attempt `attempt`.
pub fn compute_delay(
    config: &RetryConfig,
    attempt: u32,
    context: &FailureContext,
    tier: NetworkTier,
) -> Duration {
    let delay = base_delay(config, attempt, context, tier);
    jitter(delay, config.jitter, &mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(strategy: RetryStrategy) -> RetryConfig {
        RetryConfig::default()
            .with_strategy(strategy)
            .with_base_delay(Duration::from_millis(1000))
            .with_multiplier(2.0)
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn adaptive_network_failure_on_poor_link() {
        let config = config(RetryStrategy::Adaptive);
        let network = FailureContext::new(ErrorKind::Network);
        let delays: Vec<_> = (1..=3)
            .map(|n| base_delay(&config, n, &network, NetworkTier::Poor))
            .collect();
        assert_eq!(delays, vec![ms(4500), ms(9000), ms(18000)]);
    }

    #[test]
    fn fixed_ignores_attempt() {
        let config = config(RetryStrategy::Fixed).with_network_aware(false);
        let ctx = FailureContext::new(ErrorKind::RateLimit);
        assert_eq!(base_delay(&config, 1, &ctx, NetworkTier::Poor), ms(1000));
        assert_eq!(base_delay(&config, 5, &ctx, NetworkTier::Poor), ms(1000));
    }

    #[test]
    fn exponential_ignores_category() {
        let config = config(RetryStrategy::Exponential).with_network_aware(false);
        let ctx = FailureContext::new(ErrorKind::RateLimit);
        assert_eq!(base_delay(&config, 3, &ctx, NetworkTier::Unknown), ms(4000));
    }

    #[test]
    fn explicit_severity_scales_adaptive() {
        let config = config(RetryStrategy::Adaptive).with_network_aware(false);
        let ctx = FailureContext::new(ErrorKind::Timeout).with_severity(Severity::Critical);
        assert_eq!(base_delay(&config, 1, &ctx, NetworkTier::Good), ms(3600));
    }

    #[test]
    fn delay_is_capped() {
        let config = config(RetryStrategy::Exponential)
            .with_max_delay(ms(5000))
            .with_network_aware(false);
        let ctx = FailureContext::new(ErrorKind::Network);
        assert_eq!(base_delay(&config, 10, &ctx, NetworkTier::Good), ms(5000));
    }

    #[test]
    fn retry_after_raises_delay() {
        let config = config(RetryStrategy::Fixed).with_network_aware(false);
        let mut ctx = FailureContext::new(ErrorKind::RateLimit);
        ctx.retry_after = Some(ms(7000));
        assert_eq!(base_delay(&config, 1, &ctx, NetworkTier::Good), ms(7000));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let d = jitter(ms(10_000), 0.1, &mut rng);
            assert!(d >= ms(9_000) && d <= ms(11_000), "{d:?}");
        }
        assert_eq!(jitter(ms(10_000), 0.0, &mut rng), ms(10_000));
    }

    #[test]
    fn only_escalated_severity_is_explicit() {
        assert_eq!(explicit_severity(ErrorKind::Network, Severity::Medium), None);
        assert_eq!(
            explicit_severity(ErrorKind::Network, Severity::Critical),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn context_from_error() {
        let ctx = FailureContext::from_error(&SyncError::RateLimited {
            retry_after: Some(ms(250)),
        });
        assert_eq!(ctx.category, ErrorKind::RateLimit);
        assert!(ctx.retryable);
        assert_eq!(ctx.retry_after, Some(ms(250)));
        assert_eq!(ctx.severity, None);
    }

    fn strategy() -> impl Strategy<Value = RetryStrategy> {
        prop_oneof![Just(RetryStrategy::Exponential), Just(RetryStrategy::Adaptive)]
    }

    fn kind() -> impl Strategy<Value = ErrorKind> {
        proptest::sample::select(ErrorKind::ALL.to_vec())
    }

    fn tier() -> impl Strategy<Value = NetworkTier> {
        prop_oneof![
            Just(NetworkTier::Unknown),
            Just(NetworkTier::Poor),
            Just(NetworkTier::Fair),
            Just(NetworkTier::Good),
            Just(NetworkTier::Excellent),
        ]
    }

    proptest! {
        #[test]
        fn delays_never_shrink(
            strategy in strategy(),
            kind in kind(),
            tier in tier(),
            base in 1u64..5_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..20,
        ) {
            let config = RetryConfig::default()
                .with_strategy(strategy)
                .with_base_delay(ms(base))
                .with_multiplier(multiplier);
            let ctx = FailureContext::new(kind);
            let now = base_delay(&config, attempt, &ctx, tier);
            let next = base_delay(&config, attempt + 1, &ctx, tier);
            prop_assert!(next >= now, "{:?} < {:?}", next, now);
        }
    }
}
