//! Caller-supplied retry eligibility conditions.

use super::policy::FailureContext;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use syncwell_protocol::{ErrorKind, NetworkTier, Severity, Timestamp};

/// Custom retry predicate: `(failure, failed attempt number) -> allowed`.
pub type RetryPredicate = Arc<dyn Fn(&FailureContext, u32) -> bool + Send + Sync>;

/// Extra conditions a retry must satisfy. Every set condition must pass;
/// an empty set of conditions allows everything.
#[derive(Clone, Default)]
pub struct RetryConditions {
    tiers: Option<BTreeSet<NetworkTier>>,
    categories: Option<BTreeSet<ErrorKind>>,
    severities: Option<BTreeSet<Severity>>,
    hours: Option<(u8, u8)>,
    predicate: Option<RetryPredicate>,
}

impl RetryConditions {
    /// Conditions that allow every retry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only retry on these link tiers.
    pub fn allow_tiers(mut self, tiers: impl IntoIterator<Item = NetworkTier>) -> Self {
        self.tiers = Some(tiers.into_iter().collect());
        self
    }

    /// Only retry failures of these categories.
    pub fn allow_categories(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.categories = Some(kinds.into_iter().collect());
        self
    }

    /// Only retry failures of these severities. Failures without an
    /// explicit severity use their category default.
    pub fn allow_severities(mut self, severities: impl IntoIterator<Item = Severity>) -> Self {
        self.severities = Some(severities.into_iter().collect());
        self
    }

    /// Only retry between `start` (inclusive) and `end` (exclusive) UTC
    /// hours. The window wraps past midnight when `start > end`.
    pub fn within_hours(mut self, start: u8, end: u8) -> Self {
        self.hours = Some((start % 24, end % 24));
        self
    }

    /// Adds a custom predicate.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&FailureContext, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Returns `Err` with the name of the first failing condition.
    pub fn check(
        &self,
        context: &FailureContext,
        attempt: u32,
        tier: NetworkTier,
        now: Timestamp,
    ) -> Result<(), &'static str> {
        if self.tiers.as_ref().is_some_and(|t| !t.contains(&tier)) {
            return Err("network tier");
        }
        if self
            .categories
            .as_ref()
            .is_some_and(|c| !c.contains(&context.category))
        {
            return Err("error category");
        }
        let severity = context
            .severity
            .unwrap_or_else(|| context.category.default_severity());
        if self
            .severities
            .as_ref()
            .is_some_and(|s| !s.contains(&severity))
        {
            return Err("severity");
        }
        if let Some((start, end)) = self.hours {
            let hour = now.hour_of_day();
            let inside = if start <= end {
                hour >= start && hour < end
            } else {
                hour >= start || hour < end
            };
            if !inside {
                return Err("time window");
            }
        }
        if self
            .predicate
            .as_ref()
            .is_some_and(|p| !p(context, attempt))
        {
            return Err("predicate");
        }
        Ok(())
    }
}

impl fmt::Debug for RetryConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConditions")
            .field("tiers", &self.tiers)
            .field("categories", &self.categories)
            .field("severities", &self.severities)
            .field("hours", &self.hours)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
