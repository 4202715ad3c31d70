//! Wall-clock timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// All record timestamps (creation, last modification, detection) use this
/// type so that local and remote times compare directly.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Creates a timestamp from raw milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Returns the raw millisecond value.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns the UTC hour of day (0-23).
    #[must_use]
    pub const fn hour_of_day(self) -> u8 {
        ((self.0 / 3_600_000) % 24) as u8
    }

    /// Returns this timestamp shifted forward by `duration`.
    #[must_use]
    pub fn plus(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Returns this timestamp shifted back by `duration`, floored at zero.
    #[must_use]
    pub fn minus(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    /// Returns the time elapsed from `earlier` to `self`, zero if negative.
    #[must_use]
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_of_day_wraps() {
        assert_eq!(Timestamp::from_millis(0).hour_of_day(), 0);
        assert_eq!(Timestamp::from_millis(13 * 3_600_000 + 5).hour_of_day(), 13);
        assert_eq!(Timestamp::from_millis(25 * 3_600_000).hour_of_day(), 1);
    }

    #[test]
    fn minus_floors_at_zero() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!(t.minus(Duration::from_millis(400)), Timestamp::from_millis(600));
        assert_eq!(t.minus(Duration::from_secs(5)), Timestamp::from_millis(0));
    }

    #[test]
    fn since_saturates() {
        let a = Timestamp::from_millis(100);
        let b = Timestamp::from_millis(250);
        assert_eq!(b.since(a), Duration::from_millis(150));
        assert_eq!(a.since(b), Duration::ZERO);
    }

    #[test]
    fn now_is_after_epoch() {
        assert!(Timestamp::now() > Timestamp::from_millis(1_600_000_000_000));
    }
}
