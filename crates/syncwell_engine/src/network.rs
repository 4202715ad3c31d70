//! Connectivity tracking and link-quality classification.

use crate::config::NetworkConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use syncwell_protocol::{NetworkTier, Timestamp};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

/// Connectivity state as seen by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    /// Connected with a usable link.
    Online,
    /// Not connected.
    Offline,
    /// Connected, but slow or flapping.
    Unstable,
    /// No report received yet.
    #[default]
    Unknown,
}

impl NetworkStatus {
    /// Returns true if remote calls may be attempted.
    pub fn is_connected(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Unstable)
    }

    /// Returns the lowercase name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkStatus::Online => "online",
            NetworkStatus::Offline => "offline",
            NetworkStatus::Unstable => "unstable",
            NetworkStatus::Unknown => "unknown",
        }
    }
}

/// Link-quality hints from the runtime environment. Every field is
/// optional; platforms expose different subsets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkHints {
    /// Effective connection type, e.g. `slow-2g`, `3g`, `4g`, `wifi`.
    pub effective_type: Option<String>,
    /// Estimated downlink bandwidth in Mbit/s.
    pub downlink_mbps: Option<f64>,
    /// Estimated round-trip time in milliseconds.
    pub rtt_ms: Option<u64>,
}

impl LinkHints {
    /// Hints carrying only an effective connection type.
    pub fn effective(kind: impl Into<String>) -> Self {
        Self {
            effective_type: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Sets the downlink estimate.
    pub fn with_downlink(mut self, mbps: f64) -> Self {
        self.downlink_mbps = Some(mbps);
        self
    }

    /// Sets the round-trip estimate.
    pub fn with_rtt(mut self, rtt_ms: u64) -> Self {
        self.rtt_ms = Some(rtt_ms);
        self
    }
}

fn tier_from_type(effective_type: &str) -> NetworkTier {
    match effective_type.to_ascii_lowercase().as_str() {
        "slow-2g" | "2g" => NetworkTier::Poor,
        "3g" => NetworkTier::Fair,
        "4g" | "lte" => NetworkTier::Good,
        "5g" | "wifi" | "ethernet" => NetworkTier::Excellent,
        _ => NetworkTier::Unknown,
    }
}

fn tier_from_downlink(mbps: f64) -> NetworkTier {
    if mbps < 0.5 {
        NetworkTier::Poor
    } else if mbps < 2.0 {
        NetworkTier::Fair
    } else if mbps < 10.0 {
        NetworkTier::Good
    } else {
        NetworkTier::Excellent
    }
}

fn tier_from_rtt(rtt_ms: u64) -> NetworkTier {
    match rtt_ms {
        0..=100 => NetworkTier::Excellent,
        101..=400 => NetworkTier::Good,
        401..=1000 => NetworkTier::Fair,
        _ => NetworkTier::Poor,
    }
}

/// Classifies a link from its hints.
///
/// Each available hint yields a tier; the worst one wins. Without any
/// usable hint the tier is [`NetworkTier::Unknown`].
pub fn classify_tier(hints: &LinkHints) -> NetworkTier {
    [
        hints.effective_type.as_deref().map(tier_from_type),
        hints.downlink_mbps.map(tier_from_downlink),
        hints.rtt_ms.map(tier_from_rtt),
    ]
    .into_iter()
    .flatten()
    .filter(|tier| *tier != NetworkTier::Unknown)
    .min()
    .unwrap_or(NetworkTier::Unknown)
}

/// Point-in-time view of the link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkSnapshot {
    /// Connectivity state.
    pub status: NetworkStatus,
    /// Link-quality tier.
    pub tier: NetworkTier,
    /// Hints the tier was derived from.
    pub hints: LinkHints,
    /// Wall-clock time of the last report.
    pub reported_at: Option<Timestamp>,
}

impl NetworkSnapshot {
    /// Returns true if remote calls may be attempted.
    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }
}

/// Result of a network report.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkChange {
    /// State before the report.
    pub previous: NetworkSnapshot,
    /// State after the report.
    pub current: NetworkSnapshot,
}

impl NetworkChange {
    /// Returns true on a disconnected → connected transition.
    pub fn reconnected(&self) -> bool {
        !self.previous.is_connected() && self.current.is_connected()
    }

    /// Returns true on a connected → disconnected transition.
    pub fn disconnected(&self) -> bool {
        self.previous.is_connected() && !self.current.is_connected()
    }

    /// Returns true if status or tier changed.
    pub fn is_change(&self) -> bool {
        self.previous.status != self.current.status || self.previous.tier != self.current.tier
    }
}

#[derive(Debug, Default)]
struct LinkHistory {
    connected: Option<bool>,
    flips: VecDeque<Instant>,
    offline_since: Option<Instant>,
    offline_total: Duration,
}

/// Tracks connectivity reports and publishes [`NetworkSnapshot`]s.
///
/// The link is `unstable` while connected if the round-trip hint exceeds
/// the configured threshold or connectivity flipped too often within the
/// flap window.
#[derive(Debug)]
pub struct NetworkMonitor {
    config: NetworkConfig,
    history: Mutex<LinkHistory>,
    sender: watch::Sender<NetworkSnapshot>,
}

impl NetworkMonitor {
    /// Creates a monitor in the `unknown` state.
    pub fn new(config: NetworkConfig) -> Self {
        let (sender, _) = watch::channel(NetworkSnapshot::default());
        Self {
            config,
            history: Mutex::new(LinkHistory::default()),
            sender,
        }
    }

    /// Records a connectivity report.
    pub fn report(&self, connected: bool, hints: LinkHints) -> NetworkChange {
        let now = Instant::now();
        let mut history = self.history.lock();

        if let Some(was) = history.connected {
            if was != connected {
                history.flips.push_back(now);
            }
        }
        while history
            .flips
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.config.flap_window)
        {
            history.flips.pop_front();
        }

        match (connected, history.offline_since) {
            (false, None) => history.offline_since = Some(now),
            (true, Some(since)) => {
                history.offline_total += now.duration_since(since);
                history.offline_since = None;
            }
            _ => {}
        }
        history.connected = Some(connected);

        let slow = hints
            .rtt_ms
            .is_some_and(|rtt| Duration::from_millis(rtt) > self.config.unstable_rtt);
        let flapping = history.flips.len() >= self.config.flap_threshold;
        let status = match (connected, slow || flapping) {
            (false, _) => NetworkStatus::Offline,
            (true, true) => NetworkStatus::Unstable,
            (true, false) => NetworkStatus::Online,
        };
        drop(history);

        let current = NetworkSnapshot {
            status,
            tier: classify_tier(&hints),
            hints,
            reported_at: Some(Timestamp::now()),
        };
        let previous = self.sender.send_replace(current.clone());
        let change = NetworkChange { previous, current };
        if change.is_change() {
            info!(
                status = change.current.status.as_str(),
                tier = change.current.tier.as_str(),
                "network changed"
            );
        }
        change
    }

    /// Records a connectivity flip, keeping the last hints.
    pub fn set_online(&self, connected: bool) -> NetworkChange {
        let hints = self.sender.borrow().hints.clone();
        self.report(connected, hints)
    }

    /// Returns the latest snapshot.
    pub fn snapshot(&self) -> NetworkSnapshot {
        self.sender.borrow().clone()
    }

    /// Returns true if remote calls may be attempted.
    pub fn is_connected(&self) -> bool {
        self.sender.borrow().is_connected()
    }

    /// Returns the current link tier.
    pub fn tier(&self) -> NetworkTier {
        self.sender.borrow().tier
    }

    /// Total time spent disconnected, including an ongoing outage.
    pub fn offline_duration(&self) -> Duration {
        let history = self.history.lock();
        let ongoing = history
            .offline_since
            .map(|since| since.elapsed())
            .unwrap_or_default();
        history.offline_total + ongoing
    }

    /// Returns a receiver that observes every new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<NetworkSnapshot> {
        self.sender.subscribe()
    }

    /// Resolves once the link is connected.
    pub async fn wait_connected(&self) {
        self.wait_until(true).await;
    }

    /// Resolves once the link is disconnected.
    pub async fn wait_disconnected(&self) {
        self.wait_until(false).await;
    }

    async fn wait_until(&self, connected: bool) {
        let mut rx = self.sender.subscribe();
        loop {
            if rx.borrow_and_update().is_connected() == connected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn worst_hint_wins() {
        let hints = LinkHints::effective("4g").with_downlink(20.0).with_rtt(1500);
        assert_eq!(classify_tier(&hints), NetworkTier::Poor);

        let hints = LinkHints::effective("wifi").with_downlink(1.0);
        assert_eq!(classify_tier(&hints), NetworkTier::Fair);
    }

    #[test]
    fn no_hints_is_unknown() {
        assert_eq!(classify_tier(&LinkHints::default()), NetworkTier::Unknown);
        assert_eq!(
            classify_tier(&LinkHints::effective("carrier-pigeon")),
            NetworkTier::Unknown
        );
    }

    #[test]
    fn effective_types() {
        assert_eq!(classify_tier(&LinkHints::effective("slow-2g")), NetworkTier::Poor);
        assert_eq!(classify_tier(&LinkHints::effective("3g")), NetworkTier::Fair);
        assert_eq!(classify_tier(&LinkHints::effective("4G")), NetworkTier::Good);
        assert_eq!(
            classify_tier(&LinkHints::effective("ethernet")),
            NetworkTier::Excellent
        );
    }

    #[tokio::test]
    async fn starts_unknown_and_disconnected() {
        let monitor = NetworkMonitor::default();
        assert_eq!(monitor.snapshot().status, NetworkStatus::Unknown);
        assert!(!monitor.is_connected());
    }

    #[tokio::test]
    async fn reconnect_is_reported() {
        let monitor = NetworkMonitor::default();
        assert!(!monitor.set_online(false).disconnected());
        let change = monitor.report(true, LinkHints::effective("4g"));
        assert!(change.reconnected());
        assert_eq!(change.current.status, NetworkStatus::Online);
        assert_eq!(monitor.tier(), NetworkTier::Good);

        let change = monitor.set_online(false);
        assert!(change.disconnected());
        assert_eq!(change.current.tier, NetworkTier::Good);
    }

    #[tokio::test]
    async fn high_rtt_is_unstable() {
        let monitor = NetworkMonitor::default();
        let change = monitor.report(true, LinkHints::default().with_rtt(2500));
        assert_eq!(change.current.status, NetworkStatus::Unstable);
        assert!(change.current.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_is_unstable_until_window_passes() {
        let config = NetworkConfig {
            flap_threshold: 3,
            ..NetworkConfig::default()
        };
        let monitor = NetworkMonitor::new(config);
        monitor.set_online(true);
        monitor.set_online(false);
        monitor.set_online(true);
        monitor.set_online(false);
        let change = monitor.set_online(true);
        assert_eq!(change.current.status, NetworkStatus::Unstable);

        tokio::time::advance(Duration::from_secs(61)).await;
        let change = monitor.set_online(true);
        assert_eq!(change.current.status, NetworkStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_duration_accumulates() {
        let monitor = NetworkMonitor::default();
        monitor.set_online(false);
        tokio::time::advance(Duration::from_secs(10)).await;
        monitor.set_online(true);
        tokio::time::advance(Duration::from_secs(5)).await;
        monitor.set_online(false);
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(monitor.offline_duration(), Duration::from_secs(13));
    }

    #[tokio::test]
    async fn wait_connected_resolves_on_report() {
        let monitor = Arc::new(NetworkMonitor::default());
        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.wait_connected().await })
        };
        tokio::task::yield_now().await;
        monitor.set_online(true);
        waiter.await.unwrap();
        assert!(monitor.is_connected());
    }
}
