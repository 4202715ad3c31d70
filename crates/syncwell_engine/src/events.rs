//! Typed sync events and the subscriber bus.
//!
//! Every subscriber gets its own unbounded channel. A [`Subscription`]
//! unsubscribes when it is dropped; closed channels are pruned on the next
//! emit.

use crate::network::NetworkSnapshot;
use crate::offline::FlushSummary;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use syncwell_protocol::{
    ConflictId, ConflictKind, EntityKey, ErrorId, ErrorKind, IsolationLevel, OperationId,
    Severity,
};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// An event pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connectivity or link quality changed.
    NetworkChanged(NetworkSnapshot),
    /// An operation was persisted to the queue.
    OperationQueued {
        /// Operation id.
        operation_id: OperationId,
        /// Affected entity, if known.
        entity: Option<EntityKey>,
    },
    /// Progress through a flush cycle.
    SyncProgress {
        /// Operations finished in this cycle.
        completed: usize,
        /// Operations selected for this cycle so far.
        total: usize,
    },
    /// A conflict was detected.
    ConflictDetected {
        /// Conflict id.
        conflict_id: ConflictId,
        /// Affected entity.
        entity: EntityKey,
        /// Classification.
        kind: ConflictKind,
    },
    /// A flush cycle finished.
    SyncComplete(FlushSummary),
    /// An error was captured.
    ErrorDetected {
        /// Error id.
        error_id: ErrorId,
        /// Category.
        kind: ErrorKind,
        /// Severity.
        severity: Severity,
    },
    /// Containment was applied.
    ErrorIsolated {
        /// Error id.
        error_id: ErrorId,
        /// Level applied.
        level: IsolationLevel,
    },
    /// A recovery strategy started.
    RecoveryStarted {
        /// Error id.
        error_id: ErrorId,
        /// Strategy name.
        strategy: String,
    },
    /// A recovery strategy succeeded.
    RecoveryCompleted {
        /// Error id.
        error_id: ErrorId,
    },
    /// A recovery strategy failed.
    RecoveryFailed {
        /// Error id.
        error_id: ErrorId,
        /// Why it failed.
        reason: String,
    },
}

impl SyncEvent {
    /// Returns the kebab-case event name.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::NetworkChanged(_) => "network-changed",
            SyncEvent::OperationQueued { .. } => "operation-queued",
            SyncEvent::SyncProgress { .. } => "sync-progress",
            SyncEvent::ConflictDetected { .. } => "conflict-detected",
            SyncEvent::SyncComplete(_) => "sync-complete",
            SyncEvent::ErrorDetected { .. } => "error-detected",
            SyncEvent::ErrorIsolated { .. } => "error-isolated",
            SyncEvent::RecoveryStarted { .. } => "recovery-started",
            SyncEvent::RecoveryCompleted { .. } => "recovery-completed",
            SyncEvent::RecoveryFailed { .. } => "recovery-failed",
        }
    }
}

struct Subscribers {
    next_id: AtomicU64,
    senders: RwLock<Vec<(u64, UnboundedSender<SyncEvent>)>>,
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Subscribers>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Subscribers {
                next_id: AtomicU64::new(1),
                senders: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.senders.write().push((id, tx));
        Subscription {
            id,
            receiver: rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Sends an event to every live subscriber.
    pub fn emit(&self, event: SyncEvent) {
        let mut senders = self.inner.senders.write();
        senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.senders.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A handle that receives events until it is dropped or unsubscribed.
pub struct Subscription {
    id: u64,
    receiver: UnboundedReceiver<SyncEvent>,
    bus: Weak<Subscribers>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once unsubscribed or the
    /// bus is gone.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drains every buffered event.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Stops receiving events. Already buffered events stay readable.
    pub fn unsubscribe(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.senders.write().retain(|(id, _)| *id != self.id);
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(completed: usize) -> SyncEvent {
        SyncEvent::SyncProgress {
            completed,
            total: 3,
        }
    }

    #[test]
    fn every_subscriber_gets_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(progress(1));
        bus.emit(progress(2));

        assert_eq!(a.drain(), vec![progress(1), progress(2)]);
        assert_eq!(b.drain(), vec![progress(1), progress(2)]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit(progress(1));
        sub.unsubscribe();
        bus.emit(progress(2));

        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(sub.drain(), vec![progress(1)]);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn recv_waits_for_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let sender = bus.clone();
        tokio::spawn(async move {
            sender.emit(progress(7));
        });
        assert_eq!(sub.recv().await, Some(progress(7)));
    }

    #[test]
    fn event_names() {
        assert_eq!(progress(0).name(), "sync-progress");
        assert_eq!(
            SyncEvent::RecoveryCompleted {
                error_id: ErrorId::new()
            }
            .name(),
            "recovery-completed"
        );
    }
}
