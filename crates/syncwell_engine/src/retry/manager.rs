//! Retry sequences: eligibility, delays, cancellation, and history.

use super::conditions::RetryConditions;
use super::policy::{compute_delay, FailureContext};
use super::stats::{RetryStats, SequenceOutcome};
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncwell_protocol::{AttemptOutcome, ErrorKind, OperationId, RetryAttempt, Timestamp};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Why a retry sequence stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryInterrupt {
    /// The sequence was cancelled on its own.
    Cancelled,
    /// Every sequence was aborted.
    Aborted,
    /// The link went down.
    Offline,
}

/// Why a retry sequence ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The failure is not retryable.
    NotRetryable,
    /// The retry budget is spent.
    Exhausted,
    /// A caller condition rejected the retry.
    Condition(&'static str),
    /// The sequence was interrupted.
    Interrupted(RetryInterrupt),
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    Retry(Duration),
    /// Stop.
    GiveUp(StopReason),
}

/// Final failure of [`RetryManager::execute_with_retry`].
#[derive(Debug)]
pub struct RetryFailure {
    /// Error of the last attempt.
    pub error: SyncError,
    /// Attempts made.
    pub attempts: u32,
    /// Why the sequence stopped.
    pub reason: StopReason,
}

/// One-way stop signal shared by a sequence and whoever may cancel it.
#[derive(Debug, Clone)]
struct StopFlag(Arc<watch::Sender<bool>>);

impl StopFlag {
    fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    fn raise(&self) {
        self.0.send_replace(true);
    }

    fn is_raised(&self) -> bool {
        *self.0.borrow()
    }

    async fn raised(&self) {
        let mut rx = self.0.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// State of one in-progress retry sequence.
#[derive(Debug)]
pub struct RetrySequence {
    operation_id: Option<OperationId>,
    serial: u64,
    stop: StopFlag,
    root: StopFlag,
    attempts: u32,
    delays: u32,
    delay_ms: u64,
    last_category: Option<ErrorKind>,
}

impl RetrySequence {
    /// Operation the sequence belongs to, if any.
    pub fn operation_id(&self) -> Option<OperationId> {
        self.operation_id
    }

    /// Attempts that have finished so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns true once the sequence was cancelled or aborted.
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_raised() || self.root.is_raised()
    }

    /// Resolves when the sequence is cancelled or aborted.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.stop.raised() => {}
            _ = self.root.raised() => {}
        }
    }

    /// Returns how the sequence was interrupted, if it was.
    pub fn interruption(&self) -> Option<RetryInterrupt> {
        self.is_cancelled().then(|| self.interrupt())
    }

    fn interrupt(&self) -> RetryInterrupt {
        if self.root.is_raised() {
            RetryInterrupt::Aborted
        } else {
            RetryInterrupt::Cancelled
        }
    }
}

/// Governs when and how failed work is retried.
///
/// Each sequence watches its own stop flag and a shared root flag, so one
/// operation can be cancelled alone and [`RetryManager::abort_all`]
/// reaches every sequence at once.
pub struct RetryManager {
    config: RetryConfig,
    network: Arc<NetworkMonitor>,
    root: Mutex<StopFlag>,
    next_serial: AtomicU64,
    active: Mutex<HashMap<OperationId, (u64, StopFlag)>>,
    history: Mutex<HashMap<Option<OperationId>, VecDeque<RetryAttempt>>>,
    stats: Mutex<RetryStats>,
}

impl RetryManager {
    /// Creates a manager that reads link quality from `network`.
    pub fn new(config: RetryConfig, network: Arc<NetworkMonitor>) -> Self {
        Self {
            config,
            network,
            root: Mutex::new(StopFlag::new()),
            next_serial: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            stats: Mutex::new(RetryStats::default()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Starts a sequence. An existing sequence for the same operation
    /// stops being reachable through [`Self::cancel`].
    pub fn begin(&self, operation_id: Option<OperationId>) -> RetrySequence {
        let root = self.root.lock().clone();
        let stop = StopFlag::new();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = operation_id {
            self.active.lock().insert(id, (serial, stop.clone()));
        }
        RetrySequence {
            operation_id,
            serial,
            stop,
            root,
            attempts: 0,
            delays: 0,
            delay_ms: 0,
            last_category: None,
        }
    }

    /// Records a failed attempt and decides what happens next.
    ///
    /// A failure is retried only if it is retryable, the attempt number
    /// does not exceed `max_retries`, and every condition passes.
    pub fn decide(
        &self,
        sequence: &mut RetrySequence,
        context: &FailureContext,
        max_retries: u32,
        conditions: &RetryConditions,
    ) -> RetryDecision {
        sequence.attempts += 1;
        sequence.last_category = Some(context.category);
        let attempt = sequence.attempts;
        let tier = self.network.tier();
        let now = Timestamp::now();

        let decision = if sequence.is_cancelled() {
            RetryDecision::GiveUp(StopReason::Interrupted(sequence.interrupt()))
        } else if !context.retryable {
            RetryDecision::GiveUp(StopReason::NotRetryable)
        } else if attempt > max_retries {
            RetryDecision::GiveUp(StopReason::Exhausted)
        } else if let Err(condition) = conditions.check(context, attempt, tier, now) {
            RetryDecision::GiveUp(StopReason::Condition(condition))
        } else {
            RetryDecision::Retry(compute_delay(&self.config, attempt, context, tier))
        };

        let (delay, outcome) = match decision {
            RetryDecision::Retry(delay) => {
                sequence.delays += 1;
                sequence.delay_ms += millis(delay);
                (delay, AttemptOutcome::Retrying)
            }
            RetryDecision::GiveUp(_) => (Duration::ZERO, AttemptOutcome::GaveUp),
        };
        self.push_history(RetryAttempt {
            operation_id: sequence.operation_id,
            attempt,
            delay_ms: millis(delay),
            network_tier: tier,
            strategy: self.config.strategy,
            category: Some(context.category),
            severity: context.severity,
            outcome,
            at: now,
        });

        match decision {
            RetryDecision::Retry(delay) => warn!(
                operation_id = ?sequence.operation_id,
                attempt,
                delay_ms = millis(delay),
                kind = context.category.as_str(),
                tier = tier.as_str(),
                "attempt failed, retrying"
            ),
            RetryDecision::GiveUp(reason) => warn!(
                operation_id = ?sequence.operation_id,
                attempt,
                kind = context.category.as_str(),
                ?reason,
                "attempt failed, giving up"
            ),
        }
        decision
    }

    /// Waits out a retry delay.
    ///
    /// Returns early if the sequence is cancelled or aborted, or if a
    /// connected link goes down.
    pub async fn wait(&self, sequence: &RetrySequence, delay: Duration) -> Result<(), RetryInterrupt> {
        let watch_link = self.network.is_connected();
        let result = tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = sequence.cancelled() => Err(sequence.interrupt()),
            _ = self.network.wait_disconnected(), if watch_link => Err(RetryInterrupt::Offline),
        };
        if let Err(interrupt) = result {
            debug!(operation_id = ?sequence.operation_id, ?interrupt, "retry wait interrupted");
            self.push_history(RetryAttempt {
                operation_id: sequence.operation_id,
                attempt: sequence.attempts,
                delay_ms: 0,
                network_tier: self.network.tier(),
                strategy: self.config.strategy,
                category: sequence.last_category,
                severity: None,
                outcome: AttemptOutcome::Cancelled,
                at: Timestamp::now(),
            });
        }
        result
    }

    /// Records a successful attempt and ends the sequence.
    pub fn succeed(&self, mut sequence: RetrySequence) {
        sequence.attempts += 1;
        self.push_history(RetryAttempt {
            operation_id: sequence.operation_id,
            attempt: sequence.attempts,
            delay_ms: 0,
            network_tier: self.network.tier(),
            strategy: self.config.strategy,
            category: None,
            severity: None,
            outcome: AttemptOutcome::Succeeded,
            at: Timestamp::now(),
        });
        self.finish(sequence, true);
    }

    /// Ends a sequence and folds it into the statistics.
    pub fn finish(&self, sequence: RetrySequence, succeeded: bool) {
        if let Some(id) = sequence.operation_id {
            let mut active = self.active.lock();
            if active.get(&id).is_some_and(|(serial, _)| *serial == sequence.serial) {
                active.remove(&id);
            }
        }
        if sequence.attempts == 0 {
            return;
        }
        self.stats.lock().record(&SequenceOutcome {
            strategy: self.config.strategy,
            category: sequence.last_category,
            tier: self.network.tier(),
            attempts: sequence.attempts,
            delays: sequence.delays,
            delay_ms: sequence.delay_ms,
            succeeded,
        });
    }

    /// Cancels the sequence of one operation. Returns false if none is
    /// running.
    pub fn cancel(&self, operation_id: &OperationId) -> bool {
        match self.active.lock().get(operation_id) {
            Some((_, stop)) => {
                stop.raise();
                true
            }
            None => false,
        }
    }

    /// Cancels every running sequence. Returns how many were running.
    pub fn abort_all(&self) -> usize {
        let running = self.active.lock().len();
        let mut root = self.root.lock();
        root.raise();
        *root = StopFlag::new();
        warn!(running, "aborted all retry sequences");
        running
    }

    /// Returns true if the operation has a running sequence.
    pub fn is_active(&self, operation_id: &OperationId) -> bool {
        self.active.lock().contains_key(operation_id)
    }

    /// Returns the attempt history of an operation, oldest first.
    pub fn history(&self, operation_id: &OperationId) -> Vec<RetryAttempt> {
        self.history
            .lock()
            .get(&Some(*operation_id))
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops the attempt history of an operation.
    pub fn forget(&self, operation_id: &OperationId) {
        self.history.lock().remove(&Some(*operation_id));
    }

    /// Returns aggregate statistics.
    pub fn stats(&self) -> RetryStats {
        self.stats.lock().clone()
    }

    /// Runs `attempt` until it succeeds, the failure stops being
    /// retryable, the budget of `max_retries` retries is spent, or the
    /// sequence is interrupted.
    ///
    /// `attempt` receives the 1-based attempt number.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_id: Option<OperationId>,
        max_retries: u32,
        conditions: &RetryConditions,
        mut attempt: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut sequence = self.begin(operation_id);
        loop {
            let result = tokio::select! {
                result = attempt(sequence.attempts + 1) => result,
                _ = sequence.cancelled() => Err(SyncError::Cancelled),
            };
            let error = match result {
                Ok(value) => {
                    self.succeed(sequence);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let context = FailureContext::from_error(&error);
            let reason = match self.decide(&mut sequence, &context, max_retries, conditions) {
                RetryDecision::Retry(delay) => match self.wait(&sequence, delay).await {
                    Ok(()) => continue,
                    Err(interrupt) => StopReason::Interrupted(interrupt),
                },
                RetryDecision::GiveUp(reason) => reason,
            };
            let attempts = sequence.attempts;
            self.finish(sequence, false);
            return Err(RetryFailure {
                error,
                attempts,
                reason,
            });
        }
    }

    fn push_history(&self, entry: RetryAttempt) {
        if self.config.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        let entries = history.entry(entry.operation_id).or_default();
        entries.push_back(entry);
        while entries.len() > self.config.history_limit {
            entries.pop_front();
        }
    }
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .field("active", &self.active.lock().len())
            .finish()
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
