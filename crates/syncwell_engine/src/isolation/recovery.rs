//! Declarative recovery strategies.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::time::Duration;
use syncwell_protocol::{ErrorKind, ErrorRecord};
use tracing::{debug, warn};

/// One thing a recovery step does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Wait until the link is connected.
    WaitForConnectivity,
    /// Make the related operation dispatchable again and start a flush.
    RetryOperation,
    /// Verify the operation store.
    CheckIntegrity,
    /// Rewrite the operation store from its verified state.
    RepairStore,
    /// Fetch the remote state of the affected entities.
    AnalyzeConflict,
    /// Rebase the related operation on the current remote version.
    ResolveConflict,
    /// Sleep.
    Wait(Duration),
}

/// A step of a recovery strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStep {
    /// Step name used in logs and reports.
    pub name: String,
    /// What the step does.
    pub action: RecoveryAction,
    /// Deadline for the step.
    pub timeout: Duration,
    /// Whether a failure aborts the whole strategy.
    pub critical: bool,
}

impl RecoveryStep {
    /// Creates a critical step.
    pub fn critical(name: impl Into<String>, action: RecoveryAction, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            action,
            timeout,
            critical: true,
        }
    }

    /// Creates a step whose failure is logged and skipped.
    pub fn optional(name: impl Into<String>, action: RecoveryAction, timeout: Duration) -> Self {
        Self {
            critical: false,
            ..Self::critical(name, action, timeout)
        }
    }
}

/// An ordered list of recovery steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStrategy {
    /// Strategy name, stored on the error record.
    pub name: String,
    /// Steps, run in order.
    pub steps: Vec<RecoveryStep>,
}

impl RecoveryStrategy {
    /// Wait for connectivity, then retry.
    pub fn network_retry() -> Self {
        Self {
            name: "network-retry".into(),
            steps: vec![
                RecoveryStep::critical(
                    "wait-for-connectivity",
                    RecoveryAction::WaitForConnectivity,
                    Duration::from_secs(30),
                ),
                RecoveryStep::critical(
                    "retry-operation",
                    RecoveryAction::RetryOperation,
                    Duration::from_secs(10),
                ),
            ],
        }
    }

    /// Check store integrity, then repair it.
    pub fn database_repair() -> Self {
        Self {
            name: "database-repair".into(),
            steps: vec![
                RecoveryStep::optional(
                    "integrity-check",
                    RecoveryAction::CheckIntegrity,
                    Duration::from_secs(10),
                ),
                RecoveryStep::critical(
                    "repair",
                    RecoveryAction::RepairStore,
                    Duration::from_secs(30),
                ),
            ],
        }
    }

    /// Analyze the remote state, then rebase and retry.
    pub fn conflict_resolution() -> Self {
        Self {
            name: "conflict-resolution".into(),
            steps: vec![
                RecoveryStep::optional(
                    "analyze-conflict",
                    RecoveryAction::AnalyzeConflict,
                    Duration::from_secs(5),
                ),
                RecoveryStep::critical(
                    "resolve-conflict",
                    RecoveryAction::ResolveConflict,
                    Duration::from_secs(10),
                ),
            ],
        }
    }

    /// Fallback: wait briefly, then retry.
    pub fn wait_and_retry() -> Self {
        Self {
            name: "wait-and-retry".into(),
            steps: vec![
                RecoveryStep::optional(
                    "wait",
                    RecoveryAction::Wait(Duration::from_secs(1)),
                    Duration::from_secs(5),
                ),
                RecoveryStep::critical(
                    "retry-operation",
                    RecoveryAction::RetryOperation,
                    Duration::from_secs(10),
                ),
            ],
        }
    }

    /// Returns the built-in strategy for an error kind.
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Network => Self::network_retry(),
            ErrorKind::Database | ErrorKind::Integrity => Self::database_repair(),
            ErrorKind::Conflict => Self::conflict_resolution(),
            _ => Self::wait_and_retry(),
        }
    }
}

/// Performs recovery actions against the running engine.
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    /// Runs one action on behalf of `error`.
    async fn perform(&self, action: &RecoveryAction, error: &ErrorRecord) -> SyncResult<()>;
}

/// Result of one recovery step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Step name.
    pub name: String,
    /// Failure message, if the step failed.
    pub failure: Option<String>,
}

/// Result of running a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Strategy name.
    pub strategy: String,
    /// Steps that ran, in order.
    pub steps: Vec<StepOutcome>,
    /// Critical step that aborted the strategy, if any.
    pub aborted_at: Option<String>,
}

impl RecoveryReport {
    /// Returns true if no critical step failed.
    pub fn succeeded(&self) -> bool {
        self.aborted_at.is_none()
    }

    /// Returns a one-line description of the failure.
    pub fn failure_reason(&self) -> Option<String> {
        let step = self.aborted_at.as_ref()?;
        let message = self
            .steps
            .iter()
            .find(|s| &s.name == step)
            .and_then(|s| s.failure.clone())
            .unwrap_or_default();
        Some(format!("{step}: {message}"))
    }
}

/// Runs `strategy` step by step.
///
/// Every step runs under its own timeout; a timeout counts as a failure.
/// A critical failure stops the strategy, other failures are skipped.
pub async fn run_strategy(
    strategy: &RecoveryStrategy,
    executor: &dyn RecoveryExecutor,
    error: &ErrorRecord,
) -> RecoveryReport {
    let mut report = RecoveryReport {
        strategy: strategy.name.clone(),
        steps: Vec::with_capacity(strategy.steps.len()),
        aborted_at: None,
    };

    for step in &strategy.steps {
        let result = match tokio::time::timeout(step.timeout, executor.perform(&step.action, error))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(step.timeout)),
        };
        let failure = result.err().map(|e| e.to_string());
        match (&failure, step.critical) {
            (None, _) => debug!(error_id = %error.id, step = %step.name, "recovery step done"),
            (Some(message), true) => {
                warn!(error_id = %error.id, step = %step.name, reason = %message, "critical recovery step failed");
            }
            (Some(message), false) => {
                warn!(error_id = %error.id, step = %step.name, reason = %message, "recovery step failed, skipping");
            }
        }
        let abort = failure.is_some() && step.critical;
        report.steps.push(StepOutcome {
            name: step.name.clone(),
            failure,
        });
        if abort {
            report.aborted_at = Some(step.name.clone());
            break;
        }
    }
    report
}
