//! Captured sync errors.

use crate::ids::{ErrorId, OperationId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connectivity or transport failure.
    Network,
    /// Local storage failure.
    Database,
    /// Unresolved divergence between local and remote state.
    Conflict,
    /// Rejected input.
    Validation,
    /// A call exceeded its deadline.
    Timeout,
    /// Credentials were rejected.
    Authentication,
    /// The backend asked us to slow down.
    RateLimit,
    /// Stored data violates an invariant.
    Integrity,
    /// Incompatible schema or protocol version.
    Version,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Network,
        ErrorKind::Database,
        ErrorKind::Conflict,
        ErrorKind::Validation,
        ErrorKind::Timeout,
        ErrorKind::Authentication,
        ErrorKind::RateLimit,
        ErrorKind::Integrity,
        ErrorKind::Version,
        ErrorKind::Unknown,
    ];

    /// Returns the fixed severity assigned at detection.
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::Integrity => Severity::Critical,
            ErrorKind::Database | ErrorKind::Authentication | ErrorKind::Version => Severity::High,
            ErrorKind::Network
            | ErrorKind::Conflict
            | ErrorKind::Timeout
            | ErrorKind::RateLimit
            | ErrorKind::Unknown => Severity::Medium,
            ErrorKind::Validation => Severity::Low,
        }
    }

    /// Returns the lowercase name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Database => "database",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Version => "version",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Parses a kind name as produced by [`Self::as_str`].
    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == input)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a failure. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Logged and ignored.
    Low,
    /// Logged; recovery after a longer delay.
    Medium,
    /// Isolated; recovery after a short delay.
    High,
    /// Isolated and recovered immediately.
    Critical,
}

impl Severity {
    /// Returns the lowercase name of this severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Parses a severity name.
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handling status of a captured error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    /// Just captured.
    Detected,
    /// Being classified and routed.
    Analyzing,
    /// Containment applied.
    Isolated,
    /// A recovery strategy is running.
    Recovering,
    /// Recovery succeeded.
    Recovered,
    /// Recovery failed.
    Failed,
    /// Logged only.
    Ignored,
}

impl ErrorStatus {
    fn rank(self) -> u8 {
        match self {
            ErrorStatus::Detected => 0,
            ErrorStatus::Analyzing => 1,
            ErrorStatus::Isolated => 2,
            ErrorStatus::Recovering => 3,
            ErrorStatus::Recovered | ErrorStatus::Failed | ErrorStatus::Ignored => 4,
        }
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Returns true if the transition `self -> next` keeps status monotonic.
    ///
    /// `recovered` and `failed` are only reachable from `recovering`;
    /// `ignored` only before containment starts.
    pub fn can_transition_to(&self, next: ErrorStatus) -> bool {
        match next {
            ErrorStatus::Recovered | ErrorStatus::Failed => *self == ErrorStatus::Recovering,
            ErrorStatus::Ignored => matches!(self, ErrorStatus::Detected | ErrorStatus::Analyzing),
            _ => next.rank() > self.rank(),
        }
    }

    /// Returns the lowercase name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStatus::Detected => "detected",
            ErrorStatus::Analyzing => "analyzing",
            ErrorStatus::Isolated => "isolated",
            ErrorStatus::Recovering => "recovering",
            ErrorStatus::Recovered => "recovered",
            ErrorStatus::Failed => "failed",
            ErrorStatus::Ignored => "ignored",
        }
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blast radius of containment when an error is isolated.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// No containment.
    None,
    /// Stop only operations touching the affected entities.
    #[default]
    Partial,
    /// Stop every sync-dependent background service.
    Full,
    /// Full, and mark the sync subsystem unavailable.
    Strict,
}

impl IsolationLevel {
    /// Returns the lowercase name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::None => "none",
            IsolationLevel::Partial => "partial",
            IsolationLevel::Full => "full",
            IsolationLevel::Strict => "strict",
        }
    }
}

/// A captured failure and its handling state.
///
/// # Invariants
///
/// - `status` only moves through [`ErrorStatus::can_transition_to`]
/// - `severity` is set at detection and can only be raised explicitly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unique error ID.
    pub id: ErrorId,
    /// Category.
    pub kind: ErrorKind,
    /// Severity.
    pub severity: Severity,
    /// Handling status.
    pub status: ErrorStatus,
    /// Human-readable message.
    pub message: String,
    /// Operation that was being processed, if any.
    pub related_operation: Option<OperationId>,
    /// Attempts consumed by the related operation.
    pub retry_count: u32,
    /// Retry budget of the related operation.
    pub max_retries: u32,
    /// Whether the failure may be retried.
    pub retryable: bool,
    /// Name of the recovery strategy chosen for this error.
    pub recovery_strategy: Option<String>,
    /// Containment applied, if any.
    pub isolation: Option<IsolationLevel>,
    /// Affected entities as `type:id`.
    pub affected_entities: BTreeSet<String>,
    /// Free-form diagnostic context.
    pub context: BTreeMap<String, String>,
    /// When the error was captured.
    pub detected_at: Timestamp,
    /// Last status change.
    pub updated_at: Timestamp,
}

impl ErrorRecord {
    /// Creates a freshly detected record with the kind's default severity.
    pub fn new(kind: ErrorKind, message: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: ErrorId::new(),
            kind,
            severity: kind.default_severity(),
            status: ErrorStatus::Detected,
            message: message.into(),
            related_operation: None,
            retry_count: 0,
            max_retries: 0,
            retryable: false,
            recovery_strategy: None,
            isolation: None,
            affected_entities: BTreeSet::new(),
            context: BTreeMap::new(),
            detected_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next`, returning false if the move would break
    /// monotonicity.
    pub fn transition(&mut self, next: ErrorStatus, now: Timestamp) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    /// Raises severity to at least `severity`. Never lowers it.
    pub fn escalate(&mut self, severity: Severity) {
        self.severity = self.severity.max(severity);
    }

    /// Returns true while the error is still being handled.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}
