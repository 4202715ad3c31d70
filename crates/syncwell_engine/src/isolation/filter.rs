//! Queries over captured error records.

use syncwell_protocol::{EntityKey, ErrorKind, ErrorRecord, ErrorStatus, OperationId, Severity};

/// Selects error records. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorFilter {
    kinds: Vec<ErrorKind>,
    severities: Vec<Severity>,
    statuses: Vec<ErrorStatus>,
    min_severity: Option<Severity>,
    operation: Option<OperationId>,
    entity: Option<EntityKey>,
    active_only: bool,
}

impl ErrorFilter {
    /// A filter that matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only records still being handled.
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    /// Adds an accepted kind.
    pub fn kind(mut self, kind: ErrorKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Adds an accepted severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severities.push(severity);
        self
    }

    /// Only records at or above `severity`.
    pub fn at_least(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Adds an accepted status.
    pub fn status(mut self, status: ErrorStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Only records tied to `operation`.
    pub fn operation(mut self, operation: OperationId) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Only records affecting `entity`.
    pub fn entity(mut self, entity: EntityKey) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Returns true if `record` passes every criterion.
    pub fn matches(&self, record: &ErrorRecord) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&record.kind))
            && (self.severities.is_empty() || self.severities.contains(&record.severity))
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && self.min_severity.map_or(true, |min| record.severity >= min)
            && self
                .operation
                .map_or(true, |op| record.related_operation == Some(op))
            && self
                .entity
                .as_ref()
                .map_or(true, |key| record.affected_entities.contains(&key.to_string()))
            && (!self.active_only || record.is_active())
    }

    /// Returns the matching records, preserving order.
    pub fn apply(&self, records: Vec<ErrorRecord>) -> Vec<ErrorRecord> {
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}
