//! Decides whether a local operation diverged from the remote copy.

use std::collections::BTreeSet;
use syncwell_protocol::{
    content_digest, Conflict, ConflictId, ConflictKind, ConflictResolution, EntityRecord,
    Operation, OperationKind, Timestamp,
};

/// Outcome of comparing an operation with the remote snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Nothing to reconcile; apply the operation.
    Clean,
    /// Remote content already matches the operation; nothing to send.
    Identical,
    /// The remote copy is newer than the local edit and changed after the
    /// edit's base version. The local edit is superseded.
    Stale {
        /// The newer remote copy.
        remote: EntityRecord,
    },
    /// A true concurrent edit.
    Conflict(Conflict),
}

/// Classifies a divergence.
///
/// A local delete or a remote tombstone is a delete conflict; differing
/// top-level field sets are a structure conflict; anything else is a
/// simultaneous edit.
pub fn classify(op: &Operation, remote: &EntityRecord) -> ConflictKind {
    if op.kind == OperationKind::Delete || remote.deleted {
        return ConflictKind::DeleteConflict;
    }
    let local_fields: BTreeSet<&str> = op
        .payload
        .as_object()
        .map(|map| map.keys().map(String::as_str).collect())
        .unwrap_or_default();
    if local_fields != remote.field_names() {
        ConflictKind::StructureConflict
    } else {
        ConflictKind::SimultaneousEdit
    }
}

fn same_content(op: &Operation, remote: &EntityRecord) -> bool {
    match op.kind {
        OperationKind::Delete => remote.deleted,
        _ if remote.deleted => false,
        _ => match (content_digest(&op.payload), content_digest(&remote.data)) {
            (Ok(local), Ok(theirs)) => local == theirs,
            _ => false,
        },
    }
}

/// Compares `op` with the remote snapshot of its entity.
///
/// A conflict is raised only when the local edit is newer than the remote
/// copy and the remote copy changed after the edit's base version. An
/// operation without a base version treats any remote copy as changed.
/// Batch operations are never compared.
pub fn detect(op: &Operation, remote: Option<&EntityRecord>, now: Timestamp) -> Detection {
    let Some(remote) = remote else {
        return Detection::Clean;
    };
    if op.kind == OperationKind::Batch {
        return Detection::Clean;
    }
    if same_content(op, remote) {
        return Detection::Identical;
    }

    let changed_since_base = op.base_version.map_or(true, |base| remote.updated_at > base);
    if !changed_since_base {
        return Detection::Clean;
    }
    if op.created_at <= remote.updated_at {
        return Detection::Stale {
            remote: remote.clone(),
        };
    }

    Detection::Conflict(Conflict {
        id: ConflictId::new(),
        entity_type: op.entity_type.clone(),
        entity_id: op.entity_id.clone().unwrap_or_else(|| remote.id.clone()),
        operation_id: op.id,
        local_snapshot: op.payload.clone(),
        remote_snapshot: remote.data.clone(),
        local_timestamp: op.created_at,
        remote_timestamp: remote.updated_at,
        kind: classify(op, remote),
        resolution: ConflictResolution::Pending,
        similarity: None,
        detected_at: now,
        resolved_at: None,
    })
}
