//! Conflicts between local and remote entity versions.

use crate::ids::{ConflictId, EntityKey, OperationId};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides edited the same fields concurrently.
    SimultaneousEdit,
    /// A local delete collided with remote state.
    DeleteConflict,
    /// Local and remote disagree on the set of fields.
    StructureConflict,
}

impl ConflictKind {
    /// Returns the lowercase name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::SimultaneousEdit => "simultaneous_edit",
            ConflictKind::DeleteConflict => "delete_conflict",
            ConflictKind::StructureConflict => "structure_conflict",
        }
    }
}

/// Resolution state of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Not yet evaluated.
    Pending,
    /// Keep the local version.
    Local,
    /// Accept the remote version.
    Remote,
    /// Combine both versions.
    Merge,
    /// Waiting for a decision from the application.
    Manual,
}

impl ConflictResolution {
    /// Returns true if the conflict still needs attention.
    pub fn is_active(&self) -> bool {
        matches!(self, ConflictResolution::Pending | ConflictResolution::Manual)
    }

    /// Returns the lowercase name of this resolution.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Pending => "pending",
            ConflictResolution::Local => "local",
            ConflictResolution::Remote => "remote",
            ConflictResolution::Merge => "merge",
            ConflictResolution::Manual => "manual",
        }
    }
}

/// A decision the application makes for a manual conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    /// Keep the local version and push it again.
    Local,
    /// Accept the remote version locally.
    Remote,
    /// Overlay local fields on the remote version and push the result.
    Merge,
}

impl From<ResolutionChoice> for ConflictResolution {
    fn from(choice: ResolutionChoice) -> Self {
        match choice {
            ResolutionChoice::Local => ConflictResolution::Local,
            ResolutionChoice::Remote => ConflictResolution::Remote,
            ResolutionChoice::Merge => ConflictResolution::Merge,
        }
    }
}

/// A detected divergence between local and remote state for one entity.
///
/// # Invariants
///
/// - once `resolution` is terminal (`local`, `remote`, `merge`) the
///   conflict never changes again
/// - the store keeps at most one active conflict per entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Unique conflict ID.
    pub id: ConflictId,
    /// Entity type.
    pub entity_type: String,
    /// Entity id.
    pub entity_id: String,
    /// Operation whose flush detected the conflict.
    pub operation_id: OperationId,
    /// Local payload (`null` for deletes).
    pub local_snapshot: Value,
    /// Remote payload.
    pub remote_snapshot: Value,
    /// When the local edit happened.
    pub local_timestamp: Timestamp,
    /// Remote last-modified time.
    pub remote_timestamp: Timestamp,
    /// Classification.
    pub kind: ConflictKind,
    /// Resolution state.
    pub resolution: ConflictResolution,
    /// Content similarity, when it was computed.
    pub similarity: Option<f64>,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
    /// When a terminal resolution was reached.
    pub resolved_at: Option<Timestamp>,
}

impl Conflict {
    /// Returns the entity key.
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Returns true while the conflict needs attention.
    pub fn is_active(&self) -> bool {
        self.resolution.is_active()
    }

    /// Applies a resolution.
    ///
    /// Returns false if the conflict is already terminal; the record is left
    /// untouched in that case.
    pub fn resolve(&mut self, resolution: ConflictResolution, now: Timestamp) -> bool {
        if !self.is_active() {
            return false;
        }
        self.resolution = resolution;
        if !resolution.is_active() {
            self.resolved_at = Some(now);
        }
        true
    }
}
