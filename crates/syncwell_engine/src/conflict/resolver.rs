//! Resolution policy for detected conflicts.

use super::similarity::similarity;
use crate::config::ConflictConfig;
use syncwell_protocol::{Conflict, ConflictKind, ConflictResolution};

/// The resolver's decision for one conflict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Chosen resolution.
    pub resolution: ConflictResolution,
    /// Content similarity, when it was computed.
    pub similarity: Option<f64>,
}

/// Applies the resolution policy, first match wins:
///
/// 1. delete conflicts need a manual decision
/// 2. structure conflicts keep the local shape
/// 3. simultaneous edits above the similarity threshold keep the side with
///    the later timestamp (local on ties); below it they need a manual
///    decision
///
/// The result depends only on the snapshots, timestamps, and kind.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    config: ConflictConfig,
}

impl ConflictResolver {
    /// Creates a resolver.
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Returns the configured similarity threshold.
    pub fn threshold(&self) -> f64 {
        self.config.similarity_threshold
    }

    /// Decides how to resolve `conflict`.
    pub fn resolve(&self, conflict: &Conflict) -> Verdict {
        match conflict.kind {
            ConflictKind::DeleteConflict => Verdict {
                resolution: ConflictResolution::Manual,
                similarity: None,
            },
            ConflictKind::StructureConflict => Verdict {
                resolution: ConflictResolution::Local,
                similarity: None,
            },
            ConflictKind::SimultaneousEdit => {
                let score = similarity(&conflict.local_snapshot, &conflict.remote_snapshot);
                let resolution = if score <= self.config.similarity_threshold {
                    ConflictResolution::Manual
                } else if conflict.local_timestamp >= conflict.remote_timestamp {
                    ConflictResolution::Local
                } else {
                    ConflictResolution::Remote
                };
                Verdict {
                    resolution,
                    similarity: Some(score),
                }
            }
        }
    }
}
