//! Recovery actions run against the live engine.

use super::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::isolation::{RecoveryAction, RecoveryExecutor};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use syncwell_protocol::{ConflictResolution, EntityKey, ErrorRecord, OperationStatus};
use syncwell_store::WriteOrigin;
use tracing::{debug, info};

/// Executes recovery steps for the isolator.
///
/// Holds the engine weakly; the engine owns the isolator that owns this.
pub(crate) struct EngineRecovery {
    pub core: Weak<SyncEngine>,
}

impl EngineRecovery {
    fn engine(&self) -> SyncResult<Arc<SyncEngine>> {
        self.core
            .upgrade()
            .ok_or_else(|| SyncError::Unavailable("engine shut down".into()))
    }
}

#[async_trait]
impl RecoveryExecutor for EngineRecovery {
    async fn perform(&self, action: &RecoveryAction, error: &ErrorRecord) -> SyncResult<()> {
        let engine = self.engine()?;
        match action {
            RecoveryAction::WaitForConnectivity => {
                engine.network.wait_connected().await;
                Ok(())
            }
            RecoveryAction::RetryOperation => retry_operation(&engine, error),
            RecoveryAction::CheckIntegrity => check_integrity(&engine),
            RecoveryAction::RepairStore => {
                let summary = engine.store.compact()?;
                info!(
                    error_id = %error.id,
                    reclaimed = summary.bytes_reclaimed(),
                    "operation store rewritten"
                );
                check_integrity(&engine)
            }
            RecoveryAction::AnalyzeConflict => {
                for key in affected(error) {
                    let remote = engine.remote.fetch(&key.entity_type, &key.entity_id).await?;
                    debug!(
                        error_id = %error.id,
                        entity = %key,
                        remote_updated_at = ?remote.map(|r| r.updated_at),
                        "remote state analyzed"
                    );
                }
                Ok(())
            }
            RecoveryAction::ResolveConflict => resolve_conflict(&engine, error).await,
            RecoveryAction::Wait(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
        }
    }
}

fn affected(error: &ErrorRecord) -> Vec<EntityKey> {
    error
        .affected_entities
        .iter()
        .filter_map(|key| EntityKey::parse(key))
        .collect()
}

fn retry_operation(engine: &Arc<SyncEngine>, error: &ErrorRecord) -> SyncResult<()> {
    if !engine.network.is_connected() {
        return Err(SyncError::Offline);
    }
    if let Some(op) = error.related_operation.and_then(|id| engine.store.get(&id)) {
        if op.status == OperationStatus::Failed && !error.retryable {
            return Err(SyncError::InvalidState(format!(
                "{} failed with a non-retryable error",
                op.id
            )));
        }
    }
    engine.kick();
    Ok(())
}

fn check_integrity(engine: &SyncEngine) -> SyncResult<()> {
    let report = engine.store.verify()?;
    if report.is_clean() {
        return Ok(());
    }
    let problems: Vec<&str> = report.all_problems().map(String::as_str).collect();
    Err(SyncError::Integrity(problems.join("; ")))
}

/// Rebases the related operation on the current remote version.
async fn resolve_conflict(engine: &Arc<SyncEngine>, error: &ErrorRecord) -> SyncResult<()> {
    for key in affected(error) {
        if let Some(conflict) = engine.store.active_conflict(&key) {
            if conflict.resolution == ConflictResolution::Manual {
                return Err(SyncError::Conflict {
                    entity: key.to_string(),
                    message: format!("waiting on manual decision {}", conflict.id),
                });
            }
        }
    }

    let Some(op) = error.related_operation.and_then(|id| engine.store.get(&id)) else {
        return Ok(());
    };
    let Some(key) = op.entity_key() else {
        return Ok(());
    };
    if matches!(op.status, OperationStatus::Pending | OperationStatus::Failed) {
        if let Some(remote) = engine.remote.fetch(&key.entity_type, &key.entity_id).await? {
            engine.store.update(&op.id, WriteOrigin::Sync, |o| {
                o.base_version = Some(remote.updated_at);
            })?;
            debug!(operation_id = %op.id, base_version = %remote.updated_at, "operation rebased");
        }
    }
    engine.kick();
    Ok(())
}
