//! Retry-failed command implementation.

use super::open_store;
use std::path::Path;
use syncwell_protocol::{OperationId, OperationStatus, Timestamp};
use syncwell_store::{OperationStore, WriteOrigin};

/// Runs the retry-failed command.
pub fn run(path: &Path, ids: &[String], dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let (store, _) = open_store(path)?;
    let targets = targets(&store, ids)?;

    if dry_run {
        println!("(dry run - no changes will be made)");
        for id in &targets {
            println!("  would reset {}", id);
        }
        println!("{} operation(s) would be reset", targets.len());
        return Ok(());
    }

    let reset = reset(&store, &targets)?;
    println!("✓ {} operation(s) returned to the queue", reset);
    Ok(())
}

/// Resolves the operations to reset: the named ones, or every failed one.
pub fn targets(
    store: &OperationStore,
    ids: &[String],
) -> Result<Vec<OperationId>, Box<dyn std::error::Error>> {
    if ids.is_empty() {
        return Ok(store
            .with_status(OperationStatus::Failed)
            .into_iter()
            .map(|op| op.id)
            .collect());
    }
    ids.iter()
        .map(|raw| -> Result<OperationId, Box<dyn std::error::Error>> {
            let id = OperationId::parse(raw)
                .ok_or_else(|| format!("Invalid operation id {:?}", raw))?;
            let op = store.get(&id).ok_or_else(|| format!("{} not found", id))?;
            if op.status != OperationStatus::Failed {
                return Err(format!("{} is {}, not failed", id, op.status).into());
            }
            Ok(id)
        })
        .collect()
}

/// Moves failed operations back to pending with a fresh retry budget.
pub fn reset(
    store: &OperationStore,
    ids: &[OperationId],
) -> Result<usize, Box<dyn std::error::Error>> {
    let now = Timestamp::now();
    for id in ids {
        store.transition(id, OperationStatus::Pending, WriteOrigin::Local, now, |op| {
            op.retry_count = 0;
        })?;
    }
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncwell_protocol::{NewOperation, Operation};
    use syncwell_store::StoreConfig;
    use tempfile::tempdir;

    fn failed(store: &OperationStore, id: &str) -> Operation {
        let request = NewOperation::update("card", id, json!({ "n": 1 }));
        let op = store
            .insert(Operation::from_request(request, 3, Timestamp::from_millis(1)))
            .unwrap();
        let now = Timestamp::from_millis(2);
        store
            .transition(&op.id, OperationStatus::InFlight, WriteOrigin::Sync, now, |_| {})
            .unwrap();
        store
            .transition(&op.id, OperationStatus::Failed, WriteOrigin::Sync, now, |o| {
                o.retry_count = 3;
                o.last_error = Some("network error".into());
            })
            .unwrap()
    }

    #[test]
    fn resets_every_failed_operation_and_persists() {
        let dir = tempdir().unwrap();
        let first;
        {
            let (store, _) = OperationStore::open(dir.path(), StoreConfig::new()).unwrap();
            first = failed(&store, "c1");
            failed(&store, "c2");
            let all = targets(&store, &[]).unwrap();
            assert_eq!(reset(&store, &all).unwrap(), 2);
        }

        let (store, _) = open_store(dir.path()).unwrap();
        let op = store.get(&first.id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(store.counts().pending, 2);
    }

    #[test]
    fn named_operations_must_be_failed() {
        let store = OperationStore::in_memory().unwrap();
        let op = failed(&store, "c1");
        let pending = store
            .insert(Operation::from_request(
                NewOperation::delete("card", "c2"),
                3,
                Timestamp::from_millis(1),
            ))
            .unwrap();

        assert_eq!(targets(&store, &[op.id.to_string()]).unwrap(), vec![op.id]);
        assert!(targets(&store, &[pending.id.to_string()]).is_err());
        assert!(targets(&store, &["nope".to_string()]).is_err());
    }
}
