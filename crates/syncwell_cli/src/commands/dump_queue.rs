//! Dump-queue command implementation.

use super::open_store;
use serde::Serialize;
use std::path::Path;
use syncwell_protocol::{Operation, OperationStatus};
use syncwell_store::OperationStore;

/// One listed operation.
#[derive(Debug, Serialize)]
pub struct QueueEntry {
    /// Operation id.
    pub id: String,
    /// Mutation type.
    pub kind: &'static str,
    /// `type:id`, or the type alone when the id is unknown.
    pub entity: String,
    /// Status.
    pub status: &'static str,
    /// Priority.
    pub priority: &'static str,
    /// Submission order.
    pub sequence: u64,
    /// Retries consumed and allowed.
    pub retries: String,
    /// Last failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&Operation> for QueueEntry {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.to_string(),
            kind: op.kind.as_str(),
            entity: op
                .entity_key()
                .map_or_else(|| op.entity_type.clone(), |key| key.to_string()),
            status: op.status.as_str(),
            priority: op.priority.as_str(),
            sequence: op.sequence,
            retries: format!("{}/{}", op.retry_count, op.max_retries),
            last_error: op.last_error.clone(),
        }
    }
}

/// Runs the dump-queue command.
pub fn run(
    path: &Path,
    status: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, _) = open_store(path)?;
    let entries = collect(&store, status, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            for entry in &entries {
                println!(
                    "{:>6} {} {:<6} {:<9} {:<8} {:<24} retries {}",
                    entry.sequence,
                    entry.id,
                    entry.kind,
                    entry.status,
                    entry.priority,
                    entry.entity,
                    entry.retries
                );
                if let Some(error) = &entry.last_error {
                    println!("       last error: {}", error);
                }
            }
            println!("{} operation(s)", entries.len());
        }
    }

    Ok(())
}

/// Lists live operations, in dispatch order when a status is given and in
/// submission order otherwise.
pub fn collect(
    store: &OperationStore,
    status: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<QueueEntry>, Box<dyn std::error::Error>> {
    let ops = match status {
        Some(name) => {
            let status = OperationStatus::parse(name)
                .ok_or_else(|| format!("Unknown status {:?}", name))?;
            store.with_status(status)
        }
        None => store.operations(),
    };
    Ok(ops
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(QueueEntry::from)
        .collect())
}
