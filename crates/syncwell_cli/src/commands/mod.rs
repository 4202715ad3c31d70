//! CLI command implementations.

pub mod compact;
pub mod dump_queue;
pub mod inspect;
pub mod retry_failed;
pub mod verify;

use std::path::Path;
use syncwell_store::{OpenReport, OperationStore, StoreConfig};
use tracing::{debug, info};

/// Opens an existing store directory.
///
/// Fails if the directory is missing or another process holds its lock.
pub fn open_store(path: &Path) -> Result<(OperationStore, OpenReport), Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {:?}", path).into());
    }
    debug!("Opening store at {:?}", path);
    let config = StoreConfig::new().create_if_missing(false);
    let (store, report) = OperationStore::open(path, config)?;
    if report.requeued > 0 {
        info!("{} in-flight operation(s) returned to the queue", report.requeued);
    }
    Ok((store, report))
}

/// Formats a byte count for text output.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
