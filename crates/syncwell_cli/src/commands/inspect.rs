//! Inspect command implementation.

use super::{format_size, open_store};
use serde::Serialize;
use std::path::Path;
use syncwell_store::StoreStats;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Counters from the store.
    pub stats: StoreStats,
    /// In-flight operations returned to pending on open.
    pub requeued: usize,
    /// Torn bytes truncated from log tails on open.
    pub truncated_bytes: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (store, report) = open_store(path)?;
    let result = InspectResult {
        path: path.display().to_string(),
        stats: store.stats()?,
        requeued: report.requeued,
        truncated_bytes: report.tables.iter().map(|(_, r)| r.truncated_bytes).sum(),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    let ops = &result.stats.operations;
    println!("Syncwell Store Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Operations:");
    println!("  Pending:   {}", ops.pending);
    println!("  In flight: {}", ops.in_flight);
    println!("  Completed: {}", ops.completed);
    println!("  Failed:    {}", ops.failed);
    println!("  Isolated:  {}", ops.isolated);
    println!("  Archived:  {}", ops.archived);
    println!();
    println!("Conflicts:");
    println!("  Active: {}", result.stats.active_conflicts);
    println!("  Total:  {}", result.stats.conflicts);
    println!();
    println!("Errors:");
    println!("  Active: {}", result.stats.active_errors);
    println!("  Total:  {}", result.stats.errors);
    println!();
    println!("Storage:");
    println!("  Log size:    {} bytes", format_size(result.stats.log_bytes));
    println!("  Dead frames: {}", result.stats.dead_frames);

    if result.requeued > 0 || result.truncated_bytes > 0 {
        println!();
        println!("Recovered on open:");
        println!("  Requeued operations: {}", result.requeued);
        println!("  Truncated bytes:     {}", result.truncated_bytes);
    }
}
