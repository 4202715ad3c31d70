//! Compact command implementation.

use super::{format_size, open_store};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let (store, _) = open_store(path)?;
    let stats = store.stats()?;

    println!("Compacting store at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();
    println!("  Log size:    {} bytes", format_size(stats.log_bytes));
    println!("  Dead frames: {}", stats.dead_frames);

    if dry_run {
        return Ok(());
    }

    let summary = store.compact()?;
    println!();
    for (table, report) in &summary.tables {
        println!(
            "  {:<10} {} -> {} bytes ({} frames dropped)",
            table,
            format_size(report.bytes_before),
            format_size(report.bytes_after),
            report.frames_dropped
        );
    }
    println!();
    println!(
        "✓ Compaction complete, {} bytes reclaimed",
        format_size(summary.bytes_reclaimed())
    );
    Ok(())
}
