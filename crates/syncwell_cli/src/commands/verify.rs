//! Verify command implementation.

use super::open_store;
use std::path::Path;

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {:?}", path);
    println!();

    let (store, opened) = open_store(path)?;
    for (table, replay) in &opened.tables {
        if replay.truncated_bytes > 0 {
            println!(
                "  {}: truncated {} torn bytes on open",
                table, replay.truncated_bytes
            );
        }
    }

    let report = store.verify()?;
    for (table, result) in &report.tables {
        println!(
            "  {:<10} {} frames, {} records{}",
            table,
            result.frames,
            result.rows,
            if result.is_clean() { "" } else { " (problems)" }
        );
    }

    println!();
    if report.is_clean() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        for problem in report.all_problems() {
            println!("  - {}", problem);
        }
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}
