//! Syncwell CLI
//!
//! Maintenance tools for an on-disk Syncwell operation store.
//!
//! # Commands
//!
//! - `inspect` - Display queue, conflict, and error counts
//! - `dump-queue` - List queued operations
//! - `verify` - Verify every log and cross-record reference
//! - `compact` - Rewrite logs to drop dead frames
//! - `retry-failed` - Return failed operations to the queue

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Syncwell operation store tools.
#[derive(Parser)]
#[command(name = "syncwell")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display queue, conflict, and error counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued operations
    DumpQueue {
        /// Only operations with this status
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of operations to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify every log and cross-record reference
    Verify,

    /// Rewrite logs to drop dead frames
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Return failed operations to the queue
    RetryFailed {
        /// Operation ids to reset (all failed operations if omitted)
        ids: Vec<String>,

        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpQueue {
            status,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-queue")?;
            commands::dump_queue::run(&path, status.as_deref(), limit, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::RetryFailed { ids, dry_run } => {
            let path = cli.path.ok_or("Store path required for retry-failed")?;
            commands::retry_failed::run(&path, &ids, dry_run)?;
        }
        Commands::Version => {
            println!("Syncwell CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Syncwell Store v{}", syncwell_store::VERSION);
        }
    }

    Ok(())
}
