//! TideSync CLI
//!
//! Command-line tools for inspecting and maintaining TideSync databases.
//!
//! # Commands
//!
//! - `inspect` - Display tables, indexes and pending counts
//! - `dump-log` - Dump pending-log entries
//! - `pending` - Show the merged action per pending entity
//! - `verify` - Check every journal without repairing it
//! - `compact` - Compact the store and log journals

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TideSync command-line database tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
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
    /// Display tables, indexes and pending counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump pending-log entries in entry order
    DumpLog {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the merged action waiting for each entity
    Pending {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal integrity
    Verify,

    /// Compact the store and log journals
    Compact,

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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpLog { limit, format } => {
            let path = cli.path.ok_or("Database path required for dump-log")?;
            commands::dump_log::run(&path, limit, &format)?;
        }
        Commands::Pending { format } => {
            let path = cli.path.ok_or("Database path required for pending")?;
            commands::pending::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Database path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact => {
            let path = cli.path.ok_or("Database path required for compact")?;
            commands::compact::run(&path)?;
        }
        Commands::Version => {
            println!("TideSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("TideSync Core v{}", tidesync_core::VERSION);
        }
    }

    Ok(())
}
