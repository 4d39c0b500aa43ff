//! Compact command implementation.

use super::format_size;
use std::path::Path;
use tidesync_core::{Config, Database};

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Journal bytes (store + log) before compaction.
    pub bytes_before: u64,
    /// Journal bytes (store + log) after compaction.
    pub bytes_after: u64,
}

/// Runs the compact command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting journals at {:?}", path);
    println!();

    let db = Database::open(path, Config::default().create_if_missing(false), Vec::new())?;
    let stats = compact(&db)?;

    println!("  Size before: {}", format_size(stats.bytes_before));
    println!("  Size after:  {}", format_size(stats.bytes_after));
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(stats.bytes_before.saturating_sub(stats.bytes_after)),
        if stats.bytes_before > 0 {
            (stats.bytes_before.saturating_sub(stats.bytes_after) as f64
                / stats.bytes_before as f64)
                * 100.0
        } else {
            0.0
        }
    );
    println!();
    println!("✓ Compaction complete");

    Ok(())
}

fn compact(db: &Database) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let (store, log) = db.journal_sizes()?;
    db.compact()?;
    let (store_after, log_after) = db.journal_sizes()?;
    Ok(CompactStats {
        bytes_before: store + log,
        bytes_after: store_after + log_after,
    })
}
