//! CLI command implementations.

pub mod compact;
pub mod dump_log;
pub mod inspect;
pub mod pending;
pub mod verify;

use std::path::Path;
use tidesync_core::{Config, Database};

/// Opens an existing database with the tables recorded in its catalog.
///
/// Automatic compaction is off so read-only commands leave the journals as
/// they found them, apart from truncating a torn tail on replay.
pub(crate) fn open_existing(path: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    let config = Config::default()
        .create_if_missing(false)
        .compaction_threshold(0);
    tracing::debug!(path = %path.display(), "opening database");
    Ok(Database::open(path, config, Vec::new())?)
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
