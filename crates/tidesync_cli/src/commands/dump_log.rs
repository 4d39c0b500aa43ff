//! Dump-log command implementation.

use super::open_existing;
use std::path::Path;
use tidesync_core::LogEntry;

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let entries = select(db.pending_entries(), limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("Pending log at {:?}", path);
            println!();
            for entry in &entries {
                println!("{}", format_entry(entry)?);
            }
            println!();
            println!("{} entries shown", entries.len());
        }
    }

    Ok(())
}

fn select(mut entries: Vec<LogEntry>, limit: Option<usize>) -> Vec<LogEntry> {
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    entries
}

fn format_entry(entry: &LogEntry) -> Result<String, serde_json::Error> {
    let mut line = format!(
        "#{:<6} ts={} {} {}",
        entry.entry_id.as_u64(),
        entry.timestamp,
        entry.action.kind(),
        entry.key
    );
    if let Some(data) = entry.action.data() {
        line.push(' ');
        line.push_str(&serde_json::to_string(data)?);
    }
    Ok(line)
}
