//! Inspect command implementation.

use super::{format_size, open_existing};
use serde::Serialize;
use std::path::Path;
use tidesync_core::Database;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Store journal size in bytes.
    pub store_size: u64,
    /// Pending-log journal size in bytes.
    pub log_size: u64,
    /// Tables known to the catalog or the store.
    pub tables: Vec<TableInfo>,
    /// Number of pending-log entries.
    pub pending_entries: usize,
    /// Entities with at least one pending entry.
    pub pending_keys: Vec<String>,
}

/// Details of a single table.
#[derive(Debug, Serialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Primary column, if the catalog records one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    /// Indexed columns.
    pub indexes: Vec<String>,
    /// Number of records.
    pub records: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let result = collect(&db, path)?;

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

fn collect(db: &Database, path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let (store_size, log_size) = db.journal_sizes()?;

    let mut tables = Vec::new();
    for name in db.tables() {
        let entry = db.catalog_entry(&name);
        tables.push(TableInfo {
            primary: entry.map(|e| e.primary.clone()),
            indexes: entry
                .map(|e| e.indexes.iter().cloned().collect())
                .unwrap_or_default(),
            records: db.count(&name)?,
            name,
        });
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        store_size,
        log_size,
        tables,
        pending_entries: db.log().len(),
        pending_keys: db.pending_keys().iter().map(ToString::to_string).collect(),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("TideSync Database Inspection");
    println!("============================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Store journal: {}", format_size(result.store_size));
    println!("  Pending log:   {}", format_size(result.log_size));
    println!();
    println!("Tables:");
    if result.tables.is_empty() {
        println!("  (none)");
    }
    for table in &result.tables {
        let primary = table.primary.as_deref().unwrap_or("?");
        let indexes = if table.indexes.is_empty() {
            "-".to_string()
        } else {
            table.indexes.join(", ")
        };
        println!(
            "  {} (primary: {}, indexes: {}) {} records",
            table.name, primary, indexes, table.records
        );
    }
    println!();
    println!("Pending:");
    println!("  Entries:  {}", result.pending_entries);
    println!("  Entities: {}", result.pending_keys.len());
    for key in &result.pending_keys {
        println!("    {}", key);
    }
}
