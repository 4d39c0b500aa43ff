//! Pending command implementation.

use super::open_existing;
use serde::Serialize;
use std::path::Path;
use tidesync_codec::Record;
use tidesync_core::Database;

/// The merged action waiting for one entity.
#[derive(Debug, Serialize)]
pub struct PendingInfo {
    /// Entity as `table/id`.
    pub key: String,
    /// `create`, `update` or `delete`.
    pub action: &'static str,
    /// Highest entry folded into the action.
    pub watermark: u64,
    /// Number of entries folded into the action.
    pub entries: usize,
    /// Merged fields, absent for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Record>,
}

/// Runs the pending command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let pending = collect(&db);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&pending)?);
        }
        _ => {
            if pending.is_empty() {
                println!("Nothing pending");
            }
            for info in &pending {
                print!(
                    "{} {} (entries: {}, watermark: {})",
                    info.key, info.action, info.entries, info.watermark
                );
                match &info.data {
                    Some(data) => println!(" {}", serde_json::to_string(data)?),
                    None => println!(),
                }
            }
        }
    }

    Ok(())
}

fn collect(db: &Database) -> Vec<PendingInfo> {
    db.pending_keys()
        .iter()
        .filter_map(|key| db.merged(key))
        .map(|merged| PendingInfo {
            key: merged.key.to_string(),
            action: merged.action.kind(),
            watermark: merged.watermark.as_u64(),
            entries: merged.entry_count,
            data: merged.action.data().cloned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_codec::{record, Value};
    use tidesync_core::{ColumnDef, EntityId, TableSchema};

    #[test]
    fn one_merged_action_per_entity() {
        let db = Database::open_in_memory(vec![
            TableSchema::new("tasks").column(ColumnDef::new("id").primary())
        ])
        .unwrap();
        db.write("tasks", record! { "id" => "t1", "title" => "a" })
            .unwrap();
        db.write("tasks", record! { "id" => "t1", "title" => "b" })
            .unwrap();
        db.write("tasks", record! { "id" => "t2", "title" => "c" })
            .unwrap();
        db.delete("tasks", &EntityId::from("t2")).unwrap();

        let pending = collect(&db);
        assert_eq!(pending.len(), 2);

        assert_eq!(pending[0].key, "tasks/t1");
        assert_eq!(pending[0].action, "create");
        assert_eq!(pending[0].entries, 2);
        let data = pending[0].data.as_ref().unwrap();
        assert_eq!(data["title"], Value::from("b"));

        assert_eq!(pending[1].key, "tasks/t2");
        assert_eq!(pending[1].action, "delete");
        assert!(pending[1].data.is_none());
        assert_eq!(pending[1].watermark, db.log().next_entry_id().as_u64() - 1);
    }
}
