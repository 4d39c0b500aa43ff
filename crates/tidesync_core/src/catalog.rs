//! Persisted schema catalog.
//!
//! The catalog records, for every table ever opened, its primary column and
//! its secondary indexes. Declared schemas are compared against it at open
//! time to work out which tables to create and which indexes to build or
//! drop. The catalog is a single-frame journal rewritten atomically on every
//! save.

use crate::error::{CoreError, CoreResult};
use crate::journal::{Frame, Journal};
use crate::schema::TableSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tidesync_codec::{from_cbor, to_cbor};
use tidesync_storage::StorageBackend;

pub(crate) const CATALOG_MAGIC: [u8; 4] = *b"TSCT";
const CATALOG_FRAME: u8 = 1;
const CATALOG_VERSION: u16 = 1;

/// What the catalog remembers about one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Primary column name.
    pub primary: String,
    /// Indexed column names.
    pub indexes: BTreeSet<String>,
}

impl TableEntry {
    /// Builds the entry a schema declares.
    pub fn from_schema(schema: &TableSchema) -> CoreResult<Self> {
        let primary = schema.primary_column().ok_or_else(|| {
            CoreError::invalid_schema(format!("table {} has no single primary column", schema.name))
        })?;
        Ok(Self {
            primary: primary.name.clone(),
            indexes: schema.indexed_columns().map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogImage {
    version: u16,
    tables: BTreeMap<String, TableEntry>,
}

/// One step needed to bring persisted state in line with declared schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// A declared table is not in the catalog yet.
    CreateTable {
        /// Table name.
        table: String,
        /// Declared entry.
        entry: TableEntry,
    },
    /// The declared primary column differs from the persisted one.
    ChangePrimary {
        /// Table name.
        table: String,
        /// Persisted primary column.
        from: String,
        /// Declared primary column.
        to: String,
    },
    /// A declared index does not exist yet.
    AddIndex {
        /// Table name.
        table: String,
        /// Column to index.
        column: String,
    },
    /// A persisted index is no longer declared.
    DropIndex {
        /// Table name.
        table: String,
        /// Indexed column.
        column: String,
    },
}

/// The persisted catalog.
#[derive(Debug)]
pub struct Catalog {
    journal: Journal,
    tables: BTreeMap<String, TableEntry>,
}

impl Catalog {
    /// Loads the catalog from a backend. An empty backend is an empty catalog.
    ///
    /// # Errors
    ///
    /// Returns a corruption or codec error if the stored image is invalid.
    pub fn load(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> CoreResult<Self> {
        let mut journal = Journal::new("catalog", CATALOG_MAGIC, backend, sync_on_write);
        let frames = journal.replay()?;

        let tables = match frames.last() {
            None => BTreeMap::new(),
            Some(frame) if frame.kind == CATALOG_FRAME => {
                let image: CatalogImage = from_cbor(&frame.payload)?;
                if image.version != CATALOG_VERSION {
                    return Err(CoreError::journal_corruption(format!(
                        "unsupported catalog version {}",
                        image.version
                    )));
                }
                image.tables
            }
            Some(frame) => {
                return Err(CoreError::journal_corruption(format!(
                    "unknown catalog frame kind {}",
                    frame.kind
                )))
            }
        };

        Ok(Self { journal, tables })
    }

    /// Returns the entry for a table.
    pub fn get(&self, table: &str) -> Option<&TableEntry> {
        self.tables.get(table)
    }

    /// Returns every table entry, ordered by name.
    pub fn tables(&self) -> &BTreeMap<String, TableEntry> {
        &self.tables
    }

    /// Lists the changes needed to match `schemas`.
    ///
    /// Tables in the catalog that are not declared produce no change: their
    /// data stays where it is.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` if a schema has no single primary column.
    pub fn plan(&self, schemas: &[TableSchema]) -> CoreResult<Vec<SchemaChange>> {
        let mut changes = Vec::new();

        for schema in schemas {
            let declared = TableEntry::from_schema(schema)?;
            let table = schema.name.clone();

            let Some(existing) = self.tables.get(&table) else {
                changes.push(SchemaChange::CreateTable {
                    table,
                    entry: declared,
                });
                continue;
            };

            if existing.primary != declared.primary {
                changes.push(SchemaChange::ChangePrimary {
                    table: table.clone(),
                    from: existing.primary.clone(),
                    to: declared.primary.clone(),
                });
            }
            for column in declared.indexes.difference(&existing.indexes) {
                changes.push(SchemaChange::AddIndex {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
            for column in existing.indexes.difference(&declared.indexes) {
                changes.push(SchemaChange::DropIndex {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }

        Ok(changes)
    }

    /// Records the declared entry for a table (in memory only).
    pub fn set(&mut self, table: impl Into<String>, entry: TableEntry) {
        self.tables.insert(table.into(), entry);
    }

    /// Persists the catalog atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be encoded or written.
    pub fn save(&mut self) -> CoreResult<()> {
        let image = CatalogImage {
            version: CATALOG_VERSION,
            tables: self.tables.clone(),
        };
        let frame = Frame::new(CATALOG_FRAME, to_cbor(&image)?);
        self.journal.rewrite(&[frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;
    use tidesync_storage::InMemoryBackend;

    fn tasks(indexes: &[&str]) -> TableSchema {
        let mut schema = TableSchema::new("tasks").column(ColumnDef::new("id").primary());
        for column in indexes {
            schema = schema.column(ColumnDef::new(*column).indexed());
        }
        schema
    }

    fn load(backend: &InMemoryBackend) -> Catalog {
        Catalog::load(Box::new(backend.clone()), true).unwrap()
    }

    #[test]
    fn empty_catalog_plans_creation() {
        let catalog = load(&InMemoryBackend::new());
        let plan = catalog.plan(&[tasks(&["project"])]).unwrap();
        assert_eq!(
            plan,
            vec![SchemaChange::CreateTable {
                table: "tasks".into(),
                entry: TableEntry {
                    primary: "id".into(),
                    indexes: ["project".to_string()].into_iter().collect(),
                },
            }]
        );
    }

    #[test]
    fn saved_catalog_survives_reload() {
        let backend = InMemoryBackend::new();
        let mut catalog = load(&backend);
        catalog.set("tasks", TableEntry::from_schema(&tasks(&["project"])).unwrap());
        catalog.save().unwrap();

        let reloaded = load(&backend);
        assert_eq!(reloaded.get("tasks").unwrap().primary, "id");
        assert!(reloaded.plan(&[tasks(&["project"])]).unwrap().is_empty());
    }

    #[test]
    fn index_differences_are_planned() {
        let backend = InMemoryBackend::new();
        let mut catalog = load(&backend);
        catalog.set("tasks", TableEntry::from_schema(&tasks(&["a", "b"])).unwrap());

        let plan = catalog.plan(&[tasks(&["b", "c"])]).unwrap();
        assert_eq!(
            plan,
            vec![
                SchemaChange::AddIndex {
                    table: "tasks".into(),
                    column: "c".into()
                },
                SchemaChange::DropIndex {
                    table: "tasks".into(),
                    column: "a".into()
                },
            ]
        );
    }

    #[test]
    fn primary_change_is_planned() {
        let mut catalog = load(&InMemoryBackend::new());
        catalog.set("tasks", TableEntry::from_schema(&tasks(&[])).unwrap());

        let renamed = TableSchema::new("tasks").column(ColumnDef::new("uuid").primary());
        assert_eq!(
            catalog.plan(&[renamed]).unwrap(),
            vec![SchemaChange::ChangePrimary {
                table: "tasks".into(),
                from: "id".into(),
                to: "uuid".into(),
            }]
        );
    }

    #[test]
    fn undeclared_tables_are_left_alone() {
        let mut catalog = load(&InMemoryBackend::new());
        catalog.set("archive", TableEntry::from_schema(&tasks(&[])).unwrap());
        assert!(catalog.plan(&[]).unwrap().is_empty());
        assert!(catalog.get("archive").is_some());
    }
}
