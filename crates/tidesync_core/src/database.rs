//! Database facade.
//!
//! A [`Database`] owns the schema catalog, the entity store and the
//! pending-change log, and performs every local mutation as one critical
//! section: read the existing record, write the new state, append the log
//! entry. If the log append fails, the store write is undone, so the log
//! never misses a mutation the store has seen.

use crate::catalog::{Catalog, SchemaChange, TableEntry};
use crate::config::Config;
use crate::dir::{self, DatabaseDir};
use crate::entity::EntityStore;
use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::pending::{merge_entries, LogEntry, MergedAction, PendingAction, PendingLog};
use crate::schema::{validate_schemas, TableSchema};
use crate::types::{EntityId, EntityKey, EntryId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tidesync_codec::{Record, Value};
use tidesync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tracing::{error, info, warn};

/// The three backends a database persists to.
pub struct Backends {
    /// Schema catalog.
    pub catalog: Box<dyn StorageBackend>,
    /// Entity store journal.
    pub store: Box<dyn StorageBackend>,
    /// Pending-change log journal.
    pub log: Box<dyn StorageBackend>,
}

impl Backends {
    /// Fresh in-memory backends.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            catalog: Box::new(InMemoryBackend::new()),
            store: Box::new(InMemoryBackend::new()),
            log: Box::new(InMemoryBackend::new()),
        }
    }
}

/// Result of an accepted write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Entity written.
    pub key: EntityKey,
    /// The record as stored, defaults applied.
    pub record: Record,
    /// Log entry recording the write.
    pub entry_id: EntryId,
    /// True if no record existed before the write.
    pub created: bool,
}

/// Integrity summary of one journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalReport {
    /// Journal name.
    pub name: &'static str,
    /// Number of complete frames.
    pub frames: usize,
    /// Bytes covered by complete frames.
    pub bytes: u64,
    /// Bytes of an interrupted trailing frame.
    pub torn_bytes: u64,
}

/// Integrity summary of a database directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Per-journal frame counts.
    pub journals: Vec<JournalReport>,
    /// Tables in the catalog.
    pub tables: usize,
    /// Records across all tables.
    pub records: usize,
    /// Live pending-log entries.
    pub pending_entries: usize,
}

/// An open TideSync database.
#[derive(Debug)]
pub struct Database {
    config: Config,
    dir: Option<DatabaseDir>,
    schemas: HashMap<String, TableSchema>,
    catalog: Catalog,
    store: EntityStore,
    log: PendingLog,
    /// Serializes check-then-write-then-append.
    write_lock: Mutex<()>,
}

impl Database {
    /// Opens (or creates) a database directory and applies `schemas`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another owner holds the directory (`DatabaseLocked`)
    /// - A schema is malformed (`InvalidSchema`)
    /// - A declared primary column conflicts with stored data (`SchemaMismatch`)
    /// - A journal is corrupted
    /// - I/O errors occur
    pub fn open(path: &Path, config: Config, schemas: Vec<TableSchema>) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        let backends = Backends {
            catalog: Box::new(FileBackend::open(&dir.catalog_path())?),
            store: Box::new(FileBackend::open(&dir.store_path())?),
            log: Box::new(FileBackend::open(&dir.log_path())?),
        };
        info!(path = %path.display(), "opening database");
        Self::assemble(config, Some(dir), backends, schemas)
    }

    /// Opens a database over caller-supplied backends.
    ///
    /// # Errors
    ///
    /// Same as [`Database::open`], minus locking.
    pub fn open_with_backends(
        config: Config,
        backends: Backends,
        schemas: Vec<TableSchema>,
    ) -> CoreResult<Self> {
        Self::assemble(config, None, backends, schemas)
    }

    /// Opens a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema is invalid.
    pub fn open_in_memory(schemas: Vec<TableSchema>) -> CoreResult<Self> {
        Self::open_with_backends(Config::default(), Backends::in_memory(), schemas)
    }

    fn assemble(
        config: Config,
        dir: Option<DatabaseDir>,
        backends: Backends,
        schemas: Vec<TableSchema>,
    ) -> CoreResult<Self> {
        validate_schemas(&schemas)?;

        let mut catalog = Catalog::load(backends.catalog, config.sync_on_write)?;
        let store = EntityStore::open(
            backends.store,
            config.sync_on_write,
            config.compaction_threshold,
            catalog.tables(),
        )?;
        let log = PendingLog::open(
            backends.log,
            config.sync_on_write,
            config.compaction_threshold,
        )?;

        apply_schemas(&mut catalog, &store, &log, &schemas)?;

        info!(
            tables = store.tables().len(),
            pending = log.len(),
            "database ready"
        );

        Ok(Self {
            config,
            dir,
            schemas: schemas.into_iter().map(|s| (s.name.clone(), s)).collect(),
            catalog,
            store,
            log,
            write_lock: Mutex::new(()),
        })
    }

    /// Writes a record to `table`.
    ///
    /// The record is projected onto the table schema (defaults applied,
    /// undeclared fields dropped), stored, and recorded in the pending log
    /// as a `Create` if no record with that key existed, else an `Update`
    /// carrying the full record. Both are durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` for undeclared tables, `InvalidPrimaryKey` if
    /// the record has no valid key after defaulting, or a storage error. On
    /// error neither the store nor the log is changed, except for
    /// `UnloggedWrite`: the store write stands without a log entry.
    pub fn write(&self, table: &str, record: Record) -> CoreResult<WriteOutcome> {
        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| CoreError::unknown_table(table))?;
        let record = schema.apply_defaults(record);
        let id = schema.extract_id(&record)?;

        let _guard = self.write_lock.lock();
        let (_, previous) = self.store.put(table, record.clone())?;

        let created = previous.is_none();
        let action = if created {
            PendingAction::Create {
                id: id.clone(),
                data: record.clone(),
            }
        } else {
            PendingAction::Update {
                id: id.clone(),
                data: record.clone(),
            }
        };

        let key = EntityKey::new(table, id.clone());
        let entry_id = match self.log.append(key.clone(), action) {
            Ok(entry_id) => entry_id,
            Err(e) => return Err(self.compensate(table, &id, previous, e)),
        };

        Ok(WriteOutcome {
            key,
            record,
            entry_id,
            created,
        })
    }

    /// Deletes a record from `table`.
    ///
    /// Returns the id of the `Delete` log entry, or `None` if no record had
    /// that key (nothing is logged then).
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` for undeclared tables or a storage error. On
    /// error neither the store nor the log is changed, except for
    /// `UnloggedWrite` as in [`Database::write`].
    pub fn delete(&self, table: &str, id: &EntityId) -> CoreResult<Option<EntryId>> {
        if !self.schemas.contains_key(table) {
            return Err(CoreError::unknown_table(table));
        }

        let _guard = self.write_lock.lock();
        let Some(previous) = self.store.delete(table, id)? else {
            return Ok(None);
        };

        let key = EntityKey::new(table, id.clone());
        match self
            .log
            .append(key, PendingAction::Delete { id: id.clone() })
        {
            Ok(entry_id) => Ok(Some(entry_id)),
            Err(e) => Err(self.compensate(table, id, Some(previous), e)),
        }
    }

    /// Puts the store back the way it was before a write whose log append
    /// failed with `cause`, and returns the error to report.
    ///
    /// `cause` is returned when the undo succeeds. Otherwise the store keeps
    /// a change with no log entry, reported as `UnloggedWrite`.
    fn compensate(
        &self,
        table: &str,
        id: &EntityId,
        previous: Option<Record>,
        cause: CoreError,
    ) -> CoreError {
        let undo = match previous {
            Some(record) => self.store.put(table, record).map(|_| ()),
            None => self.store.delete(table, id).map(|_| ()),
        };
        match undo {
            Ok(()) => cause,
            Err(undo) => {
                error!(table, id = %id, error = %undo, "could not undo store write after log failure");
                CoreError::UnloggedWrite {
                    table: table.to_string(),
                    id: id.to_string(),
                    message: format!("log append failed: {cause}; undo failed: {undo}"),
                }
            }
        }
    }

    /// Replaces the whole content of `table` with an authoritative snapshot.
    ///
    /// The pending log is not touched: local writes that were not yet
    /// acknowledged are still dispatched later. Returns the new record count.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable`, `InvalidPrimaryKey` if any record lacks a
    /// valid key (the table is left as it was), or a storage error.
    pub fn reconcile(&self, table: &str, records: Vec<Record>) -> CoreResult<usize> {
        let _guard = self.write_lock.lock();
        let count = self.store.replace_all(table, records)?;
        info!(table, records = count, "table reconciled");
        Ok(count)
    }

    /// Purges every pending entry for `key`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the purge cannot be recorded.
    pub fn acknowledge(&self, key: &EntityKey) -> CoreResult<usize> {
        self.log.purge(key)
    }

    /// Purges the entries for `key` up to and including `watermark`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the purge cannot be recorded.
    pub fn acknowledge_through(&self, key: &EntityKey, watermark: EntryId) -> CoreResult<usize> {
        self.log.purge_through(key, watermark)
    }

    /// Merges the pending entries for `key`.
    pub fn merged(&self, key: &EntityKey) -> Option<MergedAction> {
        merge_entries(&self.log.entries_for(key))
    }

    /// Returns the record with primary key `id`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn get(&self, table: &str, id: &EntityId) -> CoreResult<Option<Record>> {
        self.store.get(table, id)
    }

    /// Returns every record of `table`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn get_all(&self, table: &str) -> CoreResult<Vec<Record>> {
        self.store.get_all(table)
    }

    /// Returns the records of `table` whose indexed `column` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` or `InvalidArgument` for unindexed columns.
    pub fn find_by(&self, table: &str, column: &str, value: &Value) -> CoreResult<Vec<Record>> {
        self.store.find_by(table, column, value)
    }

    /// Returns the number of records in `table`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn count(&self, table: &str) -> CoreResult<usize> {
        self.store.count(table)
    }

    /// Returns every table name, declared or retained from the catalog.
    pub fn tables(&self) -> Vec<String> {
        self.store.tables()
    }

    /// Returns the declared schema of `table`.
    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.schemas.get(table)
    }

    /// Returns the persisted catalog entry of `table`.
    pub fn catalog_entry(&self, table: &str) -> Option<&TableEntry> {
        self.catalog.get(table)
    }

    /// Returns the pending log.
    pub fn log(&self) -> &PendingLog {
        &self.log
    }

    /// Returns every pending entry in append order.
    pub fn pending_entries(&self) -> Vec<LogEntry> {
        self.log.all_entries()
    }

    /// Returns the keys with pending entries, oldest first.
    pub fn pending_keys(&self) -> Vec<EntityKey> {
        self.log.pending_keys()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the directory path for persistent databases.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(DatabaseDir::path)
    }

    /// Compacts both journals now.
    ///
    /// # Errors
    ///
    /// Returns an error if a snapshot cannot be written.
    pub fn compact(&self) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        self.store.compact()?;
        self.log.compact()
    }

    /// Returns the (store, log) journal sizes in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if a size cannot be read.
    pub fn journal_sizes(&self) -> CoreResult<(u64, u64)> {
        Ok((self.store.journal_size()?, self.log.journal_size()?))
    }

    /// Checks every journal of a database directory without modifying it.
    ///
    /// Frames are scanned for framing and checksum errors, then fully decoded
    /// from a private copy so a torn tail is reported, not repaired.
    ///
    /// # Errors
    ///
    /// Returns the first corruption found, `DatabaseLocked` if the database
    /// is open elsewhere, or an I/O error.
    pub fn verify(path: &Path) -> CoreResult<VerifyReport> {
        let _dir = DatabaseDir::open(path, false)?;

        let catalog_bytes = read_or_empty(&dir::catalog_path(path))?;
        let store_bytes = read_or_empty(&dir::store_path(path))?;
        let log_bytes = read_or_empty(&dir::log_path(path))?;

        let journals = vec![
            scan("catalog", crate::catalog::CATALOG_MAGIC, &catalog_bytes)?,
            scan("store", crate::entity::STORE_MAGIC, &store_bytes)?,
            scan("pending", crate::pending::LOG_MAGIC, &log_bytes)?,
        ];

        let db = Self::open_with_backends(
            Config::default().compaction_threshold(0),
            Backends {
                catalog: Box::new(InMemoryBackend::with_data(catalog_bytes)),
                store: Box::new(InMemoryBackend::with_data(store_bytes)),
                log: Box::new(InMemoryBackend::with_data(log_bytes)),
            },
            Vec::new(),
        )?;

        let mut records = 0;
        for table in db.tables() {
            records += db.count(&table)?;
        }

        Ok(VerifyReport {
            journals,
            tables: db.tables().len(),
            records,
            pending_entries: db.log.len(),
        })
    }
}

fn read_or_empty(path: &Path) -> CoreResult<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn scan(name: &'static str, magic: [u8; 4], bytes: &[u8]) -> CoreResult<JournalReport> {
    let journal = Journal::new(
        name,
        magic,
        Box::new(InMemoryBackend::with_data(bytes.to_vec())),
        false,
    );
    let decoded = journal.scan()?;
    Ok(JournalReport {
        name,
        frames: decoded.frames.len(),
        bytes: decoded.valid_len,
        torn_bytes: decoded.torn_bytes,
    })
}

/// Brings catalog and store in line with the declared schemas.
fn apply_schemas(
    catalog: &mut Catalog,
    store: &EntityStore,
    log: &PendingLog,
    schemas: &[TableSchema],
) -> CoreResult<()> {
    let changes = catalog.plan(schemas)?;
    if changes.is_empty() {
        return Ok(());
    }

    for change in &changes {
        if let SchemaChange::ChangePrimary { table, from, to } = change {
            if store.count(table)? > 0 || log.has_entries_for_table(table) {
                return Err(CoreError::schema_mismatch(
                    table.clone(),
                    format!("primary column changed from {from} to {to} but the table holds data"),
                ));
            }
        }
    }

    for change in changes {
        match change {
            SchemaChange::CreateTable { table, entry } => {
                store.create_table(&table, &entry);
                info!(table = %table, primary = %entry.primary, "table created");
            }
            SchemaChange::ChangePrimary { table, from, to } => {
                store.set_primary(&table, &to)?;
                warn!(table = %table, from = %from, to = %to, "primary column changed on empty table");
            }
            SchemaChange::AddIndex { table, column } => {
                store.add_index(&table, &column)?;
                info!(table = %table, column = %column, "index built");
            }
            SchemaChange::DropIndex { table, column } => {
                store.drop_index(&table, &column)?;
                info!(table = %table, column = %column, "index dropped");
            }
        }
    }

    for schema in schemas {
        catalog.set(schema.name.clone(), TableEntry::from_schema(schema)?);
    }
    catalog.save()
}
