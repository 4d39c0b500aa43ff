//! Entity store: the local replica of every table.
//!
//! Records live in memory, keyed by primary key, with secondary indexes
//! maintained alongside. Every mutation is first appended to the store
//! journal as one frame, then applied in memory under the table write lock.
//! Opening the store replays the journal.

use super::index::{index_key, record_key, SecondaryIndex};
use crate::catalog::TableEntry;
use crate::error::{CoreError, CoreResult};
use crate::journal::{framed_len, Frame, Journal};
use crate::types::EntityId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tidesync_codec::{from_cbor, to_cbor, Record, Value};
use tidesync_storage::StorageBackend;
use tracing::{debug, warn};

pub(crate) const STORE_MAGIC: [u8; 4] = *b"TSST";

const FRAME_PUT: u8 = 1;
const FRAME_DELETE: u8 = 2;
const FRAME_REPLACE_ALL: u8 = 3;

#[derive(Serialize, Deserialize)]
struct PutFrame {
    table: String,
    id: EntityId,
    record: Record,
}

#[derive(Serialize, Deserialize)]
struct DeleteFrame {
    table: String,
    id: EntityId,
}

#[derive(Serialize, Deserialize)]
struct ReplaceAllFrame {
    table: String,
    records: Vec<(EntityId, Record)>,
}

/// A record with its id and index keys worked out, ready to apply.
struct Prepared {
    id: EntityId,
    record: Record,
    keys: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Default, Clone)]
struct Table {
    primary: String,
    records: BTreeMap<EntityId, Record>,
    indexes: BTreeMap<String, SecondaryIndex>,
}

impl Table {
    fn new(entry: &TableEntry) -> Self {
        Self {
            primary: entry.primary.clone(),
            records: BTreeMap::new(),
            indexes: entry
                .indexes
                .iter()
                .map(|column| (column.clone(), SecondaryIndex::default()))
                .collect(),
        }
    }

    fn prepare(&self, table: &str, record: Record) -> CoreResult<Prepared> {
        let id = EntityId::from_value(table, record.get(&self.primary).unwrap_or(&Value::Null))?;
        self.prepare_with_id(id, record)
    }

    fn prepare_with_id(&self, id: EntityId, record: Record) -> CoreResult<Prepared> {
        let keys = self
            .indexes
            .keys()
            .map(|column| Ok((column.clone(), record_key(&record, column)?)))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Prepared { id, record, keys })
    }

    fn apply_put(&mut self, prepared: Prepared) -> Option<Record> {
        for (column, key) in prepared.keys {
            if let Some(index) = self.indexes.get_mut(&column) {
                index.insert(prepared.id.clone(), key);
            }
        }
        self.records.insert(prepared.id, prepared.record)
    }

    fn apply_delete(&mut self, id: &EntityId) -> Option<Record> {
        for index in self.indexes.values_mut() {
            index.remove(id);
        }
        self.records.remove(id)
    }

    /// Builds a table holding exactly `prepared`, with this table's layout.
    fn with_contents(&self, prepared: Vec<Prepared>) -> Self {
        let mut table = Self {
            primary: self.primary.clone(),
            records: BTreeMap::new(),
            indexes: self
                .indexes
                .keys()
                .map(|column| (column.clone(), SecondaryIndex::default()))
                .collect(),
        };
        for p in prepared {
            table.apply_put(p);
        }
        table
    }
}

/// The entity store.
#[derive(Debug)]
pub struct EntityStore {
    journal: Mutex<Journal>,
    tables: RwLock<HashMap<String, Table>>,
    compaction_threshold: u64,
}

impl EntityStore {
    /// Opens the store over `backend`, creating the tables listed in
    /// `catalog` and replaying the journal into them.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the journal is damaged or refers to a
    /// table the catalog does not know.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
        compaction_threshold: u64,
        catalog: &BTreeMap<String, TableEntry>,
    ) -> CoreResult<Self> {
        let mut journal = Journal::new("store", STORE_MAGIC, backend, sync_on_write);
        let mut tables: HashMap<String, Table> = catalog
            .iter()
            .map(|(name, entry)| (name.clone(), Table::new(entry)))
            .collect();

        let frames = journal.replay()?;
        let frame_count = frames.len();
        for frame in frames {
            replay_frame(&mut tables, frame)?;
        }

        debug!(
            frames = frame_count,
            tables = tables.len(),
            records = tables.values().map(|t| t.records.len()).sum::<usize>(),
            "entity store loaded"
        );

        Ok(Self {
            journal: Mutex::new(journal),
            tables: RwLock::new(tables),
            compaction_threshold,
        })
    }

    /// Adds an empty table. Existing tables are left untouched.
    pub fn create_table(&self, name: &str, entry: &TableEntry) {
        self.tables
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Table::new(entry));
    }

    /// Changes the primary column of an empty table.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if the table holds records.
    pub fn set_primary(&self, name: &str, primary: &str) -> CoreResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| CoreError::unknown_table(name))?;
        if !table.records.is_empty() {
            return Err(CoreError::schema_mismatch(
                name,
                format!(
                    "primary column cannot change from {} to {primary} while the table holds records",
                    table.primary
                ),
            ));
        }
        table.primary = primary.to_string();
        Ok(())
    }

    /// Builds an index on `column` from the records already stored.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn add_index(&self, name: &str, column: &str) -> CoreResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| CoreError::unknown_table(name))?;
        let index = SecondaryIndex::build(column, &table.records)?;
        table.indexes.insert(column.to_string(), index);
        Ok(())
    }

    /// Drops the index on `column`. Records are untouched.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn drop_index(&self, name: &str, column: &str) -> CoreResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| CoreError::unknown_table(name))?;
        table.indexes.remove(column);
        Ok(())
    }

    /// Returns the record with primary key `id`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn get(&self, table: &str, id: &EntityId) -> CoreResult<Option<Record>> {
        let tables = self.tables.read();
        let t = tables
            .get(table)
            .ok_or_else(|| CoreError::unknown_table(table))?;
        Ok(t.records.get(id).cloned())
    }

    /// Returns every record of a table, ordered by primary key.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn get_all(&self, table: &str) -> CoreResult<Vec<Record>> {
        let tables = self.tables.read();
        let t = tables
            .get(table)
            .ok_or_else(|| CoreError::unknown_table(table))?;
        Ok(t.records.values().cloned().collect())
    }

    /// Returns the records whose `column` equals `value`.
    ///
    /// Works on indexed columns and on the primary column.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist and
    /// `InvalidArgument` if the column is not indexed.
    pub fn find_by(&self, table: &str, column: &str, value: &Value) -> CoreResult<Vec<Record>> {
        let tables = self.tables.read();
        let t = tables
            .get(table)
            .ok_or_else(|| CoreError::unknown_table(table))?;

        if column == t.primary {
            return Ok(EntityId::from_value(table, value)
                .ok()
                .and_then(|id| t.records.get(&id).cloned())
                .into_iter()
                .collect());
        }

        let index = t.indexes.get(column).ok_or_else(|| {
            CoreError::invalid_argument(format!("column {column} of table {table} is not indexed"))
        })?;
        let key = index_key(value)?;
        Ok(index
            .lookup(&key)
            .iter()
            .filter_map(|id| t.records.get(id).cloned())
            .collect())
    }

    /// Returns the number of records in a table.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn count(&self, table: &str) -> CoreResult<usize> {
        let tables = self.tables.read();
        tables
            .get(table)
            .map(|t| t.records.len())
            .ok_or_else(|| CoreError::unknown_table(table))
    }

    /// Returns the table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns true if the table exists.
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.read().contains_key(table)
    }

    /// Upserts a record keyed by its primary column.
    ///
    /// Returns the id and the record it replaced, if any.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable`, `InvalidPrimaryKey`, or a storage error if the
    /// journal append fails (in which case nothing changes).
    pub fn put(&self, table: &str, record: Record) -> CoreResult<(EntityId, Option<Record>)> {
        let mut journal = self.journal.lock();

        let prepared = {
            let tables = self.tables.read();
            let t = tables
                .get(table)
                .ok_or_else(|| CoreError::unknown_table(table))?;
            t.prepare(table, record)?
        };

        let payload = to_cbor(&PutFrame {
            table: table.to_string(),
            id: prepared.id.clone(),
            record: prepared.record.clone(),
        })?;
        journal.append(FRAME_PUT, payload)?;

        let id = prepared.id.clone();
        let previous = {
            let mut tables = self.tables.write();
            tables
                .get_mut(table)
                .and_then(|t| t.apply_put(prepared))
        };

        self.maybe_compact(&mut journal);
        Ok((id, previous))
    }

    /// Deletes a record and returns it. Absent ids are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable`, or a storage error if the journal append fails
    /// (in which case nothing changes).
    pub fn delete(&self, table: &str, id: &EntityId) -> CoreResult<Option<Record>> {
        let mut journal = self.journal.lock();

        {
            let tables = self.tables.read();
            let t = tables
                .get(table)
                .ok_or_else(|| CoreError::unknown_table(table))?;
            if !t.records.contains_key(id) {
                return Ok(None);
            }
        }

        let payload = to_cbor(&DeleteFrame {
            table: table.to_string(),
            id: id.clone(),
        })?;
        journal.append(FRAME_DELETE, payload)?;

        let previous = {
            let mut tables = self.tables.write();
            tables.get_mut(table).and_then(|t| t.apply_delete(id))
        };

        self.maybe_compact(&mut journal);
        Ok(previous)
    }

    /// Replaces the whole content of a table with `records`.
    ///
    /// The change is one journal frame and one in-memory swap: readers see
    /// the old table or the new one, and so does a restart. When two records
    /// share a primary key the later one wins. Returns the new record count.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable`, `InvalidPrimaryKey` if any record lacks a
    /// valid key (nothing is replaced then), or a storage error.
    pub fn replace_all(&self, table: &str, records: Vec<Record>) -> CoreResult<usize> {
        let mut journal = self.journal.lock();

        let replacement = {
            let tables = self.tables.read();
            let t = tables
                .get(table)
                .ok_or_else(|| CoreError::unknown_table(table))?;
            let prepared = records
                .into_iter()
                .map(|record| t.prepare(table, record))
                .collect::<CoreResult<Vec<_>>>()?;
            t.with_contents(prepared)
        };

        let payload = to_cbor(&ReplaceAllFrame {
            table: table.to_string(),
            records: replacement
                .records
                .iter()
                .map(|(id, r)| (id.clone(), r.clone()))
                .collect(),
        })?;
        journal.append(FRAME_REPLACE_ALL, payload)?;

        let count = replacement.records.len();
        self.tables.write().insert(table.to_string(), replacement);

        self.maybe_compact(&mut journal);
        Ok(count)
    }

    /// Rewrites the journal as a snapshot of the current contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn compact(&self) -> CoreResult<()> {
        let mut journal = self.journal.lock();
        let frames = self.snapshot()?;
        journal.rewrite(&frames)
    }

    /// Current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn journal_size(&self) -> CoreResult<u64> {
        self.journal.lock().size()
    }

    fn snapshot(&self) -> CoreResult<Vec<Frame>> {
        let tables = self.tables.read();
        let mut names: Vec<&String> = tables.keys().collect();
        names.sort();

        let mut frames = Vec::new();
        for name in names {
            let t = &tables[name];
            if t.records.is_empty() {
                continue;
            }
            let payload = to_cbor(&ReplaceAllFrame {
                table: name.clone(),
                records: t
                    .records
                    .iter()
                    .map(|(id, r)| (id.clone(), r.clone()))
                    .collect(),
            })?;
            frames.push(Frame::new(FRAME_REPLACE_ALL, payload));
        }
        Ok(frames)
    }

    /// Compacts when the journal is large and mostly dead. Failures are
    /// logged; the write that triggered this is already durable.
    fn maybe_compact(&self, journal: &mut Journal) {
        if let Err(e) = self.try_compact(journal) {
            warn!(error = %e, "store compaction failed");
        }
    }

    fn try_compact(&self, journal: &mut Journal) -> CoreResult<()> {
        if !journal.wants_compaction(self.compaction_threshold)? {
            return Ok(());
        }
        let frames = self.snapshot()?;
        let live: u64 = frames.iter().map(|f| framed_len(f.payload.len())).sum();
        if live.saturating_mul(2) < journal.size()? {
            journal.rewrite(&frames)
        } else {
            journal.defer_compaction(live);
            Ok(())
        }
    }
}

fn replay_frame(tables: &mut HashMap<String, Table>, frame: Frame) -> CoreResult<()> {
    fn table<'a>(tables: &'a mut HashMap<String, Table>, name: &str) -> CoreResult<&'a mut Table> {
        tables.get_mut(name).ok_or_else(|| {
            CoreError::journal_corruption(format!("store journal refers to unknown table {name}"))
        })
    }

    match frame.kind {
        FRAME_PUT => {
            let put: PutFrame = from_cbor(&frame.payload)?;
            let t = table(tables, &put.table)?;
            let prepared = t.prepare_with_id(put.id, put.record)?;
            t.apply_put(prepared);
        }
        FRAME_DELETE => {
            let delete: DeleteFrame = from_cbor(&frame.payload)?;
            table(tables, &delete.table)?.apply_delete(&delete.id);
        }
        FRAME_REPLACE_ALL => {
            let replace: ReplaceAllFrame = from_cbor(&frame.payload)?;
            let t = table(tables, &replace.table)?;
            let prepared = replace
                .records
                .into_iter()
                .map(|(id, record)| t.prepare_with_id(id, record))
                .collect::<CoreResult<Vec<_>>>()?;
            *t = t.with_contents(prepared);
        }
        kind => {
            return Err(CoreError::journal_corruption(format!(
                "unknown store frame kind {kind}"
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tidesync_codec::record;
    use tidesync_storage::InMemoryBackend;

    fn catalog() -> BTreeMap<String, TableEntry> {
        let mut catalog = BTreeMap::new();
        catalog.insert(
            "tasks".to_string(),
            TableEntry {
                primary: "id".into(),
                indexes: BTreeSet::from(["project".to_string()]),
            },
        );
        catalog.insert(
            "projects".to_string(),
            TableEntry {
                primary: "id".into(),
                indexes: BTreeSet::new(),
            },
        );
        catalog
    }

    fn open(backend: &InMemoryBackend) -> EntityStore {
        EntityStore::open(Box::new(backend.clone()), true, 0, &catalog()).unwrap()
    }

    fn task(id: &str, project: &str) -> Record {
        record! { "id" => id, "project" => project }
    }

    #[test]
    fn put_get_upsert() {
        let store = open(&InMemoryBackend::new());
        let (id, previous) = store.put("tasks", task("t1", "home")).unwrap();
        assert_eq!(id, EntityId::from("t1"));
        assert!(previous.is_none());

        let (_, previous) = store.put("tasks", task("t1", "work")).unwrap();
        assert_eq!(previous.unwrap()["project"], Value::from("home"));
        assert_eq!(
            store.get("tasks", &id).unwrap().unwrap()["project"],
            Value::from("work")
        );
        assert_eq!(store.count("tasks").unwrap(), 1);
    }

    #[test]
    fn same_id_in_two_tables_is_two_records() {
        let store = open(&InMemoryBackend::new());
        store.put("tasks", task("1", "home")).unwrap();
        store.put("projects", record! { "id" => "1" }).unwrap();
        store.delete("projects", &EntityId::from("1")).unwrap();
        assert!(store.get("tasks", &EntityId::from("1")).unwrap().is_some());
    }

    #[test]
    fn unknown_table_is_an_error() {
        let store = open(&InMemoryBackend::new());
        assert!(matches!(
            store.get_all("notes"),
            Err(CoreError::UnknownTable { .. })
        ));
        assert!(matches!(
            store.put("notes", record! { "id" => "n" }),
            Err(CoreError::UnknownTable { .. })
        ));
    }

    #[test]
    fn delete_absent_is_noop() {
        let backend = InMemoryBackend::new();
        let store = open(&backend);
        assert!(store.delete("tasks", &EntityId::from("nope")).unwrap().is_none());
        assert!(backend.data().is_empty());
    }

    #[test]
    fn find_by_uses_index() {
        let store = open(&InMemoryBackend::new());
        store.put("tasks", task("t1", "home")).unwrap();
        store.put("tasks", task("t2", "work")).unwrap();
        store.put("tasks", task("t3", "home")).unwrap();
        store.put("tasks", task("t1", "work")).unwrap();

        let home = store.find_by("tasks", "project", &Value::from("home")).unwrap();
        assert_eq!(home, vec![task("t3", "home")]);
        let by_primary = store.find_by("tasks", "id", &Value::from("t2")).unwrap();
        assert_eq!(by_primary, vec![task("t2", "work")]);
        assert!(store.find_by("tasks", "title", &Value::Null).is_err());
    }

    #[test]
    fn replay_restores_contents() {
        let backend = InMemoryBackend::new();
        {
            let store = open(&backend);
            store.put("tasks", task("t1", "home")).unwrap();
            store.put("tasks", task("t2", "home")).unwrap();
            store.delete("tasks", &EntityId::from("t1")).unwrap();
            store
                .replace_all("projects", vec![record! { "id" => "p1" }])
                .unwrap();
        }

        let store = open(&backend);
        assert_eq!(store.get_all("tasks").unwrap(), vec![task("t2", "home")]);
        assert_eq!(store.count("projects").unwrap(), 1);
        assert_eq!(
            store.find_by("tasks", "project", &Value::from("home")).unwrap().len(),
            1
        );
    }

    #[test]
    fn replace_all_swaps_contents_and_indexes() {
        let store = open(&InMemoryBackend::new());
        store.put("tasks", task("old", "home")).unwrap();

        let count = store
            .replace_all(
                "tasks",
                vec![task("a", "work"), task("b", "work"), task("a", "home")],
            )
            .unwrap();
        assert_eq!(count, 2);
        assert!(store.get("tasks", &EntityId::from("old")).unwrap().is_none());
        assert_eq!(
            store.get("tasks", &EntityId::from("a")).unwrap().unwrap()["project"],
            Value::from("home")
        );
        assert_eq!(
            store.find_by("tasks", "project", &Value::from("work")).unwrap(),
            vec![task("b", "work")]
        );
    }

    #[test]
    fn replace_all_rejects_keyless_records_whole() {
        let store = open(&InMemoryBackend::new());
        store.put("tasks", task("keep", "home")).unwrap();
        let result = store.replace_all("tasks", vec![task("a", "x"), record! { "project" => "y" }]);
        assert!(matches!(result, Err(CoreError::InvalidPrimaryKey { .. })));
        assert_eq!(store.count("tasks").unwrap(), 1);
    }

    #[test]
    fn failed_append_changes_nothing() {
        let backend = InMemoryBackend::new();
        let store = open(&backend);
        store.put("tasks", task("t1", "home")).unwrap();
        backend.set_fail_writes(true);

        assert!(store.put("tasks", task("t1", "work")).unwrap_err().is_storage());
        assert!(store.delete("tasks", &EntityId::from("t1")).is_err());
        assert!(store.replace_all("tasks", vec![]).is_err());
        assert_eq!(store.get_all("tasks").unwrap(), vec![task("t1", "home")]);
    }

    #[test]
    fn index_lifecycle() {
        let store = open(&InMemoryBackend::new());
        store.put("projects", record! { "id" => "p1", "owner" => "ann" }).unwrap();

        assert!(store.find_by("projects", "owner", &Value::from("ann")).is_err());
        store.add_index("projects", "owner").unwrap();
        assert_eq!(
            store.find_by("projects", "owner", &Value::from("ann")).unwrap().len(),
            1
        );
        store.drop_index("projects", "owner").unwrap();
        assert!(store.find_by("projects", "owner", &Value::from("ann")).is_err());
        assert_eq!(store.count("projects").unwrap(), 1);
    }

    #[test]
    fn primary_change_requires_empty_table() {
        let store = open(&InMemoryBackend::new());
        store.set_primary("projects", "uuid").unwrap();
        store.put("tasks", task("t1", "home")).unwrap();
        assert!(matches!(
            store.set_primary("tasks", "uuid"),
            Err(CoreError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn automatic_compaction_shrinks_journal() {
        let backend = InMemoryBackend::new();
        let store = EntityStore::open(Box::new(backend.clone()), true, 512, &catalog()).unwrap();

        for round in 0..50 {
            store
                .put("tasks", task("t1", &format!("project-{round}")))
                .unwrap();
        }
        assert!(store.journal_size().unwrap() <= 512);

        let reopened = open(&backend);
        assert_eq!(reopened.get_all("tasks").unwrap(), vec![task("t1", "project-49")]);
    }

    #[test]
    fn explicit_compaction_keeps_contents() {
        let backend = InMemoryBackend::new();
        let store = open(&backend);
        store.put("tasks", task("t1", "home")).unwrap();
        store.put("tasks", task("t2", "work")).unwrap();
        store.delete("tasks", &EntityId::from("t1")).unwrap();
        let before = store.journal_size().unwrap();

        store.compact().unwrap();
        assert!(store.journal_size().unwrap() < before);
        assert_eq!(open(&backend).get_all("tasks").unwrap(), vec![task("t2", "work")]);
    }
}
