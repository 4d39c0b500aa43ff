//! Secondary indexes over one column.

use crate::error::CoreResult;
use crate::types::EntityId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tidesync_codec::{to_cbor, Record, Value};

/// Encodes a column value as an index key.
///
/// Equal values have equal encodings, so lookups compare bytes.
pub(crate) fn index_key(value: &Value) -> CoreResult<Vec<u8>> {
    Ok(to_cbor(value)?)
}

/// Index key of `column` in `record`; a missing column indexes as null.
pub(crate) fn record_key(record: &Record, column: &str) -> CoreResult<Vec<u8>> {
    index_key(record.get(column).unwrap_or(&Value::Null))
}

/// Maps encoded column values to the ids of the records holding them.
#[derive(Debug, Default, Clone)]
pub(crate) struct SecondaryIndex {
    by_key: BTreeMap<Vec<u8>, BTreeSet<EntityId>>,
    by_id: HashMap<EntityId, Vec<u8>>,
}

impl SecondaryIndex {
    /// Builds an index over existing records.
    pub(crate) fn build<'a>(
        column: &str,
        records: impl IntoIterator<Item = (&'a EntityId, &'a Record)>,
    ) -> CoreResult<Self> {
        let mut index = Self::default();
        for (id, record) in records {
            index.insert(id.clone(), record_key(record, column)?);
        }
        Ok(index)
    }

    /// Points `key` at `id`, replacing whatever `id` pointed at before.
    pub(crate) fn insert(&mut self, id: EntityId, key: Vec<u8>) {
        self.remove(&id);
        self.by_key.entry(key.clone()).or_default().insert(id.clone());
        self.by_id.insert(id, key);
    }

    /// Forgets `id`.
    pub(crate) fn remove(&mut self, id: &EntityId) {
        if let Some(old) = self.by_id.remove(id) {
            if let Some(ids) = self.by_key.get_mut(&old) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_key.remove(&old);
                }
            }
        }
    }

    /// Ids whose column value encodes to `key`, in id order.
    pub(crate) fn lookup(&self, key: &[u8]) -> Vec<EntityId> {
        self.by_key
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct indexed values.
    #[cfg(test)]
    pub(crate) fn distinct_values(&self) -> usize {
        self.by_key.len()
    }
}
