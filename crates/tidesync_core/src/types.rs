//! Core type definitions for TideSync.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tidesync_codec::Value;

/// Primary-key value of a record.
///
/// Only text and integer keys are accepted. Ordering puts numbers before
/// text, which is the order `get_all` returns records in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Integer key.
    Number(i64),
    /// Text key.
    Text(String),
}

impl EntityId {
    /// Extracts an id from a field value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPrimaryKey` for any value that is neither text nor an
    /// integer. Empty text is rejected as well.
    pub fn from_value(table: &str, value: &Value) -> CoreResult<Self> {
        match value {
            Value::Integer(n) => Ok(Self::Number(*n)),
            Value::Text(s) if !s.is_empty() => Ok(Self::Text(s.clone())),
            Value::Text(_) => Err(CoreError::invalid_primary_key(table, "empty text key")),
            other => Err(CoreError::invalid_primary_key(
                table,
                format!("{} values cannot be primary keys", other.type_name()),
            )),
        }
    }

    /// Converts the id back into a field value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::Integer(*n),
            Self::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// Identity of one entity: the table it lives in plus its primary key.
///
/// Log entries, merges, dispatches and acknowledgments are all keyed by
/// `EntityKey`, so equal ids in different tables never collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Table name.
    pub table: String,
    /// Primary-key value.
    pub id: EntityId,
}

impl EntityKey {
    /// Creates a new entity key.
    pub fn new(table: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// Identifier of a pending-log entry.
///
/// Entry ids are strictly increasing for the lifetime of a log, restarts and
/// compactions included, and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Creates a new entry ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next entry ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry:{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Wall-clock source that never goes backwards.
///
/// Each call returns `max(now, last + 1)`, so timestamps handed out by one
/// clock are strictly increasing even if the system clock is adjusted.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Timestamp,
}

impl MonotonicClock {
    /// Creates a clock that will never return a value at or below `last`.
    #[must_use]
    pub const fn starting_after(last: Timestamp) -> Self {
        Self { last }
    }

    /// Returns the next timestamp.
    pub fn next(&mut self) -> Timestamp {
        let next = now_millis().max(self.last.saturating_add(1));
        self.last = next;
        next
    }

    /// Returns the last timestamp handed out.
    #[must_use]
    pub const fn last(&self) -> Timestamp {
        self.last
    }
}

fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_from_value() {
        assert_eq!(
            EntityId::from_value("tasks", &Value::from("t1")).unwrap(),
            EntityId::Text("t1".into())
        );
        assert_eq!(
            EntityId::from_value("tasks", &Value::Integer(7)).unwrap(),
            EntityId::Number(7)
        );
        assert!(matches!(
            EntityId::from_value("tasks", &Value::Null),
            Err(CoreError::InvalidPrimaryKey { .. })
        ));
        assert!(EntityId::from_value("tasks", &Value::from("")).is_err());
        assert!(EntityId::from_value("tasks", &Value::Float(1.0)).is_err());
    }

    #[test]
    fn keys_in_different_tables_differ() {
        let a = EntityKey::new("tasks", "1");
        let b = EntityKey::new("projects", "1");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "tasks/1");
    }

    #[test]
    fn entry_id_ordering() {
        let e1 = EntryId::new(1);
        assert!(e1 < e1.next());
        assert_eq!(format!("{e1}"), "entry:1");
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let mut clock = MonotonicClock::default();
        let mut last = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn clock_respects_floor_in_the_future() {
        let far_future = u64::MAX / 2;
        let mut clock = MonotonicClock::starting_after(far_future);
        assert_eq!(clock.next(), far_future + 1);
        assert_eq!(clock.last(), far_future + 1);
    }

    #[test]
    fn id_serde_is_plain() {
        let bytes = tidesync_codec::to_cbor(&EntityId::Number(5)).unwrap();
        assert_eq!(bytes, vec![0x05]);
        let back: EntityId = tidesync_codec::from_cbor(&bytes).unwrap();
        assert_eq!(back, EntityId::Number(5));

        let bytes = tidesync_codec::to_cbor(&EntityId::from("t1")).unwrap();
        let back: EntityId = tidesync_codec::from_cbor(&bytes).unwrap();
        assert_eq!(back, EntityId::from("t1"));
    }
}
