//! Pending actions and log entries.

use crate::types::{EntityId, EntityKey, EntryId, Timestamp};
use serde::{Deserialize, Serialize};
use tidesync_codec::Record;

/// One local mutation waiting to be accepted by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingAction {
    /// The entity did not exist locally before this write.
    Create {
        /// Entity id.
        id: EntityId,
        /// Full record.
        data: Record,
    },
    /// The entity existed; `data` holds the fields to overwrite.
    Update {
        /// Entity id.
        id: EntityId,
        /// Changed fields.
        data: Record,
    },
    /// The entity was deleted.
    Delete {
        /// Entity id.
        id: EntityId,
    },
}

impl PendingAction {
    /// Returns the entity id.
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Create { id, .. } | Self::Update { id, .. } | Self::Delete { id } => id,
        }
    }

    /// Returns the field map, `None` for deletes.
    pub fn data(&self) -> Option<&Record> {
        match self {
            Self::Create { data, .. } | Self::Update { data, .. } => Some(data),
            Self::Delete { .. } => None,
        }
    }

    /// Returns the action name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    /// Returns true for deletes.
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }
}

/// A durable record of one accepted local mutation. Never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique, strictly increasing id.
    pub entry_id: EntryId,
    /// Milliseconds since the Unix epoch, strictly increasing per log.
    pub timestamp: Timestamp,
    /// Entity the mutation applies to.
    pub key: EntityKey,
    /// The mutation.
    pub action: PendingAction,
}
