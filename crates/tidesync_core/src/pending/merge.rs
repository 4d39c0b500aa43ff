//! Collapsing an entity's pending entries into one action.
//!
//! Rules, applied to entries in timestamp order:
//!
//! 1. Any delete wins outright: the result is `Delete`.
//! 2. Otherwise field maps are folded in order, later values overwriting
//!    earlier ones field by field. Fields an entry does not carry are left
//!    as they were.
//! 3. The result is `Create` if any entry was a create, else `Update`.
//!
//! A run that starts with a create therefore yields the create's payload
//! with every later update applied on top.

use super::action::{LogEntry, PendingAction};
use crate::types::{EntityKey, EntryId};
use tidesync_codec::Record;

/// The net effect of all pending entries for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedAction {
    /// Entity the action applies to.
    pub key: EntityKey,
    /// The collapsed action.
    pub action: PendingAction,
    /// Highest entry id folded into `action`.
    pub watermark: EntryId,
    /// Number of entries folded.
    pub entry_count: usize,
}

/// Collapses `entries` into a single action.
///
/// Returns `None` only for an empty slice. Entries are expected to belong
/// to one entity; they are ordered by timestamp (then entry id) before
/// folding, so the input order does not matter.
pub fn merge(entries: &[LogEntry]) -> Option<PendingAction> {
    let mut ordered: Vec<&LogEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| (e.timestamp, e.entry_id));
    let id = ordered.first()?.key.id.clone();

    if ordered.iter().any(|e| e.action.is_delete()) {
        return Some(PendingAction::Delete { id });
    }

    let mut data = Record::new();
    let mut created = false;
    for entry in ordered {
        match &entry.action {
            PendingAction::Create { data: fields, .. } => {
                created = true;
                data.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            PendingAction::Update { data: fields, .. } => {
                data.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            PendingAction::Delete { .. } => {}
        }
    }

    Some(if created {
        PendingAction::Create { id, data }
    } else {
        PendingAction::Update { id, data }
    })
}

/// Like [`merge`], also reporting the watermark and entry count.
pub fn merge_entries(entries: &[LogEntry]) -> Option<MergedAction> {
    let action = merge(entries)?;
    let first = entries.first()?;
    let watermark = entries.iter().map(|e| e.entry_id).max()?;
    Some(MergedAction {
        key: first.key.clone(),
        action,
        watermark,
        entry_count: entries.len(),
    })
}
