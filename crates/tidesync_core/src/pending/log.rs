//! The durable pending-change log.
//!
//! Every accepted local mutation is appended here before the write returns
//! and stays until the remote acknowledges it. Acknowledgments are recorded
//! as purge frames; entries themselves are never rewritten except by
//! compaction, which drops purged entries wholesale.

use super::action::{LogEntry, PendingAction};
use crate::error::{CoreError, CoreResult};
use crate::journal::{framed_len, Frame, Journal};
use crate::types::{EntityKey, EntryId, MonotonicClock, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tidesync_codec::{from_cbor, to_cbor};
use tidesync_storage::StorageBackend;
use tracing::{debug, warn};

pub(crate) const LOG_MAGIC: [u8; 4] = *b"TSPL";

const FRAME_APPEND: u8 = 1;
const FRAME_PURGE: u8 = 2;
const FRAME_SEQUENCE: u8 = 3;

#[derive(Serialize, Deserialize)]
struct PurgeFrame {
    key: EntityKey,
    /// `None` purges every entry of the key appended before this frame.
    through: Option<EntryId>,
}

/// Written first by compaction so ids and timestamps keep increasing even
/// when every entry has been purged.
#[derive(Serialize, Deserialize)]
struct SequenceFrame {
    next_entry_id: EntryId,
    last_timestamp: Timestamp,
}

#[derive(Debug)]
struct LogState {
    entries: BTreeMap<EntryId, LogEntry>,
    by_key: HashMap<EntityKey, BTreeSet<EntryId>>,
    next_id: EntryId,
    clock: MonotonicClock,
}

impl LogState {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_key: HashMap::new(),
            next_id: EntryId::new(1),
            clock: MonotonicClock::default(),
        }
    }

    fn insert(&mut self, entry: LogEntry) {
        self.next_id = self.next_id.max(entry.entry_id.next());
        if entry.timestamp > self.clock.last() {
            self.clock = MonotonicClock::starting_after(entry.timestamp);
        }
        self.by_key
            .entry(entry.key.clone())
            .or_default()
            .insert(entry.entry_id);
        self.entries.insert(entry.entry_id, entry);
    }

    /// Ids of `key` at or below `through` (all of them for `None`).
    fn purgeable(&self, key: &EntityKey, through: Option<EntryId>) -> Vec<EntryId> {
        self.by_key
            .get(key)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| through.map_or(true, |w| *id <= w))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove(&mut self, key: &EntityKey, ids: &[EntryId]) {
        for id in ids {
            self.entries.remove(id);
        }
        if let Some(set) = self.by_key.get_mut(key) {
            for id in ids {
                set.remove(id);
            }
            if set.is_empty() {
                self.by_key.remove(key);
            }
        }
    }
}

/// The pending-change log.
#[derive(Debug)]
pub struct PendingLog {
    journal: Mutex<Journal>,
    state: RwLock<LogState>,
    compaction_threshold: u64,
}

impl PendingLog {
    /// Opens the log over `backend` and replays it.
    ///
    /// # Errors
    ///
    /// Returns a corruption or codec error if the journal is damaged.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
        compaction_threshold: u64,
    ) -> CoreResult<Self> {
        let mut journal = Journal::new("pending", LOG_MAGIC, backend, sync_on_write);
        let mut state = LogState::new();

        for frame in journal.replay()? {
            match frame.kind {
                FRAME_APPEND => {
                    let entry: LogEntry = from_cbor(&frame.payload)?;
                    state.insert(entry);
                }
                FRAME_PURGE => {
                    let purge: PurgeFrame = from_cbor(&frame.payload)?;
                    let ids = state.purgeable(&purge.key, purge.through);
                    state.remove(&purge.key, &ids);
                }
                FRAME_SEQUENCE => {
                    let seq: SequenceFrame = from_cbor(&frame.payload)?;
                    state.next_id = state.next_id.max(seq.next_entry_id);
                    if seq.last_timestamp > state.clock.last() {
                        state.clock = MonotonicClock::starting_after(seq.last_timestamp);
                    }
                }
                kind => {
                    return Err(CoreError::journal_corruption(format!(
                        "unknown pending-log frame kind {kind}"
                    )))
                }
            }
        }

        debug!(
            entries = state.entries.len(),
            keys = state.by_key.len(),
            next_entry_id = state.next_id.as_u64(),
            "pending log loaded"
        );

        Ok(Self {
            journal: Mutex::new(journal),
            state: RwLock::new(state),
            compaction_threshold,
        })
    }

    /// Appends an entry for `key` and returns its id.
    ///
    /// The entry is durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the append fails; the log is unchanged.
    pub fn append(&self, key: EntityKey, action: PendingAction) -> CoreResult<EntryId> {
        let mut journal = self.journal.lock();

        let (entry_id, timestamp) = {
            let mut state = self.state.write();
            (state.next_id, state.clock.next())
        };
        let entry = LogEntry {
            entry_id,
            timestamp,
            key,
            action,
        };

        journal.append(FRAME_APPEND, to_cbor(&entry)?)?;
        debug!(
            table = %entry.key.table,
            id = %entry.key.id,
            entry_id = entry_id.as_u64(),
            action = entry.action.kind(),
            "pending entry appended"
        );
        self.state.write().insert(entry);

        self.maybe_compact(&mut journal);
        Ok(entry_id)
    }

    /// Returns the entries for `key`, oldest first.
    pub fn entries_for(&self, key: &EntityKey) -> Vec<LogEntry> {
        let state = self.state.read();
        let mut entries: Vec<LogEntry> = state
            .by_key
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect();
        entries.sort_by_key(|e| (e.timestamp, e.entry_id));
        entries
    }

    /// Returns every entry, in append order.
    pub fn all_entries(&self) -> Vec<LogEntry> {
        self.state.read().entries.values().cloned().collect()
    }

    /// Returns each key with pending entries once, in order of its oldest
    /// live entry.
    pub fn pending_keys(&self) -> Vec<EntityKey> {
        let state = self.state.read();
        let mut seen = HashSet::new();
        state
            .entries
            .values()
            .filter(|e| seen.insert(&e.key))
            .map(|e| e.key.clone())
            .collect()
    }

    /// Returns true if any entry belongs to `table`.
    pub fn has_entries_for_table(&self, table: &str) -> bool {
        self.state.read().by_key.keys().any(|k| k.table == table)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id the next append will receive.
    pub fn next_entry_id(&self) -> EntryId {
        self.state.read().next_id
    }

    /// Removes every entry for `key`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the purge cannot be recorded.
    pub fn purge(&self, key: &EntityKey) -> CoreResult<usize> {
        self.purge_inner(key, None)
    }

    /// Removes the entries for `key` with ids at or below `watermark`.
    /// Later entries survive. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the purge cannot be recorded.
    pub fn purge_through(&self, key: &EntityKey, watermark: EntryId) -> CoreResult<usize> {
        self.purge_inner(key, Some(watermark))
    }

    fn purge_inner(&self, key: &EntityKey, through: Option<EntryId>) -> CoreResult<usize> {
        let mut journal = self.journal.lock();

        let ids = self.state.read().purgeable(key, through);
        if ids.is_empty() {
            return Ok(0);
        }

        let frame = PurgeFrame {
            key: key.clone(),
            through,
        };
        journal.append(FRAME_PURGE, to_cbor(&frame)?)?;
        self.state.write().remove(key, &ids);

        debug!(
            table = %key.table,
            id = %key.id,
            watermark = through.map(EntryId::as_u64),
            purged = ids.len(),
            "pending entries purged"
        );

        self.maybe_compact(&mut journal);
        Ok(ids.len())
    }

    /// Rewrites the journal with only the live entries.
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
        let state = self.state.read();
        let mut frames = Vec::with_capacity(state.entries.len() + 1);
        frames.push(Frame::new(
            FRAME_SEQUENCE,
            to_cbor(&SequenceFrame {
                next_entry_id: state.next_id,
                last_timestamp: state.clock.last(),
            })?,
        ));
        for entry in state.entries.values() {
            frames.push(Frame::new(FRAME_APPEND, to_cbor(entry)?));
        }
        Ok(frames)
    }

    fn maybe_compact(&self, journal: &mut Journal) {
        if let Err(e) = self.try_compact(journal) {
            warn!(error = %e, "pending log compaction failed");
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
