//! Dispatch requests, acknowledgers and the application callbacks.

use crate::connectivity::NetworkStatus;
use crate::engine::Shared;
use crate::error::SyncResult;
use std::fmt;
use std::sync::Arc;
use tidesync_core::{EntityKey, EntryId, PendingAction};

/// One merged action offered to the application for remote delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    /// Entity the action applies to.
    pub key: EntityKey,
    /// The merged action.
    pub action: PendingAction,
    /// Highest log entry folded into `action`.
    pub watermark: EntryId,
    /// Number of log entries folded into `action`.
    pub entry_count: usize,
}

impl DispatchRequest {
    /// Table of the entity.
    pub fn table(&self) -> &str {
        &self.key.table
    }
}

/// Confirms that a dispatched action reached the remote.
///
/// Acknowledging purges the log entries the action was merged from, and
/// nothing newer: a write accepted after the dispatch stays pending and is
/// offered again. Acknowledging twice is harmless.
#[derive(Clone)]
pub struct Acknowledger {
    shared: Arc<Shared>,
    key: EntityKey,
    watermark: EntryId,
}

impl Acknowledger {
    pub(crate) fn new(shared: Arc<Shared>, key: EntityKey, watermark: EntryId) -> Self {
        Self {
            shared,
            key,
            watermark,
        }
    }

    /// Purges the entries covered by the dispatched action. Returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the purge cannot be recorded.
    pub fn acknowledge(&self) -> SyncResult<usize> {
        self.shared.acknowledge(&self.key, Some(self.watermark))
    }

    /// Purges every entry for the entity, including ones newer than the
    /// dispatched action.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the purge cannot be recorded.
    pub fn acknowledge_all(&self) -> SyncResult<usize> {
        self.shared.acknowledge(&self.key, None)
    }

    /// Merges whatever is still pending for the entity into a new request,
    /// bypassing the dispatch handler. `None` when offline or nothing is
    /// pending.
    pub(crate) fn refresh(&self) -> Option<(DispatchRequest, Acknowledger)> {
        self.shared.prepare(&self.key)
    }

    /// Entity being acknowledged.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Highest entry this acknowledger purges.
    pub fn watermark(&self) -> EntryId {
        self.watermark
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("key", &self.key)
            .field("watermark", &self.watermark)
            .finish_non_exhaustive()
    }
}

/// Delivers merged actions to the remote.
///
/// Called on the engine's worker task; long remote calls belong on a
/// blocking thread (see [`RemoteRouter`](crate::RemoteRouter)).
pub trait DispatchHandler: Send + Sync {
    /// Delivers one action. Call `ack` once the remote has accepted it.
    fn dispatch(&self, request: DispatchRequest, ack: Acknowledger);
}

impl<F> DispatchHandler for F
where
    F: Fn(DispatchRequest, Acknowledger) + Send + Sync,
{
    fn dispatch(&self, request: DispatchRequest, ack: Acknowledger) {
        self(request, ack);
    }
}

/// Observes network status and the pending count.
pub trait StateListener: Send + Sync {
    /// Called on every status change and every accepted mutation or
    /// acknowledgment.
    fn on_state(&self, status: NetworkStatus, pending: usize);
}

impl<F> StateListener for F
where
    F: Fn(NetworkStatus, usize) + Send + Sync,
{
    fn on_state(&self, status: NetworkStatus, pending: usize) {
        self(status, pending);
    }
}
