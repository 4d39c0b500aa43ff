//! Per-table remote capabilities.
//!
//! A [`RemoteRouter`] maps table names to [`RemoteTable`] implementations and
//! acts as the engine's dispatch handler: each merged action becomes one call
//! on the table's remote, run on a blocking thread, and is acknowledged when
//! the call succeeds.
//!
//! Calls for one entity never overlap. A dispatch that arrives while a call
//! for the same entity is running is not sent; once the running call ends,
//! the entity's remaining entries are merged again and sent in its place.

use crate::dispatch::{Acknowledger, DispatchHandler, DispatchRequest};
use crate::error::{RemoteError, SyncError, SyncResult};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tidesync_codec::Record;
use tidesync_core::{EntityId, EntityKey, PendingAction};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Remote operations for one table.
pub trait RemoteTable: Send + Sync {
    /// Creates an entity on the remote.
    fn create(&self, id: &EntityId, data: &Record) -> Result<(), RemoteError>;

    /// Overwrites the given fields of an entity on the remote.
    fn update(&self, id: &EntityId, data: &Record) -> Result<(), RemoteError>;

    /// Deletes an entity on the remote.
    fn delete(&self, id: &EntityId) -> Result<(), RemoteError>;

    /// Returns every record the remote holds for the table.
    fn fetch_all(&self) -> Result<Vec<Record>, RemoteError>;
}

fn apply(remote: &dyn RemoteTable, action: &PendingAction) -> Result<(), RemoteError> {
    match action {
        PendingAction::Create { id, data } => remote.create(id, data),
        PendingAction::Update { id, data } => remote.update(id, data),
        PendingAction::Delete { id } => remote.delete(id),
    }
}

/// Entities with a remote call running, and whether another dispatch
/// arrived for them meanwhile.
type Running = Arc<Mutex<HashMap<EntityKey, bool>>>;

/// Routes dispatches to per-table remotes.
pub struct RemoteRouter {
    tables: RwLock<HashMap<String, Arc<dyn RemoteTable>>>,
    running: Running,
    in_flight: Arc<watch::Sender<usize>>,
}

impl RemoteRouter {
    /// Creates a router with no tables.
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            tables: RwLock::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(in_flight),
        }
    }

    /// Registers (or replaces) the remote for `table`.
    pub fn register(&self, table: impl Into<String>, remote: Arc<dyn RemoteTable>) {
        self.tables.write().insert(table.into(), remote);
    }

    /// Returns the remote for `table`.
    pub fn remote(&self, table: &str) -> Option<Arc<dyn RemoteTable>> {
        self.tables.read().get(table).cloned()
    }

    /// Fetches the authoritative snapshot of `table`.
    ///
    /// # Errors
    ///
    /// Returns `RemoteNotRegistered` or the remote's failure as a
    /// `Dispatch` error.
    pub async fn fetch_all(&self, table: &str) -> SyncResult<Vec<Record>> {
        let remote = self
            .remote(table)
            .ok_or_else(|| SyncError::RemoteNotRegistered {
                table: table.to_string(),
            })?;
        let records = tokio::task::spawn_blocking(move || remote.fetch_all())
            .await
            .map_err(|e| SyncError::Dispatch {
                message: format!("fetch task failed: {e}"),
                retryable: true,
            })??;
        Ok(records)
    }

    /// Returns the number of remote calls still running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Waits until no remote call is running.
    pub async fn settle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for RemoteRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RemoteRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tables: Vec<String> = self.tables.read().keys().cloned().collect();
        tables.sort();
        f.debug_struct("RemoteRouter")
            .field("tables", &tables)
            .field("running", &self.running.lock().len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl DispatchHandler for RemoteRouter {
    fn dispatch(&self, request: DispatchRequest, ack: Acknowledger) {
        let Some(remote) = self.remote(request.table()) else {
            error!(
                table = %request.key.table,
                id = %request.key.id,
                "no remote registered for table"
            );
            return;
        };

        {
            let mut running = self.running.lock();
            if let Some(dirty) = running.get_mut(&request.key) {
                *dirty = true;
                debug!(
                    table = %request.key.table,
                    id = %request.key.id,
                    "remote call in flight, change queued behind it"
                );
                return;
            }
            running.insert(request.key.clone(), false);
        }

        let in_flight = InFlight::start(&self.in_flight);
        let claim = Claim {
            running: Arc::clone(&self.running),
            key: request.key.clone(),
        };
        tokio::task::spawn_blocking(move || {
            let _in_flight = in_flight;
            let mut next = Some((request, ack));
            while let Some((request, ack)) = next.take() {
                deliver(remote.as_ref(), &request, &ack);
                next = claim.follow_up(&ack);
            }
        });
    }
}

/// Sends one merged action and acknowledges it on success.
fn deliver(remote: &dyn RemoteTable, request: &DispatchRequest, ack: &Acknowledger) {
    match apply(remote, &request.action) {
        Ok(()) => match ack.acknowledge() {
            Ok(purged) => debug!(
                table = %request.key.table,
                id = %request.key.id,
                watermark = request.watermark.as_u64(),
                purged,
                "remote accepted change"
            ),
            Err(e) => error!(
                table = %request.key.table,
                id = %request.key.id,
                error = %e,
                "acknowledgment failed"
            ),
        },
        Err(e) => warn!(
            table = %request.key.table,
            id = %request.key.id,
            action = request.action.kind(),
            error = %e,
            "remote call failed, change stays pending"
        ),
    }
}

/// Exclusive right to call the remote for one entity.
struct Claim {
    running: Running,
    key: EntityKey,
}

impl Claim {
    /// Returns the next request to send for the entity, or releases the
    /// claim when no dispatch arrived during the last call.
    fn follow_up(&self, ack: &Acknowledger) -> Option<(DispatchRequest, Acknowledger)> {
        loop {
            {
                let mut running = self.running.lock();
                match running.get_mut(&self.key) {
                    Some(dirty) if *dirty => *dirty = false,
                    _ => {
                        running.remove(&self.key);
                        return None;
                    }
                }
            }
            if let Some(next) = ack.refresh() {
                return Some(next);
            }
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        // A panicking remote call must not block the entity for good.
        if std::thread::panicking() {
            self.running.lock().remove(&self.key);
        }
    }
}

/// Counts one running remote call, including calls that panic.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn start(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// One call received by a [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    /// `create`
    Create(EntityId, Record),
    /// `update`
    Update(EntityId, Record),
    /// `delete`
    Delete(EntityId),
    /// `fetch_all`
    FetchAll,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<EntityId, Record>,
    calls: Vec<RemoteCall>,
    failing: Option<RemoteError>,
}

/// An in-memory remote table that records every call.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record without recording a call.
    pub fn insert(&self, id: impl Into<EntityId>, record: Record) {
        self.state.lock().records.insert(id.into(), record);
    }

    /// Makes every following call fail with `error`, or succeed again
    /// with `None`.
    pub fn set_failure(&self, error: Option<RemoteError>) {
        self.state.lock().failing = error;
    }

    /// Returns the calls received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the records held, by id.
    pub fn records(&self) -> BTreeMap<EntityId, Record> {
        self.state.lock().records.clone()
    }

    fn record_call(&self, call: RemoteCall) -> Result<MutexGuard<'_, MemoryState>, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if let Some(e) = state.failing.clone() {
            return Err(e);
        }
        Ok(state)
    }
}

impl RemoteTable for MemoryRemote {
    fn create(&self, id: &EntityId, data: &Record) -> Result<(), RemoteError> {
        let mut state = self.record_call(RemoteCall::Create(id.clone(), data.clone()))?;
        state.records.insert(id.clone(), data.clone());
        Ok(())
    }

    fn update(&self, id: &EntityId, data: &Record) -> Result<(), RemoteError> {
        let mut state = self.record_call(RemoteCall::Update(id.clone(), data.clone()))?;
        let record = state.records.entry(id.clone()).or_default();
        record.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn delete(&self, id: &EntityId) -> Result<(), RemoteError> {
        let mut state = self.record_call(RemoteCall::Delete(id.clone()))?;
        state.records.remove(id);
        Ok(())
    }

    fn fetch_all(&self) -> Result<Vec<Record>, RemoteError> {
        let state = self.record_call(RemoteCall::FetchAll)?;
        Ok(state.records.values().cloned().collect())
    }
}
