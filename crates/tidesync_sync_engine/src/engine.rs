//! The dispatch coordinator.
//!
//! A [`SyncEngine`] owns the local database, the connectivity monitor, the
//! dispatch handler and the state listeners. Local writes and deletes are
//! made durable synchronously; delivering them is queued for a single
//! worker task, which merges each entity's pending entries and hands the
//! result to the handler. Because one task performs every merge and every
//! dispatch, a reconnect sweep never interleaves with the dispatch of a
//! concurrent local write to the same entity.

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, NetworkProbe, NetworkStatus};
use crate::dispatch::{Acknowledger, DispatchHandler, DispatchRequest, StateListener};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteRouter;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tidesync_codec::{Record, Value};
use tidesync_core::{Database, EntityId, EntityKey, EntryId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State shared by engine handles, the worker and acknowledgers.
pub(crate) struct Shared {
    db: Database,
    monitor: ConnectivityMonitor,
    handler: Arc<dyn DispatchHandler>,
    listeners: RwLock<Vec<Arc<dyn StateListener>>>,
}

impl Shared {
    fn notify(&self) {
        let status = self.monitor.status();
        let pending = self.db.log().len();
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_state(status, pending);
        }
    }

    /// Purges entries for `key`, all of them or those up to `through`.
    pub(crate) fn acknowledge(
        &self,
        key: &EntityKey,
        through: Option<EntryId>,
    ) -> SyncResult<usize> {
        let purged = match through {
            Some(watermark) => self.db.acknowledge_through(key, watermark)?,
            None => self.db.acknowledge(key)?,
        };
        if purged > 0 {
            info!(
                table = %key.table,
                id = %key.id,
                watermark = ?through.map(EntryId::as_u64),
                purged,
                "changes acknowledged"
            );
            self.notify();
        }
        Ok(purged)
    }

    /// Merges the pending entries of `key` into a request, if online and
    /// anything is pending.
    pub(crate) fn prepare(
        self: &Arc<Self>,
        key: &EntityKey,
    ) -> Option<(DispatchRequest, Acknowledger)> {
        if !self.monitor.is_online() {
            debug!(table = %key.table, id = %key.id, "offline, dispatch deferred");
            return None;
        }
        let Some(merged) = self.db.merged(key) else {
            debug!(table = %key.table, id = %key.id, "nothing pending");
            return None;
        };

        debug!(
            table = %merged.key.table,
            id = %merged.key.id,
            action = merged.action.kind(),
            watermark = merged.watermark.as_u64(),
            entries = merged.entry_count,
            "dispatching"
        );
        let ack = Acknowledger::new(Arc::clone(self), merged.key.clone(), merged.watermark);
        let request = DispatchRequest {
            key: merged.key,
            action: merged.action,
            watermark: merged.watermark,
            entry_count: merged.entry_count,
        };
        Some((request, ack))
    }

    fn dispatch(self: &Arc<Self>, key: EntityKey) {
        if let Some((request, ack)) = self.prepare(&key) {
            self.handler.dispatch(request, ack);
        }
    }

    fn sweep(self: &Arc<Self>) {
        if !self.monitor.is_online() {
            debug!("offline, sweep skipped");
            return;
        }
        let keys = self.db.pending_keys();
        info!(keys = keys.len(), "sweeping pending log");
        for key in keys {
            self.dispatch(key);
        }
    }
}

enum Command {
    Dispatch(EntityKey),
    Sweep,
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

async fn run(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    debug!("dispatch worker started");
    while let Some(command) = commands.recv().await {
        match command {
            Command::Dispatch(key) => shared.dispatch(key),
            Command::Sweep => shared.sweep(),
            Command::Barrier(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }
    debug!("dispatch worker stopped");
}

/// Handle to a running sync engine. Clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    router: Option<Arc<RemoteRouter>>,
}

impl SyncEngine {
    /// Starts an engine over `db` that delivers through `handler`.
    ///
    /// Must be called within a tokio runtime. The initial network status is
    /// `config.initial_status`, else whatever `probe` reports.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` if the worker could not be reached.
    pub async fn start(
        db: Database,
        config: SyncConfig,
        probe: &dyn NetworkProbe,
        handler: Arc<dyn DispatchHandler>,
    ) -> SyncResult<Self> {
        Self::spawn(db, &config, probe, handler, None)
    }

    /// Starts an engine that delivers through per-table remotes.
    ///
    /// The router also serves [`SyncEngine::pull`], and [`SyncEngine::flush`]
    /// waits for its remote calls to finish.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` if the worker could not be reached.
    pub async fn start_with_router(
        db: Database,
        config: SyncConfig,
        probe: &dyn NetworkProbe,
        router: Arc<RemoteRouter>,
    ) -> SyncResult<Self> {
        let handler: Arc<dyn DispatchHandler> = router.clone();
        Self::spawn(db, &config, probe, handler, Some(router))
    }

    fn spawn(
        db: Database,
        config: &SyncConfig,
        probe: &dyn NetworkProbe,
        handler: Arc<dyn DispatchHandler>,
        router: Option<Arc<RemoteRouter>>,
    ) -> SyncResult<Self> {
        let initial = config.initial_status.unwrap_or_else(|| probe.current());
        let shared = Arc::new(Shared {
            db,
            monitor: ConnectivityMonitor::new(initial),
            handler,
            listeners: RwLock::new(Vec::new()),
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(Arc::clone(&shared), receiver));

        let engine = Self {
            shared,
            commands,
            worker: Arc::new(Mutex::new(Some(worker))),
            router,
        };

        info!(
            status = %initial,
            pending = engine.pending_count(),
            "sync engine started"
        );
        if config.sweep_on_start && initial.is_online() {
            engine.send(Command::Sweep)?;
        }
        Ok(engine)
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::EngineStopped)
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.commands.is_closed() {
            return Err(SyncError::EngineStopped);
        }
        Ok(())
    }

    fn enqueue_dispatch(&self, key: EntityKey) {
        // Changes made offline are picked up by the sweep on reconnect.
        if !self.shared.monitor.is_online() {
            return;
        }
        if self.send(Command::Dispatch(key)).is_err() {
            warn!("sync engine stopped, change stays pending");
        }
    }

    /// Writes a record and schedules its dispatch.
    ///
    /// Returns the stored record (schema defaults applied) once the store
    /// and the pending log are durable. Dispatch happens later on the worker.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` after shutdown, or the database error; on
    /// error nothing was written.
    pub fn write(&self, table: &str, record: Record) -> SyncResult<Record> {
        self.ensure_running()?;
        let outcome = self.shared.db.write(table, record)?;
        debug!(
            table,
            id = %outcome.key.id,
            entry_id = outcome.entry_id.as_u64(),
            created = outcome.created,
            "write accepted"
        );
        self.shared.notify();
        self.enqueue_dispatch(outcome.key);
        Ok(outcome.record)
    }

    /// Deletes records by primary key and schedules their dispatch.
    ///
    /// Ids with no record are skipped. Returns how many records were
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` after shutdown, or the first database error;
    /// deletions before the failing id stay in effect.
    pub fn delete(&self, table: &str, ids: &[EntityId]) -> SyncResult<usize> {
        self.ensure_running()?;
        let mut deleted = 0;
        for id in ids {
            let Some(entry_id) = self.shared.db.delete(table, id)? else {
                debug!(table, id = %id, "delete of absent record skipped");
                continue;
            };
            debug!(table, id = %id, entry_id = entry_id.as_u64(), "delete accepted");
            deleted += 1;
            self.shared.notify();
            self.enqueue_dispatch(EntityKey::new(table, id.clone()));
        }
        Ok(deleted)
    }

    /// Purges every pending entry for an entity.
    ///
    /// Unlike [`Acknowledger::acknowledge`], this also drops entries written
    /// after the last dispatch. Returns how many entries were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the purge cannot be recorded.
    pub fn acknowledge(&self, table: &str, id: &EntityId) -> SyncResult<usize> {
        self.shared
            .acknowledge(&EntityKey::new(table, id.clone()), None)
    }

    /// Re-offers every pending entity once.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` after shutdown.
    pub fn reconnect_sweep(&self) -> SyncResult<()> {
        self.send(Command::Sweep)
    }

    /// Records a network status reported by the platform.
    ///
    /// Going online queues a sweep of the whole pending log before
    /// `watch_status` subscribers are woken and listeners are told; going
    /// offline only notifies. Reporting the current status again does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` if a sweep is due but the engine is stopped.
    pub fn set_network_status(&self, status: NetworkStatus) -> SyncResult<()> {
        let mut sweep = Ok(());
        let changed = self.shared.monitor.set_with(status, |status| {
            if status.is_online() {
                sweep = self.send(Command::Sweep);
            }
        });
        if !changed {
            return Ok(());
        }
        info!(status = %status, pending = self.pending_count(), "network status changed");
        sweep?;
        self.shared.notify();
        Ok(())
    }

    /// Returns the current network status.
    pub fn status(&self) -> NetworkStatus {
        self.shared.monitor.status()
    }

    /// Subscribes to network status changes.
    pub fn watch_status(&self) -> watch::Receiver<NetworkStatus> {
        self.shared.monitor.subscribe()
    }

    /// Registers a state listener.
    pub fn on_state_change(&self, listener: impl StateListener + 'static) {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    /// Returns the number of pending log entries.
    pub fn pending_count(&self) -> usize {
        self.shared.db.log().len()
    }

    /// Replaces `table` with an authoritative snapshot. Pending entries are
    /// kept and redelivered. Returns the new record count.
    ///
    /// # Errors
    ///
    /// Returns the database error; the table is unchanged on error.
    pub fn reconcile(&self, table: &str, records: Vec<Record>) -> SyncResult<usize> {
        Ok(self.shared.db.reconcile(table, records)?)
    }

    /// Fetches `table` from its remote and reconciles with it.
    ///
    /// # Errors
    ///
    /// Returns `RemoteNotRegistered` without a router or a remote for the
    /// table, the remote's failure, or the database error.
    pub async fn pull(&self, table: &str) -> SyncResult<usize> {
        let router = self
            .router
            .as_ref()
            .ok_or_else(|| SyncError::RemoteNotRegistered {
                table: table.to_string(),
            })?;
        let records = router.fetch_all(table).await?;
        self.reconcile(table, records)
    }

    /// Returns a record by primary key.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn get(&self, table: &str, id: &EntityId) -> SyncResult<Option<Record>> {
        Ok(self.shared.db.get(table, id)?)
    }

    /// Returns every record of a table.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if the table does not exist.
    pub fn get_all(&self, table: &str) -> SyncResult<Vec<Record>> {
        Ok(self.shared.db.get_all(table)?)
    }

    /// Returns the records whose indexed `column` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable`, or `InvalidArgument` for unindexed columns.
    pub fn find_by(&self, table: &str, column: &str, value: &Value) -> SyncResult<Vec<Record>> {
        Ok(self.shared.db.find_by(table, column, value)?)
    }

    /// Returns the underlying database.
    pub fn database(&self) -> &Database {
        &self.shared.db
    }

    /// Waits until the worker has handled everything queued before this
    /// call, and until routed remote calls have finished.
    ///
    /// # Errors
    ///
    /// Returns `EngineStopped` if the worker is gone.
    pub async fn flush(&self) -> SyncResult<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Barrier(done))?;
        wait.await.map_err(|_| SyncError::EngineStopped)?;
        if let Some(router) = &self.router {
            router.settle().await;
        }
        Ok(())
    }

    /// Stops the worker after it has drained the commands already queued.
    /// Later calls do nothing.
    pub async fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.send(Command::Shutdown);
        if let Err(e) = worker.await {
            error!(error = %e, "dispatch worker failed");
        }
        if let Some(router) = &self.router {
            router.settle().await;
        }
        info!(pending = self.pending_count(), "sync engine stopped");
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("status", &self.status())
            .field("pending", &self.pending_count())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
