//! End-to-end tests for the sync engine.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tidesync_codec::{record, Record, Value};
use tidesync_core::{Backends, ColumnDef, Config, Database, EntityId, PendingAction, TableSchema};
use tidesync_storage::InMemoryBackend;
use tidesync_sync_engine::{
    Acknowledger, DispatchHandler, DispatchRequest, MemoryRemote, NetworkStatus, RemoteCall,
    RemoteError, RemoteRouter, RemoteTable, StaticProbe, SyncConfig, SyncEngine, SyncError,
};

fn tasks() -> TableSchema {
    TableSchema::new("tasks")
        .column(ColumnDef::new("id").primary())
        .column(ColumnDef::new("title"))
        .column(ColumnDef::new("done").default_value(false))
        .column(ColumnDef::new("project").indexed())
}

/// Records every dispatch together with its acknowledger.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(DispatchRequest, Acknowledger)>>>,
}

impl Recorder {
    fn handler(&self) -> Arc<dyn DispatchHandler> {
        let seen = Arc::clone(&self.seen);
        Arc::new(move |request: DispatchRequest, ack: Acknowledger| {
            seen.lock().push((request, ack));
        })
    }

    fn requests(&self) -> Vec<DispatchRequest> {
        self.seen.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    fn take(&self) -> Vec<(DispatchRequest, Acknowledger)> {
        std::mem::take(&mut *self.seen.lock())
    }
}

async fn engine(status: NetworkStatus) -> (SyncEngine, Recorder) {
    let recorder = Recorder::default();
    let db = Database::open_in_memory(vec![tasks()]).unwrap();
    let probe = StaticProbe(status);
    let engine = SyncEngine::start(db, SyncConfig::new(), &probe, recorder.handler())
        .await
        .unwrap();
    (engine, recorder)
}

fn id(s: &str) -> EntityId {
    EntityId::from(s)
}

#[tokio::test]
async fn offline_edits_collapse_into_one_create() {
    let (engine, recorder) = engine(NetworkStatus::Offline).await;

    engine
        .write("tasks", record! { "id" => "t1", "title" => "a" })
        .unwrap();
    engine
        .write("tasks", record! { "id" => "t1", "title" => "b" })
        .unwrap();
    engine.flush().await.unwrap();
    assert!(recorder.requests().is_empty());
    assert_eq!(engine.pending_count(), 2);

    engine.set_network_status(NetworkStatus::Online).unwrap();
    engine.flush().await.unwrap();

    let requests = recorder.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].action,
        PendingAction::Create {
            id: id("t1"),
            data: record! {
                "id" => "t1",
                "title" => "b",
                "done" => false,
                "project" => Value::Null,
            },
        }
    );
    assert_eq!(requests[0].entry_count, 2);
}

#[tokio::test]
async fn delete_before_ack_dispatches_delete() {
    let (engine, recorder) = engine(NetworkStatus::Online).await;

    engine.write("tasks", record! { "id" => "t2" }).unwrap();
    engine.flush().await.unwrap();
    assert_eq!(engine.delete("tasks", &[id("t2")]).unwrap(), 1);
    engine.flush().await.unwrap();

    let requests = recorder.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].action.kind(), "create");
    assert_eq!(requests[1].action, PendingAction::Delete { id: id("t2") });
}

#[tokio::test]
async fn delete_skips_absent_ids() {
    let (engine, recorder) = engine(NetworkStatus::Online).await;

    engine.write("tasks", record! { "id" => "t1" }).unwrap();
    engine.write("tasks", record! { "id" => "t3" }).unwrap();
    engine.flush().await.unwrap();
    recorder.take();

    let deleted = engine
        .delete("tasks", &[id("t1"), id("missing"), id("t3")])
        .unwrap();
    assert_eq!(deleted, 2);
    engine.flush().await.unwrap();
    assert_eq!(recorder.requests().len(), 2);
    assert!(recorder.requests().iter().all(|r| r.action.is_delete()));
}

#[tokio::test]
async fn sweep_offers_each_key_once_until_acknowledged() {
    let (engine, recorder) = engine(NetworkStatus::Offline).await;

    for n in 0..3 {
        engine
            .write("tasks", record! { "id" => "a", "title" => n })
            .unwrap();
    }
    engine.write("tasks", record! { "id" => "b" }).unwrap();

    engine.set_network_status(NetworkStatus::Online).unwrap();
    engine.flush().await.unwrap();

    let dispatched = recorder.take();
    assert_eq!(dispatched.len(), 2);
    for (_, ack) in &dispatched {
        ack.acknowledge().unwrap();
    }
    assert_eq!(engine.pending_count(), 0);

    engine.reconnect_sweep().unwrap();
    engine.flush().await.unwrap();
    assert!(recorder.requests().is_empty());
}

#[tokio::test]
async fn unacknowledged_changes_are_offered_again() {
    let (engine, recorder) = engine(NetworkStatus::Online).await;

    engine.write("tasks", record! { "id" => "t1" }).unwrap();
    engine.flush().await.unwrap();
    assert_eq!(recorder.take().len(), 1);

    engine.reconnect_sweep().unwrap();
    engine.flush().await.unwrap();
    assert_eq!(recorder.take().len(), 1);
}

#[tokio::test]
async fn watermark_ack_keeps_later_writes() {
    let (engine, recorder) = engine(NetworkStatus::Online).await;

    engine
        .write("tasks", record! { "id" => "t1", "title" => "first" })
        .unwrap();
    engine.flush().await.unwrap();
    let (_, first_ack) = recorder.take().remove(0);

    // Lands between dispatch and acknowledgment.
    engine
        .write("tasks", record! { "id" => "t1", "title" => "second" })
        .unwrap();
    engine.flush().await.unwrap();
    recorder.take();

    assert_eq!(first_ack.acknowledge().unwrap(), 1);
    assert_eq!(first_ack.acknowledge().unwrap(), 0);
    assert_eq!(engine.pending_count(), 1);

    engine.reconnect_sweep().unwrap();
    engine.flush().await.unwrap();
    let requests = recorder.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].action.kind(), "update");
    assert_eq!(
        requests[0].action.data().unwrap()["title"],
        Value::from("second")
    );
}

#[tokio::test]
async fn bare_acknowledge_purges_everything() {
    let (engine, _) = engine(NetworkStatus::Offline).await;

    engine.write("tasks", record! { "id" => "t1" }).unwrap();
    engine.write("tasks", record! { "id" => "t1" }).unwrap();
    assert_eq!(engine.acknowledge("tasks", &id("t1")).unwrap(), 2);
    assert_eq!(engine.acknowledge("tasks", &id("t1")).unwrap(), 0);
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn going_offline_stops_dispatch() {
    let (engine, recorder) = engine(NetworkStatus::Online).await;

    engine.set_network_status(NetworkStatus::Offline).unwrap();
    engine.write("tasks", record! { "id" => "t1" }).unwrap();
    engine.flush().await.unwrap();
    assert!(recorder.requests().is_empty());
    assert_eq!(engine.pending_count(), 1);
}

#[tokio::test]
async fn reconcile_preserves_pending_writes() {
    let (engine, recorder) = engine(NetworkStatus::Offline).await;

    engine
        .write("tasks", record! { "id" => "local", "title" => "mine" })
        .unwrap();
    let count = engine
        .reconcile(
            "tasks",
            vec![
                record! { "id" => "r1", "project" => "p" },
                record! { "id" => "r2", "project" => "p" },
            ],
        )
        .unwrap();
    assert_eq!(count, 2);
    assert!(engine.get("tasks", &id("local")).unwrap().is_none());
    assert_eq!(
        engine.find_by("tasks", "project", &Value::from("p")).unwrap().len(),
        2
    );

    engine.set_network_status(NetworkStatus::Online).unwrap();
    engine.flush().await.unwrap();
    let requests = recorder.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].key.id, id("local"));
}

#[tokio::test]
async fn listeners_track_status_and_pending_count() {
    let (engine, recorder) = engine(NetworkStatus::Offline).await;
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    engine.on_state_change(move |status: NetworkStatus, pending: usize| {
        sink.lock().push((status, pending));
    });
    let mut status_rx = engine.watch_status();

    engine.write("tasks", record! { "id" => "t1" }).unwrap();
    engine.set_network_status(NetworkStatus::Online).unwrap();
    engine.set_network_status(NetworkStatus::Online).unwrap();
    engine.flush().await.unwrap();
    for (_, ack) in recorder.take() {
        ack.acknowledge().unwrap();
    }

    assert_eq!(
        *states.lock(),
        vec![
            (NetworkStatus::Offline, 1),
            (NetworkStatus::Online, 1),
            (NetworkStatus::Online, 0),
        ]
    );
    assert!(status_rx.has_changed().unwrap());
    assert_eq!(*status_rx.borrow_and_update(), NetworkStatus::Online);
}

#[tokio::test]
async fn failed_log_append_surfaces_and_changes_nothing() {
    let log = InMemoryBackend::new();
    let db = Database::open_with_backends(
        Config::default(),
        Backends {
            catalog: Box::new(InMemoryBackend::new()),
            store: Box::new(InMemoryBackend::new()),
            log: Box::new(log.clone()),
        },
        vec![tasks()],
    )
    .unwrap();
    let recorder = Recorder::default();
    let engine = SyncEngine::start(
        db,
        SyncConfig::new(),
        &StaticProbe(NetworkStatus::Online),
        recorder.handler(),
    )
    .await
    .unwrap();

    log.set_fail_writes(true);
    let err = engine.write("tasks", record! { "id" => "t1" }).unwrap_err();
    assert!(err.is_storage());
    assert!(engine.get("tasks", &id("t1")).unwrap().is_none());
    assert_eq!(engine.pending_count(), 0);

    engine.flush().await.unwrap();
    assert!(recorder.requests().is_empty());
}

#[tokio::test]
async fn unknown_table_is_reported() {
    let (engine, _) = engine(NetworkStatus::Online).await;
    let err = engine.write("nope", Record::new()).unwrap_err();
    assert!(matches!(err, SyncError::Core(_)));
    assert!(!err.is_storage());
}

#[tokio::test]
async fn pending_changes_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let db = Database::open(&path, Config::default(), vec![tasks()]).unwrap();
        let recorder = Recorder::default();
        let engine = SyncEngine::start(
            db,
            SyncConfig::new(),
            &StaticProbe(NetworkStatus::Offline),
            recorder.handler(),
        )
        .await
        .unwrap();
        engine
            .write("tasks", record! { "id" => "t1", "title" => "saved" })
            .unwrap();
        engine.shutdown().await;
    }

    let db = Database::open(&path, Config::default(), vec![tasks()]).unwrap();
    let recorder = Recorder::default();
    let engine = SyncEngine::start(
        db,
        SyncConfig::new(),
        &StaticProbe(NetworkStatus::Online),
        recorder.handler(),
    )
    .await
    .unwrap();
    engine.flush().await.unwrap();

    let requests = recorder.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].action.data().unwrap()["title"],
        Value::from("saved")
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn router_delivers_and_acknowledges() {
    let remote = Arc::new(MemoryRemote::new());
    let router = Arc::new(RemoteRouter::new());
    router.register("tasks", remote.clone());

    let db = Database::open_in_memory(vec![tasks()]).unwrap();
    let engine = SyncEngine::start_with_router(
        db,
        SyncConfig::new(),
        &StaticProbe(NetworkStatus::Online),
        Arc::clone(&router),
    )
    .await
    .unwrap();

    engine
        .write("tasks", record! { "id" => "t1", "title" => "x" })
        .unwrap();
    engine.flush().await.unwrap();

    assert_eq!(engine.pending_count(), 0);
    assert_eq!(remote.records()[&id("t1")]["title"], Value::from("x"));

    engine.delete("tasks", &[id("t1")]).unwrap();
    engine.flush().await.unwrap();
    assert!(remote.records().is_empty());
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn router_failure_keeps_entries_for_retry() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_failure(Some(RemoteError::Unavailable("503".into())));
    let router = Arc::new(RemoteRouter::new());
    router.register("tasks", remote.clone());

    let db = Database::open_in_memory(vec![tasks()]).unwrap();
    let engine = SyncEngine::start_with_router(
        db,
        SyncConfig::new(),
        &StaticProbe(NetworkStatus::Online),
        router,
    )
    .await
    .unwrap();

    engine.write("tasks", record! { "id" => "t1" }).unwrap();
    engine.flush().await.unwrap();
    assert_eq!(engine.pending_count(), 1);

    remote.set_failure(None);
    engine.reconnect_sweep().unwrap();
    engine.flush().await.unwrap();
    assert_eq!(engine.pending_count(), 0);

    let creates = remote
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RemoteCall::Create(..)))
        .count();
    assert_eq!(creates, 2);
}

#[tokio::test]
async fn pull_reconciles_from_remote() {
    let remote = Arc::new(MemoryRemote::new());
    remote.insert("r1", record! { "id" => "r1", "title" => "remote" });
    let router = Arc::new(RemoteRouter::new());
    router.register("tasks", remote.clone());

    let db = Database::open_in_memory(vec![tasks()]).unwrap();
    let engine = SyncEngine::start_with_router(
        db,
        SyncConfig::new(),
        &StaticProbe(NetworkStatus::Offline),
        router,
    )
    .await
    .unwrap();

    engine.write("tasks", record! { "id" => "local" }).unwrap();
    assert_eq!(engine.pull("tasks").await.unwrap(), 1);
    assert_eq!(
        engine.get("tasks", &id("r1")).unwrap().unwrap()["title"],
        Value::from("remote")
    );
    assert_eq!(engine.pending_count(), 1);

    assert!(matches!(
        engine.pull("notes").await,
        Err(SyncError::RemoteNotRegistered { .. })
    ));
}

#[tokio::test]
async fn pull_without_router_is_an_error() {
    let (engine, _) = engine(NetworkStatus::Online).await;
    assert!(matches!(
        engine.pull("tasks").await,
        Err(SyncError::RemoteNotRegistered { .. })
    ));
}

/// A remote that takes its time with records titled "slow".
#[derive(Default)]
struct SlowRemote {
    inner: MemoryRemote,
}

impl SlowRemote {
    fn pause(data: &Record) {
        if data.get("title") == Some(&Value::from("slow")) {
            std::thread::sleep(Duration::from_millis(300));
        }
    }
}

impl RemoteTable for SlowRemote {
    fn create(&self, id: &EntityId, data: &Record) -> Result<(), RemoteError> {
        Self::pause(data);
        self.inner.create(id, data)
    }

    fn update(&self, id: &EntityId, data: &Record) -> Result<(), RemoteError> {
        Self::pause(data);
        self.inner.update(id, data)
    }

    fn delete(&self, id: &EntityId) -> Result<(), RemoteError> {
        self.inner.delete(id)
    }

    fn fetch_all(&self) -> Result<Vec<Record>, RemoteError> {
        self.inner.fetch_all()
    }
}

async fn slow_engine() -> (SyncEngine, Arc<SlowRemote>) {
    let remote = Arc::new(SlowRemote::default());
    let router = Arc::new(RemoteRouter::new());
    router.register("tasks", remote.clone());

    let db = Database::open_in_memory(vec![tasks()]).unwrap();
    let probe = StaticProbe(NetworkStatus::Online);
    let engine = SyncEngine::start_with_router(db, SyncConfig::new(), &probe, router)
        .await
        .unwrap();
    (engine, remote)
}

#[tokio::test]
async fn later_write_waits_for_slow_remote_call() {
    let (engine, remote) = slow_engine().await;

    engine
        .write("tasks", record! { "id" => "t1", "title" => "slow" })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .write("tasks", record! { "id" => "t1", "title" => "fast" })
        .unwrap();
    engine.flush().await.unwrap();

    assert_eq!(engine.pending_count(), 0);
    let local = engine.get("tasks", &id("t1")).unwrap().unwrap();
    assert_eq!(remote.inner.records()[&id("t1")], local);

    let calls = remote.inner.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0], RemoteCall::Create(_, data) if data["title"] == Value::from("slow")));
    assert!(matches!(&calls[1], RemoteCall::Update(_, data) if data["title"] == Value::from("fast")));
}

#[tokio::test]
async fn delete_does_not_overtake_slow_create() {
    let (engine, remote) = slow_engine().await;

    engine
        .write("tasks", record! { "id" => "t1", "title" => "slow" })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.delete("tasks", &[id("t1")]).unwrap(), 1);
    engine.flush().await.unwrap();

    assert_eq!(engine.pending_count(), 0);
    assert!(engine.get("tasks", &id("t1")).unwrap().is_none());
    assert!(remote.inner.records().is_empty());
    assert_eq!(remote.inner.calls().last(), Some(&RemoteCall::Delete(id("t1"))));
}

#[tokio::test]
async fn slow_entity_does_not_hold_up_others() {
    let (engine, remote) = slow_engine().await;

    engine
        .write("tasks", record! { "id" => "t1", "title" => "slow" })
        .unwrap();
    engine
        .write("tasks", record! { "id" => "t2", "title" => "fast" })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(remote.inner.records().contains_key(&id("t2")));

    engine.flush().await.unwrap();
    assert_eq!(remote.inner.records().len(), 2);
    assert_eq!(engine.pending_count(), 0);
}
