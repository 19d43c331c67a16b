//! End-to-end scheduling scenarios against real stores, driven with explicit
//! timestamps instead of the wall clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tickwork_core::config::SchedulerConfig;
use tickwork_scheduler::bridge::encode;
use tickwork_scheduler::{
    FunctionRegistry, InvocationError, Invoker, MemoryStore, Scheduler, SchedulerError,
    SqliteStore, StoreError, Task, TaskRecord, TaskStore,
};

#[derive(Default)]
struct RecordingInvoker {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingInvoker {
    fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Invoker for RecordingInvoker {
    fn resolves(&self, function: &str) -> bool {
        matches!(function, "task_without_args" | "task_with_args" | "fails")
    }

    async fn invoke(&self, function: &str, args: &[String]) -> Result<(), InvocationError> {
        self.calls
            .lock()
            .unwrap()
            .push((function.to_string(), args.to_vec()));
        if function == "fails" {
            return Err(InvocationError::Failed {
                function: function.to_string(),
                reason: "always".to_string(),
            });
        }
        Ok(())
    }
}

/// Counts writes and can be taken offline.
#[derive(Default)]
struct InstrumentedStore {
    inner: MemoryStore,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl InstrumentedStore {
    fn gate(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl TaskStore for InstrumentedStore {
    fn add(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.gate()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.add(record)
    }
    fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.gate()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(record)
    }
    fn fetch(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.gate()?;
        self.inner.fetch()
    }
    fn remove(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.gate()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(record)
    }
    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

fn scheduler(store: Arc<dyn TaskStore>, invoker: Arc<RecordingInvoker>) -> Scheduler {
    Scheduler::new(store, invoker, &SchedulerConfig::default())
}

async fn sweep(scheduler: &Scheduler, now: DateTime<Utc>) {
    for handle in scheduler.run_pending_at(now) {
        handle.await.unwrap();
    }
}

fn hashes(store: &dyn TaskStore) -> Vec<String> {
    let mut hashes: Vec<String> = store.fetch().unwrap().into_iter().map(|r| r.hash).collect();
    hashes.sort();
    hashes
}

#[tokio::test]
async fn one_shot_runs_once_with_its_argument() {
    let store = Arc::new(MemoryStore::new());
    let invoker = Arc::new(RecordingInvoker::default());
    let scheduler = scheduler(store.clone(), invoker.clone());

    let start = Utc::now();
    let id = scheduler
        .run_after(Duration::from_secs(30), "task_with_args", &["reportId"])
        .unwrap();
    assert_eq!(hashes(&*store), vec![id.to_string()]);

    for second in 1..=40 {
        sweep(&scheduler, start + TimeDelta::seconds(second)).await;
    }

    assert_eq!(
        invoker.calls(),
        vec![("task_with_args".to_string(), vec!["reportId".to_string()])]
    );
    assert!(scheduler.get(&id).is_none());
    assert!(store.fetch().unwrap().is_empty());
}

#[tokio::test]
async fn recurring_task_keeps_its_cadence() {
    let store = Arc::new(MemoryStore::new());
    let invoker = Arc::new(RecordingInvoker::default());
    let scheduler = scheduler(store.clone(), invoker.clone());

    let id = scheduler
        .run_every(Duration::from_secs(5), "task_without_args", &[])
        .unwrap();
    let first = scheduler.get(&id).unwrap().schedule.next_run;
    let start = first - TimeDelta::seconds(5);

    for second in 1..=11 {
        sweep(&scheduler, start + TimeDelta::seconds(second)).await;
    }

    assert_eq!(invoker.calls().len(), 2);
    let task = scheduler.get(&id).unwrap();
    assert_eq!(task.schedule.last_run, Some(first + TimeDelta::seconds(5)));
    assert_eq!(task.schedule.next_run, first + TimeDelta::seconds(10));
}

#[tokio::test]
async fn failing_callback_does_not_stop_recurrence() {
    let store = Arc::new(MemoryStore::new());
    let invoker = Arc::new(RecordingInvoker::default());
    let scheduler = scheduler(store, invoker.clone());

    let id = scheduler.run_every(Duration::from_secs(1), "fails", &[]).unwrap();
    let first = scheduler.get(&id).unwrap().schedule.next_run;

    for step in 0..3 {
        sweep(&scheduler, first + TimeDelta::seconds(step)).await;
    }
    assert_eq!(invoker.calls().len(), 3);
    assert!(scheduler.get(&id).is_some());
}

#[tokio::test]
async fn schedulers_sharing_a_memory_store_converge() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let a = scheduler(Arc::clone(&store), Arc::new(RecordingInvoker::default()));
    let b = scheduler(Arc::clone(&store), Arc::new(RecordingInvoker::default()));

    let only_a = a
        .run_every(Duration::from_secs(5), "task_with_args", &["a"])
        .unwrap();
    let only_b = b
        .run_every(Duration::from_secs(10), "task_with_args", &["b"])
        .unwrap();
    a.reconcile().unwrap();

    let mut expected = vec![only_a.to_string(), only_b.to_string()];
    expected.sort();
    assert_eq!(hashes(&*store), expected);
    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
}

#[tokio::test]
async fn schedulers_sharing_a_sqlite_file_do_not_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tickwork.db");
    let first: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let second: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(&path).unwrap());

    let a = scheduler(first, Arc::new(RecordingInvoker::default()));
    let b = scheduler(Arc::clone(&second), Arc::new(RecordingInvoker::default()));

    let id = a
        .run_every(Duration::from_secs(5), "task_with_args", &["shared"])
        .unwrap();
    let same = b
        .run_every(Duration::from_secs(5), "task_with_args", &["shared"])
        .unwrap();

    assert_eq!(id, same);
    assert_eq!(hashes(&*second), vec![id.to_string()]);
}

#[test]
fn persisted_tasks_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tickwork.db");

    let id = {
        let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let before = scheduler(store, Arc::new(RecordingInvoker::default()));
        let id = before
            .run_every(Duration::from_secs(10), "task_with_args", &["persisted"])
            .unwrap();
        before.stop().unwrap();
        id
    };

    let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let after = scheduler(store, Arc::new(RecordingInvoker::default()));
    assert_eq!(after.reconcile().unwrap(), 0);
    let task = after.get(&id).unwrap();
    assert_eq!(task.function, "task_with_args");
    assert_eq!(task.params, vec!["persisted".to_string()]);
}

#[test]
fn cancel_of_unknown_id_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(store.clone(), Arc::new(RecordingInvoker::default()));
    scheduler
        .run_every(Duration::from_secs(5), "task_without_args", &[])
        .unwrap();
    let before = scheduler.tasks();

    let err = scheduler.cancel(&"0000".into()).unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound { .. }));
    assert_eq!(scheduler.tasks(), before);
    assert_eq!(store.fetch().unwrap().len(), 1);
}

#[test]
fn reconcile_is_idempotent() {
    let store = Arc::new(InstrumentedStore::default());
    let scheduler = scheduler(store.clone(), Arc::new(RecordingInvoker::default()));
    scheduler
        .run_every(Duration::from_secs(5), "task_without_args", &[])
        .unwrap();
    scheduler
        .run_after(Duration::from_secs(5), "task_with_args", &["x"])
        .unwrap();

    let writes = store.writes.load(Ordering::SeqCst);
    assert_eq!(scheduler.reconcile().unwrap(), 0);
    assert_eq!(scheduler.reconcile().unwrap(), 0);
    assert_eq!(store.writes.load(Ordering::SeqCst), writes);
}

#[tokio::test]
async fn store_outage_is_retried_on_later_sweeps() {
    let store = Arc::new(InstrumentedStore::default());
    let scheduler = scheduler(store.clone(), Arc::new(RecordingInvoker::default()));

    store.offline.store(true, Ordering::SeqCst);
    let id = scheduler
        .run_every(Duration::from_secs(5), "task_without_args", &[])
        .unwrap();
    assert!(scheduler.get(&id).is_some());
    sweep(&scheduler, Utc::now()).await;
    assert!(store.inner.fetch().unwrap().is_empty());

    store.offline.store(false, Ordering::SeqCst);
    sweep(&scheduler, Utc::now()).await;
    assert_eq!(hashes(&store.inner), vec![id.to_string()]);
}

#[test]
fn corrupt_records_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    let good = Task::every("task_with_args", vec!["ok".into()], Duration::from_secs(5), Utc::now());
    store.add(&encode(&good)).unwrap();

    let mut bad = encode(&Task::once("task_without_args", vec![], Utc::now()));
    bad.next_run = "not a timestamp".to_string();
    store.add(&bad).unwrap();

    let scheduler = scheduler(store.clone(), Arc::new(RecordingInvoker::default()));
    assert_eq!(scheduler.reconcile().unwrap(), 0);
    assert_eq!(scheduler.len(), 1);
    assert!(scheduler.get(&good.id()).is_some());
    // The corrupt row is left alone rather than overwritten.
    assert_eq!(store.fetch().unwrap().len(), 2);
}

#[tokio::test]
async fn registry_callbacks_run_through_the_scheduler() {
    let registry = Arc::new(FunctionRegistry::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    registry
        .register("task_with_args", 1, move |args| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(args[0].clone());
                Ok::<(), String>(())
            }
        })
        .unwrap();

    let scheduler = Scheduler::new(
        Arc::new(MemoryStore::new()),
        registry,
        &SchedulerConfig::default(),
    );
    let at = Utc::now();
    scheduler.run_at(at, "task_with_args", &["hello"]).unwrap();
    assert!(matches!(
        scheduler.run_at(at, "unregistered", &[]),
        Err(SchedulerError::FunctionResolution { .. })
    ));

    sweep(&scheduler, at).await;
    assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn started_scheduler_fires_due_tasks_on_its_own() {
    let invoker = Arc::new(RecordingInvoker::default());
    let scheduler = Scheduler::new(
        Arc::new(MemoryStore::new()),
        invoker.clone(),
        &SchedulerConfig { tick_interval_ms: 10 },
    );
    scheduler.run_at(Utc::now(), "task_without_args", &[]).unwrap();
    scheduler.start().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while invoker.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task fired");

    // Registered after start: only the tick loop can pick this one up.
    scheduler
        .run_after(Duration::from_millis(30), "task_with_args", &["later"])
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while invoker.calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tick loop fired the later task");

    scheduler.stop().unwrap();
    scheduler.wait().await;
    assert_eq!(invoker.calls().len(), 2);
    assert_eq!(invoker.calls()[1].1, vec!["later".to_string()]);
}

/// Memory store whose next `fetch` stalls after reading until released.
#[derive(Default)]
struct StallingStore {
    inner: MemoryStore,
    gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl StallingStore {
    /// Returns (signal that the fetch has read, handle that lets it finish).
    fn stall_next_fetch(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (fetched_tx, fetched_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some((fetched_tx, release_rx));
        (fetched_rx, release_tx)
    }
}

impl TaskStore for StallingStore {
    fn add(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.inner.add(record)
    }
    fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.inner.update(record)
    }
    fn fetch(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let records = self.inner.fetch()?;
        let gate = self.gate.lock().unwrap().take();
        if let Some((fetched, release)) = gate {
            let _ = fetched.send(());
            let _ = release.recv();
        }
        Ok(records)
    }
    fn remove(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.inner.remove(record)
    }
    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

#[test]
fn cancel_during_reconcile_stays_canceled() {
    let store = Arc::new(StallingStore::default());
    let scheduler = scheduler(store.clone(), Arc::new(RecordingInvoker::default()));
    let id = scheduler
        .run_every(Duration::from_secs(5), "task_without_args", &[])
        .unwrap();

    let (fetched, release) = store.stall_next_fetch();
    std::thread::scope(|scope| {
        let reconciling = scope.spawn(|| scheduler.reconcile());
        fetched.recv().unwrap();

        let canceling = scope.spawn(|| scheduler.cancel(&id));
        std::thread::sleep(Duration::from_millis(50));
        release.send(()).unwrap();

        reconciling.join().unwrap().unwrap();
        canceling.join().unwrap().unwrap();
    });

    assert!(scheduler.get(&id).is_none());
    assert!(store.inner.fetch().unwrap().is_empty());
    assert_eq!(scheduler.reconcile().unwrap(), 0);
    assert!(scheduler.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweep_during_reconcile_fires_one_shot_once() {
    let store = Arc::new(StallingStore::default());
    let invoker = Arc::new(RecordingInvoker::default());
    let scheduler = scheduler(store.clone(), invoker.clone());
    let at = Utc::now();
    let id = scheduler.run_at(at, "task_without_args", &[]).unwrap();

    let (fetched, release) = store.stall_next_fetch();
    let reconciling = {
        let scheduler = scheduler.clone();
        tokio::task::spawn_blocking(move || scheduler.reconcile())
    };
    tokio::task::spawn_blocking(move || fetched.recv())
        .await
        .unwrap()
        .unwrap();

    let sweeping = {
        let scheduler = scheduler.clone();
        tokio::task::spawn_blocking(move || scheduler.run_pending_at(at))
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.send(()).unwrap();

    reconciling.await.unwrap().unwrap();
    for handle in sweeping.await.unwrap() {
        handle.await.unwrap();
    }
    sweep(&scheduler, at + TimeDelta::seconds(1)).await;

    assert_eq!(invoker.calls().len(), 1);
    assert!(scheduler.get(&id).is_none());
    assert!(store.inner.fetch().unwrap().is_empty());
}
