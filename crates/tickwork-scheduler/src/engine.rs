use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tickwork_core::config::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    bridge::StoreBridge,
    error::{Result, SchedulerError},
    invoker::Invoker,
    store::TaskStore,
    task::{add_interval, Task, TaskId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Everything guarded by the registry lock.
#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, Task>,
    /// Registered tasks whose last store write failed. Re-written every sweep.
    unsynced: HashSet<TaskId>,
    /// Tasks dropped from `tasks` whose store delete failed. Re-deleted every
    /// sweep and never re-adopted by reconciliation meanwhile.
    tombstones: HashMap<TaskId, Task>,
    /// The last reconciliation could not fetch from the store.
    reconcile_pending: bool,
}

struct Inner {
    registry: Mutex<Registry>,
    bridge: StoreBridge,
    invoker: Arc<dyn Invoker>,
    tick: Duration,
    lifecycle: Mutex<Lifecycle>,
    shutdown: watch::Sender<bool>,
}

/// In-process task scheduler with a persistent mirror.
///
/// Cheap to clone; every clone drives the same registry. The registry lock is
/// never held across an `.await`.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        invoker: Arc<dyn Invoker>,
        config: &SchedulerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                bridge: StoreBridge::new(store),
                invoker,
                tick: config.tick_interval(),
                lifecycle: Mutex::new(Lifecycle::Idle),
                shutdown,
            }),
        }
    }

    // --- scheduling API ----------------------------------------------------

    /// Run `function` once at `at`.
    pub fn run_at(&self, at: DateTime<Utc>, function: &str, params: &[&str]) -> Result<TaskId> {
        self.resolve(function)?;
        self.register(Task::once(function, to_owned(params), at))
    }

    /// Run `function` once after `delay` has elapsed.
    pub fn run_after(&self, delay: Duration, function: &str, params: &[&str]) -> Result<TaskId> {
        self.run_at(add_interval(Utc::now(), delay), function, params)
    }

    /// Run `function` every `interval`, first one `interval` from now.
    pub fn run_every(&self, interval: Duration, function: &str, params: &[&str]) -> Result<TaskId> {
        self.resolve(function)?;
        if interval.is_zero() || TimeDelta::from_std(interval).is_err() {
            return Err(SchedulerError::InvalidInterval);
        }
        self.register(Task::every(function, to_owned(params), interval, Utc::now()))
    }

    /// Remove a task from the registry and the store.
    pub fn cancel(&self, id: &TaskId) -> Result<()> {
        let mut guard = self.registry();
        let registry = &mut *guard;
        let task = registry
            .tasks
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })?;
        registry.unsynced.remove(id);
        self.forget(registry, id.clone(), task);
        info!(task_id = %id, "task canceled");
        Ok(())
    }

    /// Cancel every registered task. Store failures do not stop the sweep.
    /// Returns the number of tasks removed from the registry.
    pub fn clear(&self) -> usize {
        let mut guard = self.registry();
        let registry = &mut *guard;
        let drained: Vec<(TaskId, Task)> = registry.tasks.drain().collect();
        registry.unsynced.clear();
        let count = drained.len();
        for (id, task) in drained {
            self.forget(registry, id, task);
        }
        info!(count, "all tasks cleared");
        count
    }

    /// Registered tasks, earliest `next_run` first.
    pub fn tasks(&self) -> Vec<(TaskId, Task)> {
        let registry = self.registry();
        let mut tasks: Vec<(TaskId, Task)> = registry
            .tasks
            .iter()
            .map(|(id, task)| (id.clone(), task.clone()))
            .collect();
        tasks.sort_by(|a, b| {
            a.1.schedule
                .next_run
                .cmp(&b.1.schedule.next_run)
                .then_with(|| a.0.cmp(&b.0))
        });
        tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.registry().tasks.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- lifecycle ---------------------------------------------------------

    /// Reconcile with the store, sweep once, then sweep on every tick until
    /// [`stop`](Self::stop). Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Err(SchedulerError::AlreadyStarted),
                Lifecycle::Stopped => return Err(SchedulerError::AlreadyStopped),
            }
        }

        if let Err(e) = self.reconcile() {
            warn!(error = %e, "initial reconciliation failed, retrying on next tick");
        }
        self.run_pending();

        let scheduler = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let tick = self.inner.tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; that sweep already ran.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Store I/O runs under the registry lock; keep it off the async workers.
                        let sweeper = scheduler.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || {
                            sweeper.run_pending();
                        })
                        .await
                        {
                            warn!(error = %e, "sweep task failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("scheduler loop shutting down");
                            break;
                        }
                    }
                }
            }
        });

        info!(tick_ms = tick.as_millis() as u64, tasks = self.len(), "scheduler started");
        Ok(())
    }

    /// Halt the sweep loop and close the store. In-flight executions finish on
    /// their own. A second call returns [`SchedulerError::AlreadyStopped`].
    pub fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle == Lifecycle::Stopped {
                return Err(SchedulerError::AlreadyStopped);
            }
            *lifecycle = Lifecycle::Stopped;
        }
        self.inner.shutdown.send_replace(true);
        if let Err(e) = self.inner.bridge.close() {
            warn!(error = %e, "closing task store failed");
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Resolve once [`stop`](Self::stop) has been called.
    pub async fn wait(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    }

    // --- reconciliation and sweep -----------------------------------------

    /// Merge persisted records into the registry and persist registry entries
    /// the store does not know yet. Returns the number of records written.
    ///
    /// Never removes a registry entry. Running it twice with nothing changed
    /// in between writes nothing the second time.
    ///
    /// The registry lock is held from the fetch through the merge, so a task
    /// canceled or fired meanwhile is never adopted back from a stale read.
    pub fn reconcile(&self) -> Result<usize> {
        let mut guard = self.registry();
        self.reconcile_locked(&mut guard)
    }

    fn reconcile_locked(&self, registry: &mut Registry) -> Result<usize> {
        let snapshot = match self.inner.bridge.fetch() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                registry.reconcile_pending = true;
                return Err(e);
            }
        };
        registry.reconcile_pending = false;
        let mut persisted = snapshot.hashes;

        for stored in snapshot.tasks {
            let id = stored.task.id();
            if stored.hash != id {
                // Row edited outside the scheduler: re-key it under its content hash.
                warn!(stored = %stored.hash, computed = %id, "task record hash does not match its content");
                match self.inner.bridge.remove_stale(&stored.hash, &stored.task) {
                    Ok(()) => {
                        persisted.remove(&stored.hash);
                    }
                    Err(e) => warn!(hash = %stored.hash, error = %e, "removing stale task record failed"),
                }
            }
            if registry.tombstones.contains_key(&id) {
                continue;
            }

            match registry.tasks.get_mut(&id) {
                None => {
                    info!(task_id = %id, function = %stored.task.function, "adopted persisted task");
                    registry.tasks.insert(id, stored.task);
                }
                Some(registered) => {
                    let persisted_schedule = &stored.task.schedule;
                    if persisted_schedule.is_recurring
                        && registered.schedule.interval != persisted_schedule.interval
                    {
                        if let Some(last_run) = persisted_schedule.last_run {
                            registered.schedule.next_run =
                                add_interval(last_run, registered.schedule.interval);
                            warn!(task_id = %id, "recurring interval differs from store, next run re-derived");
                        }
                    }
                }
            }
        }

        let mut written = 0;
        for (id, task) in &registry.tasks {
            if persisted.contains(id) {
                continue;
            }
            match self.inner.bridge.add(task) {
                Ok(()) => {
                    registry.unsynced.remove(id);
                    written += 1;
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "persisting task failed, will retry");
                    registry.unsynced.insert(id.clone());
                }
            }
        }

        debug!(tasks = registry.tasks.len(), written, "reconciliation complete");
        Ok(written)
    }

    /// One sweep at the current wall-clock time.
    pub fn run_pending(&self) -> Vec<JoinHandle<()>> {
        self.run_pending_at(Utc::now())
    }

    /// One sweep as of `now`: every due task is advanced, then dispatched on
    /// its own Tokio task. The sweep does not wait for executions; the
    /// returned handles may be awaited by callers that want to.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run_pending_at(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let mut guard = self.registry();
        let registry = &mut *guard;
        if registry.reconcile_pending {
            if let Err(e) = self.reconcile_locked(registry) {
                warn!(error = %e, "reconciliation retry failed");
            }
        }
        self.retry_store_writes(registry);

        let due: Vec<TaskId> = registry
            .tasks
            .iter()
            .filter(|(_, task)| task.is_due(now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut handles = Vec::with_capacity(due.len());
        for id in due {
            let Some(task) = registry.tasks.get_mut(&id) else {
                continue;
            };
            // Advanced before dispatch: a slow run is never picked up twice.
            task.schedule_next_run();
            let task = task.clone();

            debug!(task_id = %id, function = %task.function, "dispatching task");
            handles.push(self.dispatch(task.clone()));

            if task.is_recurring() {
                if let Err(e) = self.inner.bridge.update(&task) {
                    warn!(task_id = %id, error = %e, "persisting next run failed, will retry");
                    registry.unsynced.insert(id);
                }
            } else {
                registry.tasks.remove(&id);
                registry.unsynced.remove(&id);
                self.forget(registry, id, task);
            }
        }
        handles
    }

    // --- private helpers ---------------------------------------------------

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().expect("task registry poisoned")
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner.lifecycle.lock().expect("scheduler lifecycle poisoned")
    }

    fn resolve(&self, function: &str) -> Result<()> {
        if function.trim().is_empty() || !self.inner.invoker.resolves(function) {
            return Err(SchedulerError::FunctionResolution {
                function: function.to_string(),
            });
        }
        Ok(())
    }

    fn register(&self, task: Task) -> Result<TaskId> {
        let id = task.id();
        {
            let mut guard = self.registry();
            let registry = &mut *guard;
            let replaced = registry.tasks.insert(id.clone(), task).is_some();
            let revived = registry.tombstones.remove(&id).is_some();
            // The store may hold this identity with older timestamps.
            if replaced || revived {
                registry.unsynced.insert(id.clone());
            }
        }
        info!(task_id = %id, "task scheduled");

        if let Err(e) = self.reconcile() {
            warn!(task_id = %id, error = %e, "reconciliation failed, retrying on next tick");
        }
        Ok(id)
    }

    /// Delete a task's record, or keep a tombstone if the store refuses.
    fn forget(&self, registry: &mut Registry, id: TaskId, task: Task) {
        if let Err(e) = self.inner.bridge.remove(&task) {
            warn!(task_id = %id, error = %e, "removing task record failed, will retry");
            registry.tombstones.insert(id, task);
        }
    }

    fn retry_store_writes(&self, registry: &mut Registry) {
        if !registry.unsynced.is_empty() {
            let pending: Vec<TaskId> = registry.unsynced.iter().cloned().collect();
            for id in pending {
                let Some(task) = registry.tasks.get(&id) else {
                    registry.unsynced.remove(&id);
                    continue;
                };
                let bridge = &self.inner.bridge;
                match bridge.add(task).and_then(|()| bridge.update(task)) {
                    Ok(()) => {
                        registry.unsynced.remove(&id);
                        debug!(task_id = %id, "task record re-synced");
                    }
                    Err(e) => warn!(task_id = %id, error = %e, "task record still out of sync"),
                }
            }
        }

        let bridge = &self.inner.bridge;
        registry
            .tombstones
            .retain(|id, task| match bridge.remove(task) {
                Ok(()) => {
                    debug!(task_id = %id, "stale task record removed");
                    false
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "task record still awaiting removal");
                    true
                }
            });
    }

    fn dispatch(&self, task: Task) -> JoinHandle<()> {
        let invoker = Arc::clone(&self.inner.invoker);
        tokio::spawn(async move { task.execute(invoker.as_ref()).await })
    }
}

fn to_owned(params: &[&str]) -> Vec<String> {
    params.iter().map(|p| p.to_string()).collect()
}
