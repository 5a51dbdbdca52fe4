//! TaskRunner - checkout と実行
//!
//! A runner subscribes to run-task triggers of its domain, races other runners
//! for the checkout in the Store, runs what it wins and reports the finished
//! state. A heartbeat keeps its lease (and the lease time of every task it
//! owns) fresh; losing the lease stops the runner.
//!
//! Ownership is re-checked at every step that writes: the final
//! `set_task_state` carries the runner id, and a runner that no longer owns a
//! task neither persists nor publishes its result.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::merge::{ConcurrencyCounter, StageStatus, drain, merge_lossy};
use crate::app::task::{CancelReason, TaskInstance, TaskStatusView};
use crate::config::RunnerConfig;
use crate::domain::{
    LoomError, RunTaskEvent, RunnerId, RunnerLease, StoreError, TaskFinishedEvent, TaskId,
};
use crate::ports::{Messenger, TaskGraphStore};

const RUN_STAGE: &str = "run_task";

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub runner_id: RunnerId,
    pub domain: String,
    pub running: bool,
    pub run_stage: StageStatus,
    pub active_tasks: Vec<TaskStatusView>,
}

pub struct TaskRunner {
    inner: Arc<RunnerInner>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct RunnerInner {
    runner_id: RunnerId,
    domain: String,
    config: RunnerConfig,
    store: Arc<dyn TaskGraphStore>,
    messenger: Arc<dyn Messenger>,
    active: Mutex<HashMap<TaskId, Arc<TaskInstance>>>,
    counter: Arc<ConcurrencyCounter>,
    running: AtomicBool,
}

/// Removes a task from the active map when its run ends, however it ends.
struct ActiveEntry<'a> {
    active: &'a Mutex<HashMap<TaskId, Arc<TaskInstance>>>,
    task_id: TaskId,
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

impl TaskRunner {
    pub fn new(
        runner_id: RunnerId,
        domain: impl Into<String>,
        config: RunnerConfig,
        store: Arc<dyn TaskGraphStore>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let counter = ConcurrencyCounter::new(RUN_STAGE, config.max_concurrent_tasks);
        Self {
            inner: Arc::new(RunnerInner {
                runner_id,
                domain: domain.into(),
                config,
                store,
                messenger,
                active: Mutex::new(HashMap::new()),
                counter,
                running: AtomicBool::new(false),
            }),
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn runner_id(&self) -> RunnerId {
        self.inner.runner_id
    }

    /// Register the lease and start the run, cancel and heartbeat loops.
    pub async fn start(&mut self) -> Result<(), LoomError> {
        if self.is_running() {
            return Ok(());
        }
        let inner = &self.inner;
        inner
            .store
            .register_task_runner(RunnerLease::new(
                inner.runner_id,
                inner.domain.clone(),
                inner.config.heartbeat_interval(),
                Utc::now(),
            ))
            .await?;

        let run_events = inner
            .messenger
            .subscribe_run_task(&inner.domain)
            .await?
            .into_receiver();
        let cancels = inner.messenger.subscribe_cancel(&inner.domain).await?;

        self.shutdown = CancellationToken::new();
        inner.running.store(true, Ordering::SeqCst);

        let run_inner = Arc::clone(inner);
        let results = merge_lossy(
            run_events,
            Arc::clone(&inner.counter),
            self.shutdown.clone(),
            move |event: RunTaskEvent| {
                let inner = Arc::clone(&run_inner);
                async move {
                    if let Err(err) = inner.run_task(event).await {
                        warn!(
                            task_runner_id = %inner.runner_id,
                            task_id = %event.task_id,
                            graph_id = %event.graph_id,
                            error = %err,
                            "failed to run task"
                        );
                    }
                    Ok::<Vec<()>, LoomError>(Vec::new())
                }
            },
        );
        self.handles.push(drain(results, RUN_STAGE));

        let cancel_inner = Arc::clone(inner);
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            let mut cancels = cancels;
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = cancels.recv() => event,
                };
                let Some(event) = event else { break };
                if cancel_inner.cancel_task(event.task_id, CancelReason::Requested) {
                    info!(
                        task_runner_id = %cancel_inner.runner_id,
                        task_id = %event.task_id,
                        graph_id = %event.graph_id,
                        "cancelling task"
                    );
                }
            }
        }));

        let heartbeat_inner = Arc::clone(inner);
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            heartbeat_inner.heartbeat(shutdown).await;
        }));

        info!(
            task_runner_id = %inner.runner_id,
            domain = %inner.domain,
            "task runner started"
        );
        Ok(())
    }

    /// Stop taking new work. Tasks already running finish and report; a
    /// checkout still in flight is left to lease expiry.
    pub fn stop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.handles.clear();
        info!(task_runner_id = %self.inner.runner_id, "task runner stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    pub fn status(&self) -> RunnerStatus {
        let mut active_tasks: Vec<TaskStatusView> = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|task| task.to_status())
            .collect();
        active_tasks.sort_by_key(|t| t.task_id);
        RunnerStatus {
            runner_id: self.inner.runner_id,
            domain: self.inner.domain.clone(),
            running: self.is_running(),
            run_stage: self.inner.counter.status(),
            active_tasks,
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RunnerInner {
    async fn run_task(&self, event: RunTaskEvent) -> Result<(), LoomError> {
        let checked_out = self
            .store
            .checkout_task(self.runner_id, event.task_id)
            .await?;
        if checked_out.is_none() {
            debug!(
                task_runner_id = %self.runner_id,
                task_id = %event.task_id,
                "checked nothing out"
            );
            return Ok(());
        }
        if !self.is_running() {
            self.abandon(event.task_id);
            return Ok(());
        }

        let record = self.store.get_task_by_id(event.task_id).await?;
        let task = Arc::new(TaskInstance::create(&record));
        let entry = self.track(Arc::clone(&task));
        // a heartbeat failure flips `running` before it cancels tracked tasks
        if !self.is_running() {
            drop(entry);
            self.abandon(record.task_id);
            return Ok(());
        }

        debug!(
            task_runner_id = %self.runner_id,
            task_id = %record.task_id,
            label = %record.label,
            kind = record.kind.name(),
            "running task"
        );
        let state = task.run().await;
        drop(entry);

        if task.cancel_reason() == Some(CancelReason::OwnershipLost) {
            info!(
                task_runner_id = %self.runner_id,
                task_id = %record.task_id,
                "task ownership lost, dropping result"
            );
            return Ok(());
        }

        match self
            .store
            .set_task_state(record.task_id, record.graph_id, state, Some(self.runner_id))
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                warn!(
                    task_runner_id = %self.runner_id,
                    task_id = %record.task_id,
                    reason = %reason,
                    "task reassigned before completion, dropping result"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        self.messenger
            .publish_task_finished(
                &self.domain,
                TaskFinishedEvent {
                    task_id: record.task_id,
                    graph_id: record.graph_id,
                    state,
                    terminal: task.is_terminal(state),
                },
            )
            .await?;
        info!(
            task_runner_id = %self.runner_id,
            task_id = %record.task_id,
            graph_id = %record.graph_id,
            state = %state,
            "task finished"
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The checkout stays in the Store; lease expiry hands the task back.
    fn abandon(&self, task_id: TaskId) {
        info!(
            task_runner_id = %self.runner_id,
            task_id = %task_id,
            "runner stopped, leaving checked-out task to lease expiry"
        );
    }

    fn track(&self, task: Arc<TaskInstance>) -> ActiveEntry<'_> {
        let task_id = task.task_id();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, task);
        ActiveEntry {
            active: &self.active,
            task_id,
        }
    }

    /// Returns whether the task was running here.
    fn cancel_task(&self, task_id: TaskId, reason: CancelReason) -> bool {
        let task = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
        match task {
            Some(task) => {
                task.cancel(reason);
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self, reason: CancelReason) {
        let tasks: Vec<Arc<TaskInstance>> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.cancel(reason);
        }
    }

    fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn active_ids(&self) -> Vec<TaskId> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    async fn heartbeat(&self, shutdown: CancellationToken) {
        let period = self.config.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.store.heartbeat_tasks_for_runner(self.runner_id).await {
                Ok(owned) => {
                    if owned != self.active_count()
                        && let Err(err) = self.reconcile_ownership().await
                    {
                        warn!(
                            task_runner_id = %self.runner_id,
                            error = %err,
                            "failed to reconcile task ownership"
                        );
                    }
                }
                Err(err) => {
                    // lease を失った runner は何も書かない
                    error!(
                        task_runner_id = %self.runner_id,
                        domain = %self.domain,
                        error = %err,
                        "failed to heartbeat task runner lease, stopping"
                    );
                    self.running.store(false, Ordering::SeqCst);
                    self.cancel_all(CancelReason::OwnershipLost);
                    shutdown.cancel();
                    break;
                }
            }
        }
    }

    /// Cancel local tasks the Store no longer assigns to this runner.
    async fn reconcile_ownership(&self) -> Result<(), LoomError> {
        let owned: HashSet<TaskId> = self
            .store
            .get_own_tasks(self.runner_id)
            .await?
            .into_iter()
            .map(|t| t.task_id)
            .collect();

        for task_id in self.active_ids() {
            if !owned.contains(&task_id) && self.cancel_task(task_id, CancelReason::OwnershipLost) {
                warn!(
                    task_runner_id = %self.runner_id,
                    task_id = %task_id,
                    "task no longer owned, cancelling"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CancelTaskEvent, GraphId, GraphRecord, TaskKind, TaskRecord, TaskState,
    };
    use crate::impls::{FaultPoint, InMemoryMessenger, InMemoryStore};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        messenger: Arc<InMemoryMessenger>,
        graph_id: GraphId,
    }

    async fn fixture(tasks: Vec<(TaskId, TaskKind)>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let messenger = Arc::new(InMemoryMessenger::new());
        let graph_id = GraphId::generate();
        let now = Utc::now();
        let records = tasks
            .into_iter()
            .enumerate()
            .map(|(i, (task_id, kind))| {
                TaskRecord::new(task_id, graph_id, "default", format!("t{i}"), kind, now)
            })
            .collect();
        store
            .create_graph(GraphRecord::new(graph_id, "Graph.Test", "default", now), records)
            .await
            .unwrap();
        // dependency-free tasks become ready
        store.find_ready_tasks("default", graph_id).await.unwrap();
        Fixture {
            store,
            messenger,
            graph_id,
        }
    }

    fn runner(fx: &Fixture, heartbeat_ms: u64) -> TaskRunner {
        TaskRunner::new(
            RunnerId::generate(),
            "default",
            RunnerConfig {
                heartbeat_interval_ms: heartbeat_ms,
                max_concurrent_tasks: 10,
            },
            fx.store.clone(),
            fx.messenger.clone(),
        )
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn runs_checked_out_task_and_publishes_result() {
        let task_id = TaskId::generate();
        let fx = fixture(vec![(task_id, TaskKind::Noop)]).await;
        let mut finished = fx.messenger.subscribe_task_finished("default").await.unwrap();
        let mut runner = runner(&fx, 500);
        runner.start().await.unwrap();

        fx.messenger
            .publish_run_task(
                "default",
                RunTaskEvent {
                    task_id,
                    graph_id: fx.graph_id,
                },
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), finished.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.state, TaskState::Succeeded);
        assert!(event.terminal);

        let record = fx.store.get_task_by_id(task_id).await.unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.task_runner_id, None);
        runner.stop();
    }

    #[tokio::test]
    async fn duplicate_trigger_runs_task_once() {
        let task_id = TaskId::generate();
        let fx = fixture(vec![(task_id, TaskKind::Sleep { millis: 50 })]).await;
        let mut finished = fx.messenger.subscribe_task_finished("default").await.unwrap();
        let mut first = runner(&fx, 500);
        let mut second = runner(&fx, 500);
        first.start().await.unwrap();
        second.start().await.unwrap();

        let event = RunTaskEvent {
            task_id,
            graph_id: fx.graph_id,
        };
        fx.messenger.publish_run_task("default", event).await.unwrap();
        fx.messenger.publish_run_task("default", event).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), finished.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(finished.try_recv().is_none());
        first.stop();
        second.stop();
    }

    #[tokio::test]
    async fn cancel_event_persists_cancelled() {
        let task_id = TaskId::generate();
        let fx = fixture(vec![(task_id, TaskKind::Sleep { millis: 60_000 })]).await;
        let mut finished = fx.messenger.subscribe_task_finished("default").await.unwrap();
        let mut runner = runner(&fx, 500);
        runner.start().await.unwrap();

        fx.messenger
            .publish_run_task(
                "default",
                RunTaskEvent {
                    task_id,
                    graph_id: fx.graph_id,
                },
            )
            .await
            .unwrap();
        wait_until(|| {
            let active = runner.active_count();
            async move { active == 1 }
        })
        .await;

        fx.messenger
            .publish_cancel_task(
                "default",
                CancelTaskEvent {
                    task_id,
                    graph_id: fx.graph_id,
                },
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), finished.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.state, TaskState::Cancelled);
        assert_eq!(
            fx.store.get_task_by_id(task_id).await.unwrap().state,
            TaskState::Cancelled
        );
        runner.stop();
    }

    #[tokio::test]
    async fn heartbeat_failure_cancels_tasks_without_publishing() {
        let task_id = TaskId::generate();
        let fx = fixture(vec![(task_id, TaskKind::Sleep { millis: 60_000 })]).await;
        let mut finished = fx.messenger.subscribe_task_finished("default").await.unwrap();
        let mut runner = runner(&fx, 20);
        runner.start().await.unwrap();

        fx.messenger
            .publish_run_task(
                "default",
                RunTaskEvent {
                    task_id,
                    graph_id: fx.graph_id,
                },
            )
            .await
            .unwrap();
        wait_until(|| {
            let active = runner.active_count();
            async move { active == 1 }
        })
        .await;

        fx.store.fail_on(FaultPoint::HeartbeatRunner);
        wait_until(|| {
            let running = runner.is_running();
            async move { !running }
        })
        .await;

        assert_eq!(runner.active_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(finished.try_recv().is_none());
        assert_eq!(
            fx.store.get_task_by_id(task_id).await.unwrap().state,
            TaskState::Running
        );
    }

    #[tokio::test]
    async fn checkout_in_flight_at_heartbeat_failure_does_not_run() {
        let task_id = TaskId::generate();
        let fx = fixture(vec![(task_id, TaskKind::Noop)]).await;
        let mut finished = fx.messenger.subscribe_task_finished("default").await.unwrap();
        // first heartbeat lands after the setup below, so it never waits on the lock
        let mut runner = runner(&fx, 200);
        runner.start().await.unwrap();

        // the checkout blocks on the store lock
        let paused = fx.store.pause().await;
        fx.messenger
            .publish_run_task(
                "default",
                RunTaskEvent {
                    task_id,
                    graph_id: fx.graph_id,
                },
            )
            .await
            .unwrap();
        wait_until(|| {
            let in_flight = runner.status().run_stage.in_flight;
            async move { in_flight == 1 }
        })
        .await;

        fx.store.fail_on(FaultPoint::HeartbeatRunner);
        wait_until(|| {
            let running = runner.is_running();
            async move { !running }
        })
        .await;
        drop(paused);

        wait_until(|| {
            let in_flight = runner.status().run_stage.in_flight;
            async move { in_flight == 0 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(finished.try_recv().is_none());
        assert_eq!(runner.active_count(), 0);

        // checked out but never run; lease expiry hands it back
        let record = fx.store.get_task_by_id(task_id).await.unwrap();
        assert_eq!(record.state, TaskState::Running);
        assert_eq!(record.task_runner_id, Some(runner.runner_id()));
    }

    #[tokio::test]
    async fn reassigned_task_is_cancelled_by_reconciliation() {
        let task_id = TaskId::generate();
        let fx = fixture(vec![(task_id, TaskKind::Sleep { millis: 60_000 })]).await;
        let mut finished = fx.messenger.subscribe_task_finished("default").await.unwrap();
        let mut runner = runner(&fx, 20);
        runner.start().await.unwrap();

        fx.messenger
            .publish_run_task(
                "default",
                RunTaskEvent {
                    task_id,
                    graph_id: fx.graph_id,
                },
            )
            .await
            .unwrap();
        wait_until(|| {
            let active = runner.active_count();
            async move { active == 1 }
        })
        .await;

        // lease poller on another node expired this runner
        fx.store
            .expire_task_runner_lease(runner.runner_id())
            .await
            .unwrap();

        wait_until(|| {
            let active = runner.active_count();
            async move { active == 0 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(finished.try_recv().is_none());
        assert_eq!(
            fx.store.get_task_by_id(task_id).await.unwrap().state,
            TaskState::Ready
        );
        runner.stop();
    }
}
