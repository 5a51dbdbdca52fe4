//! TaskScheduler - ready task の評価と配布
//!
//! The scheduler is a set of independent pipeline stages joined by unbounded
//! channels, each gated by its own `merge_lossy` counter:
//!
//! ```text
//! RunGraphEvent ─┐
//! re-evaluate ───┼─> find_ready_tasks ─> schedule_tasks ─> publish RunTaskEvent
//! sweep ─────────┘
//!
//! TaskFinishedEvent ─┐
//! unreachable ───────┼─> update_task_dependencies ─┬─> check_graph_finished
//! sweep ─────────────┘                             └─> re-evaluate
//! ```
//!
//! Every trigger is a "look at the Store again" signal. A dropped trigger is
//! recovered by a later event or by the periodic sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app::completion::{Completion, handle_potential_finished_graph};
use crate::app::lease_poller::LeaseExpirationPoller;
use crate::app::merge::{ConcurrencyCounter, StageStatus, drain, merge_lossy, ok_values};
use crate::config::{LeasePollerConfig, SchedulerConfig};
use crate::domain::{
    GraphId, LoomError, RunTaskEvent, SchedulerId, SchedulerLease, TaskFinishedEvent, TaskRecord,
    TaskState,
};
use crate::ports::{Messenger, TaskGraphStore};

const FIND_READY_TASKS: &str = "find_ready_tasks";
const SCHEDULE_TASKS: &str = "schedule_tasks";
const UPDATE_TASK_DEPENDENCIES: &str = "update_task_dependencies";
const CHECK_GRAPH_FINISHED: &str = "check_graph_finished";
const SWEEP: &str = "sweep";

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub scheduler_id: SchedulerId,
    pub domain: String,
    pub running: bool,
    pub stages: Vec<StageStatus>,
}

/// Work produced by a dependency update.
#[derive(Debug, Clone, Copy)]
enum FollowUp {
    CheckFinished(TaskFinishedEvent),
    Evaluate(GraphId),
}

struct Counters {
    find_ready_tasks: Arc<ConcurrencyCounter>,
    schedule_tasks: Arc<ConcurrencyCounter>,
    update_task_dependencies: Arc<ConcurrencyCounter>,
    check_graph_finished: Arc<ConcurrencyCounter>,
    sweep: Arc<ConcurrencyCounter>,
}

impl Counters {
    fn new(config: &SchedulerConfig) -> Self {
        let limits = &config.concurrency;
        Self {
            find_ready_tasks: ConcurrencyCounter::new(FIND_READY_TASKS, limits.find_ready_tasks),
            schedule_tasks: ConcurrencyCounter::new(SCHEDULE_TASKS, limits.schedule_tasks),
            update_task_dependencies: ConcurrencyCounter::new(
                UPDATE_TASK_DEPENDENCIES,
                limits.update_task_dependencies,
            ),
            check_graph_finished: ConcurrencyCounter::new(
                CHECK_GRAPH_FINISHED,
                limits.check_graph_finished,
            ),
            sweep: ConcurrencyCounter::new(SWEEP, limits.sweep),
        }
    }

    fn status(&self) -> Vec<StageStatus> {
        [
            &self.find_ready_tasks,
            &self.schedule_tasks,
            &self.update_task_dependencies,
            &self.check_graph_finished,
            &self.sweep,
        ]
        .into_iter()
        .map(|c| c.status())
        .collect()
    }
}

/// Entry points of the internal pipelines. Present only while started.
struct Inlets {
    evaluate: mpsc::UnboundedSender<GraphId>,
    finished: mpsc::UnboundedSender<TaskFinishedEvent>,
}

pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    lease_poller: LeaseExpirationPoller,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct SchedulerInner {
    scheduler_id: SchedulerId,
    domain: String,
    config: SchedulerConfig,
    store: Arc<dyn TaskGraphStore>,
    messenger: Arc<dyn Messenger>,
    counters: Counters,
    inlets: Mutex<Option<Inlets>>,
    /// Last time this scheduler saw something happen to a graph.
    activity: Mutex<HashMap<GraphId, Instant>>,
    running: AtomicBool,
}

impl TaskScheduler {
    pub fn new(
        scheduler_id: SchedulerId,
        domain: impl Into<String>,
        config: SchedulerConfig,
        lease_poller_config: &LeasePollerConfig,
        store: Arc<dyn TaskGraphStore>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let domain = domain.into();
        let lease_poller = LeaseExpirationPoller::new(
            scheduler_id,
            domain.clone(),
            Arc::clone(&store),
            lease_poller_config.poll_interval(),
            config.poll_interval(),
        );
        Self {
            inner: Arc::new(SchedulerInner {
                scheduler_id,
                domain,
                counters: Counters::new(&config),
                config,
                store,
                messenger,
                inlets: Mutex::new(None),
                activity: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            lease_poller,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn scheduler_id(&self) -> SchedulerId {
        self.inner.scheduler_id
    }

    pub async fn start(&mut self) -> Result<(), LoomError> {
        if self.is_running() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        inner.heartbeat_once().await?;

        let run_graphs = inner
            .messenger
            .subscribe_run_task_graph(&inner.domain)
            .await?;
        let finished_events = inner
            .messenger
            .subscribe_task_finished(&inner.domain)
            .await?;

        self.shutdown = CancellationToken::new();
        inner.running.store(true, Ordering::SeqCst);
        self.lease_poller.start(&self.shutdown);

        let (evaluate_tx, evaluate_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (check_tx, check_rx) = mpsc::unbounded_channel();
        let (sweep_tx, sweep_rx) = mpsc::unbounded_channel();
        *inner.inlets.lock().unwrap_or_else(|e| e.into_inner()) = Some(Inlets {
            evaluate: evaluate_tx.clone(),
            finished: finished_tx.clone(),
        });

        // ready-task evaluation -> schedule
        let stage = Arc::clone(&inner);
        let ready = merge_lossy(
            evaluate_rx,
            Arc::clone(&inner.counters.find_ready_tasks),
            self.shutdown.clone(),
            move |graph_id: GraphId| {
                let inner = Arc::clone(&stage);
                async move {
                    inner
                        .isolate(FIND_READY_TASKS, graph_id, inner.find_ready_tasks(graph_id))
                        .await
                }
            },
        );
        let stage = Arc::clone(&inner);
        let scheduled = merge_lossy(
            ok_values(ready, FIND_READY_TASKS),
            Arc::clone(&inner.counters.schedule_tasks),
            self.shutdown.clone(),
            move |task: TaskRecord| {
                let inner = Arc::clone(&stage);
                async move {
                    let task_id = task.task_id;
                    inner
                        .isolate(SCHEDULE_TASKS, task_id, inner.schedule_task(task))
                        .await
                }
            },
        );
        self.handles.push(drain(scheduled, SCHEDULE_TASKS));

        // dependency update -> finished check / re-evaluate
        let stage = Arc::clone(&inner);
        let follow_ups = merge_lossy(
            finished_rx,
            Arc::clone(&inner.counters.update_task_dependencies),
            self.shutdown.clone(),
            move |event: TaskFinishedEvent| {
                let inner = Arc::clone(&stage);
                async move {
                    inner
                        .isolate(
                            UPDATE_TASK_DEPENDENCIES,
                            event.task_id,
                            inner.update_task_dependencies(event),
                        )
                        .await
                }
            },
        );
        let mut follow_ups = ok_values(follow_ups, UPDATE_TASK_DEPENDENCIES);
        let router_evaluate = evaluate_tx.clone();
        self.handles.push(tokio::spawn(async move {
            while let Some(follow_up) = follow_ups.recv().await {
                let sent = match follow_up {
                    FollowUp::CheckFinished(event) => check_tx.send(event).is_ok(),
                    FollowUp::Evaluate(graph_id) => router_evaluate.send(graph_id).is_ok(),
                };
                if !sent {
                    break;
                }
            }
        }));

        let stage = Arc::clone(&inner);
        let still_running = merge_lossy(
            check_rx,
            Arc::clone(&inner.counters.check_graph_finished),
            self.shutdown.clone(),
            move |event: TaskFinishedEvent| {
                let inner = Arc::clone(&stage);
                async move {
                    inner
                        .isolate(
                            CHECK_GRAPH_FINISHED,
                            event.graph_id,
                            inner.check_graph_finished(event),
                        )
                        .await
                }
            },
        );
        let mut still_running = ok_values(still_running, CHECK_GRAPH_FINISHED);
        let recheck_evaluate = evaluate_tx.clone();
        self.handles.push(tokio::spawn(async move {
            while let Some(graph_id) = still_running.recv().await {
                if recheck_evaluate.send(graph_id).is_err() {
                    break;
                }
            }
        }));

        // sweep
        let stage = Arc::clone(&inner);
        let swept = merge_lossy(
            sweep_rx,
            Arc::clone(&inner.counters.sweep),
            self.shutdown.clone(),
            move |()| {
                let inner = Arc::clone(&stage);
                async move { inner.isolate(SWEEP, "tick", inner.sweep()).await }
            },
        );
        self.handles.push(drain(swept, SWEEP));
        self.handles.push(spawn_ticker(
            self.inner.config.sweep_interval(),
            sweep_tx,
            self.shutdown.clone(),
        ));

        // messenger subscriptions feed the inlets
        let feed = Arc::clone(&inner);
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            let mut run_graphs = run_graphs;
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = run_graphs.recv() => event,
                };
                let Some(event) = event else { break };
                feed.touch(event.graph_id);
                if evaluate_tx.send(event.graph_id).is_err() {
                    break;
                }
            }
        }));
        let feed = Arc::clone(&inner);
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            let mut finished_events = finished_events;
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = finished_events.recv() => event,
                };
                let Some(event) = event else { break };
                feed.touch(event.graph_id);
                if finished_tx.send(event).is_err() {
                    break;
                }
            }
        }));

        // lease heartbeat
        let heartbeat = Arc::clone(&inner);
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            heartbeat.heartbeat(shutdown).await;
        }));

        info!(
            scheduler_id = %inner.scheduler_id,
            domain = %inner.domain,
            "task scheduler started"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.lease_poller.stop();
        self.inner
            .inlets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.handles.clear();
        info!(scheduler_id = %self.inner.scheduler_id, "task scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Ask the ready-task stage to look at a graph.
    pub fn evaluate_graph(&self, graph_id: GraphId) -> bool {
        self.inner.evaluate(graph_id)
    }

    /// Re-evaluate every running graph bound to `target`. Returns how many
    /// graphs were signalled.
    pub async fn handle_external_context(&self, target: &str) -> Result<usize, LoomError> {
        let graphs = self.inner.store.find_active_graphs(&self.inner.domain).await?;
        let mut signalled = 0;
        for graph in graphs
            .iter()
            .filter(|g| g.target.as_deref() == Some(target))
        {
            if self.inner.evaluate(graph.graph_id) {
                signalled += 1;
            }
        }
        debug!(
            scheduler_id = %self.inner.scheduler_id,
            target,
            signalled,
            "external context changed"
        );
        Ok(signalled)
    }

    /// Run one sweep now, outside the periodic tick.
    pub async fn sweep(&self) -> Result<(), LoomError> {
        self.inner.sweep().await.map(|_| ())
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            scheduler_id: self.inner.scheduler_id,
            domain: self.inner.domain.clone(),
            running: self.is_running(),
            stages: self.inner.counters.status(),
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_ticker(
    period: std::time::Duration,
    ticks: mpsc::UnboundedSender<()>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if ticks.send(()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

impl SchedulerInner {
    /// Per-item error isolation: a failed item is logged and yields nothing.
    async fn isolate<O, P, F>(
        &self,
        stage: &'static str,
        payload: P,
        work: F,
    ) -> Result<Vec<O>, LoomError>
    where
        P: std::fmt::Display,
        F: std::future::Future<Output = Result<Vec<O>, LoomError>>,
    {
        match work.await {
            Ok(outputs) => Ok(outputs),
            Err(err) => {
                error!(
                    scheduler_id = %self.scheduler_id,
                    domain = %self.domain,
                    stage,
                    payload = %payload,
                    error = %err,
                    "pipeline stage failed"
                );
                Ok(Vec::new())
            }
        }
    }

    fn inlet<T>(&self, send: impl FnOnce(&Inlets) -> Result<(), mpsc::error::SendError<T>>) -> bool {
        match &*self.inlets.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(inlets) => send(inlets).is_ok(),
            None => false,
        }
    }

    fn evaluate(&self, graph_id: GraphId) -> bool {
        self.inlet(|inlets| inlets.evaluate.send(graph_id))
    }

    fn reinject(&self, event: TaskFinishedEvent) -> bool {
        self.inlet(|inlets| inlets.finished.send(event))
    }

    fn touch(&self, graph_id: GraphId) {
        self.activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(graph_id, Instant::now());
    }

    async fn find_ready_tasks(&self, graph_id: GraphId) -> Result<Vec<TaskRecord>, LoomError> {
        let ready = self.store.find_ready_tasks(&self.domain, graph_id).await?;
        if !ready.is_empty() {
            debug!(
                scheduler_id = %self.scheduler_id,
                graph_id = %graph_id,
                ready = ready.len(),
                "found ready tasks"
            );
        }
        Ok(ready)
    }

    async fn schedule_task(&self, task: TaskRecord) -> Result<Vec<()>, LoomError> {
        self.messenger
            .publish_run_task(
                &self.domain,
                RunTaskEvent {
                    task_id: task.task_id,
                    graph_id: task.graph_id,
                },
            )
            .await?;
        debug!(
            scheduler_id = %self.scheduler_id,
            task_id = %task.task_id,
            label = %task.label,
            "scheduled task"
        );
        Ok(Vec::new())
    }

    async fn update_task_dependencies(
        &self,
        event: TaskFinishedEvent,
    ) -> Result<Vec<FollowUp>, LoomError> {
        self.store.set_task_state_in_graph(&event).await?;
        let newly_ready = self.store.update_dependent_tasks(&event).await?;
        let unreachable = self.store.update_unreachable_tasks(&event).await?;
        self.store.mark_task_evaluated(event.task_id).await?;

        for task in &unreachable {
            debug!(
                scheduler_id = %self.scheduler_id,
                task_id = %task.task_id,
                upstream_task_id = %event.task_id,
                "task unreachable"
            );
            self.reinject(TaskFinishedEvent {
                task_id: task.task_id,
                graph_id: task.graph_id,
                state: TaskState::Unreachable,
                terminal: true,
            });
        }
        debug!(
            scheduler_id = %self.scheduler_id,
            task_id = %event.task_id,
            state = %event.state,
            newly_ready = newly_ready.len(),
            unreachable = unreachable.len(),
            "updated task dependencies"
        );

        let follow_up = if event.terminal {
            FollowUp::CheckFinished(event)
        } else {
            FollowUp::Evaluate(event.graph_id)
        };
        Ok(vec![follow_up])
    }

    /// Yields the graph id back when the graph is still running.
    async fn check_graph_finished(
        &self,
        event: TaskFinishedEvent,
    ) -> Result<Vec<GraphId>, LoomError> {
        let completion = handle_potential_finished_graph(
            self.store.as_ref(),
            self.messenger.as_ref(),
            &self.domain,
            &event,
        )
        .await?;
        match completion {
            Completion::Running => Ok(vec![event.graph_id]),
            Completion::Finished(_) | Completion::AlreadyFinished => {
                self.activity
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&event.graph_id);
                Ok(Vec::new())
            }
        }
    }

    async fn sweep(&self) -> Result<Vec<()>, LoomError> {
        let unevaluated = self
            .store
            .find_unevaluated_tasks(&self.domain, self.config.sweep_limit)
            .await?;
        for task in &unevaluated {
            self.reinject(TaskFinishedEvent {
                task_id: task.task_id,
                graph_id: task.graph_id,
                state: task.state,
                terminal: task.is_terminal(task.state),
            });
        }

        let claimed = self
            .store
            .claim_orphaned_graphs(&self.domain, self.scheduler_id)
            .await?;
        for graph_id in &claimed {
            info!(
                scheduler_id = %self.scheduler_id,
                graph_id = %graph_id,
                "claimed orphaned graph"
            );
            self.touch(*graph_id);
            self.evaluate(*graph_id);
        }

        let active = self.store.find_active_graphs(&self.domain).await?;
        let stale_after = self.config.stale_graph_after();
        let now = Instant::now();
        let stale: Vec<GraphId> = {
            let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
            activity.retain(|graph_id, _| active.iter().any(|g| g.graph_id == *graph_id));
            active
                .iter()
                .map(|g| g.graph_id)
                .filter(|graph_id| {
                    activity
                        .get(graph_id)
                        .is_none_or(|seen| now.duration_since(*seen) >= stale_after)
                })
                .collect()
        };
        for graph_id in &stale {
            self.touch(*graph_id);
            self.evaluate(*graph_id);
        }

        if !unevaluated.is_empty() || !claimed.is_empty() || !stale.is_empty() {
            debug!(
                scheduler_id = %self.scheduler_id,
                unevaluated = unevaluated.len(),
                claimed = claimed.len(),
                stale = stale.len(),
                "sweep"
            );
        }
        Ok(Vec::new())
    }

    async fn heartbeat_once(&self) -> Result<(), LoomError> {
        self.store
            .heartbeat_scheduler(SchedulerLease::new(
                self.scheduler_id,
                self.domain.clone(),
                self.config.poll_interval(),
                Utc::now(),
            ))
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, shutdown: CancellationToken) {
        let period = self.config.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.heartbeat_once().await {
                error!(
                    scheduler_id = %self.scheduler_id,
                    domain = %self.domain,
                    error = %err,
                    "failed to heartbeat scheduler lease, stopping"
                );
                self.running.store(false, Ordering::SeqCst);
                self.inlets.lock().unwrap_or_else(|e| e.into_inner()).take();
                shutdown.cancel();
                break;
            }
        }
    }
}
