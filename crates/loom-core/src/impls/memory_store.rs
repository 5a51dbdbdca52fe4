//! In-memory TaskGraphStore.
//!
//! Every operation runs under one `tokio::sync::Mutex`, which makes each call
//! an atomic check-and-set. Fault points let tests make individual operations
//! fail.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    FinishedCheck, GraphId, GraphRecord, GraphStatus, GraphSummary, RunnerId, RunnerLease,
    SchedulerId, SchedulerLease, StoreError, TaskFinishedEvent, TaskId, TaskRecord, TaskState,
};
use crate::ports::{Clock, SystemClock, TaskGraphStore};

/// Operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateGraph,
    CheckoutTask,
    FindReadyTasks,
    SetTaskState,
    UpdateDependentTasks,
    HeartbeatRunner,
    HeartbeatScheduler,
    FindExpiredLeases,
    ExpireLease,
}

#[derive(Default)]
struct StoreState {
    graphs: HashMap<GraphId, GraphRecord>,
    tasks: HashMap<TaskId, TaskRecord>,
    schedulers: HashMap<SchedulerId, SchedulerLease>,
    runners: HashMap<RunnerId, RunnerLease>,
}

pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    faults: std::sync::Mutex<HashSet<FaultPoint>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
            faults: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_on(&self, point: FaultPoint) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(point);
    }

    pub fn clear_fault(&self, point: FaultPoint) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&point);
    }

    fn check_fault(&self, point: FaultPoint) -> Result<(), StoreError> {
        let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if faults.contains(&point) {
            return Err(StoreError::Unavailable(format!("injected fault: {point:?}")));
        }
        Ok(())
    }

    /// Tasks of a graph, ordered by id (creation order).
    pub async fn tasks_of_graph(&self, graph_id: GraphId) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        let mut tasks: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.graph_id == graph_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.task_id);
        tasks
    }

    pub async fn scheduler_lease(&self, scheduler_id: SchedulerId) -> Option<SchedulerLease> {
        self.state.lock().await.schedulers.get(&scheduler_id).cloned()
    }

    pub async fn runner_lease(&self, runner_id: RunnerId) -> Option<RunnerLease> {
        self.state.lock().await.runners.get(&runner_id).cloned()
    }

    /// Hold the store lock: every operation waits until the guard drops.
    /// Fault points are checked before the lock, so they still fire.
    pub async fn pause(&self) -> PausedStore<'_> {
        PausedStore {
            _guard: self.state.lock().await,
        }
    }
}

/// Returned by [`InMemoryStore::pause`].
pub struct PausedStore<'a> {
    _guard: tokio::sync::MutexGuard<'a, StoreState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn mirror_state(graphs: &mut HashMap<GraphId, GraphRecord>, task: &TaskRecord) {
    if let Some(graph) = graphs.get_mut(&task.graph_id) {
        graph.task_states.insert(task.task_id, task.state);
        graph.updated_at = task.updated_at;
    }
}

/// A finished task can be collected once its graph is gone or terminal, or
/// when the finished check on this task would end the graph now. Tasks of
/// graphs that keep running never fill a retention batch.
fn retention_candidate(graph: Option<&GraphRecord>, task: &TaskRecord) -> bool {
    match graph {
        None => true,
        Some(graph) if graph.status.is_terminal() => true,
        Some(graph) if graph.status == GraphStatus::Running => {
            task.is_terminal(task.state) && (task.state.is_failure() || graph.all_tasks_finished())
        }
        Some(_) => false,
    }
}

#[async_trait]
impl TaskGraphStore for InMemoryStore {
    async fn create_graph(
        &self,
        mut graph: GraphRecord,
        tasks: Vec<TaskRecord>,
    ) -> Result<(), StoreError> {
        self.check_fault(FaultPoint::CreateGraph)?;
        let mut state = self.state.lock().await;

        if let Some(target) = &graph.target
            && let Some(existing) = state
                .graphs
                .values()
                .find(|g| !g.status.is_terminal() && g.target.as_ref() == Some(target))
        {
            return Err(StoreError::Conflict(format!(
                "target {target} is owned by active graph {}",
                existing.graph_id
            )));
        }
        if state.graphs.contains_key(&graph.graph_id) {
            return Err(StoreError::Conflict(format!(
                "graph {} already exists",
                graph.graph_id
            )));
        }

        graph.task_states = tasks.iter().map(|t| (t.task_id, t.state)).collect();
        for task in tasks {
            state.tasks.insert(task.task_id, task);
        }
        state.graphs.insert(graph.graph_id, graph);
        Ok(())
    }

    async fn get_graph(&self, graph_id: GraphId) -> Result<Option<GraphRecord>, StoreError> {
        Ok(self.state.lock().await.graphs.get(&graph_id).cloned())
    }

    async fn find_active_graphs(&self, domain: &str) -> Result<Vec<GraphRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut graphs: Vec<GraphRecord> = state
            .graphs
            .values()
            .filter(|g| g.domain == domain && g.status == GraphStatus::Running)
            .cloned()
            .collect();
        graphs.sort_by_key(|g| g.graph_id);
        Ok(graphs)
    }

    async fn set_graph_status(
        &self,
        graph_id: GraphId,
        from: GraphStatus,
        to: GraphStatus,
    ) -> Result<Option<GraphRecord>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let graph = state
            .graphs
            .get_mut(&graph_id)
            .ok_or_else(|| StoreError::not_found("graph", graph_id))?;
        if graph.status != from {
            return Ok(None);
        }
        graph.status = to;
        graph.updated_at = now;
        Ok(Some(graph.clone()))
    }

    async fn claim_orphaned_graphs(
        &self,
        domain: &str,
        scheduler_id: SchedulerId,
    ) -> Result<Vec<GraphId>, StoreError> {
        let mut state = self.state.lock().await;
        let mut claimed: Vec<GraphId> = state
            .graphs
            .values_mut()
            .filter(|g| g.domain == domain && !g.status.is_terminal() && g.scheduler_id.is_none())
            .map(|g| {
                g.scheduler_id = Some(scheduler_id);
                g.graph_id
            })
            .collect();
        claimed.sort();
        Ok(claimed)
    }

    async fn cancel_graph_tasks(&self, graph_id: GraphId) -> Result<Vec<TaskRecord>, StoreError> {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let StoreState { graphs, tasks, .. } = &mut *guard;

        let mut running = Vec::new();
        for task in tasks.values_mut().filter(|t| t.graph_id == graph_id) {
            match task.state {
                TaskState::Pending | TaskState::Ready => {
                    task.state = TaskState::Cancelled;
                    task.evaluated = true;
                    task.updated_at = now;
                    mirror_state(graphs, task);
                }
                TaskState::Running => running.push(task.clone()),
                _ => {}
            }
        }
        running.sort_by_key(|t| t.task_id);
        Ok(running)
    }

    async fn checkout_task(
        &self,
        runner_id: RunnerId,
        task_id: TaskId,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.check_fault(FaultPoint::CheckoutTask)?;
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let StoreState {
            graphs,
            tasks,
            runners,
            ..
        } = &mut *guard;

        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        let graph_running = graphs
            .get(&task.graph_id)
            .is_some_and(|g| g.status == GraphStatus::Running);
        if !graph_running {
            return Ok(None);
        }

        let claimable = match task.state {
            TaskState::Ready => task.task_runner_id.is_none(),
            // Owner's lease is gone but expiry has not released the task yet.
            TaskState::Running => task
                .task_runner_id
                .is_none_or(|owner| !runners.get(&owner).is_some_and(|l| l.is_live())),
            _ => false,
        };
        if !claimable {
            return Ok(None);
        }

        task.state = TaskState::Running;
        task.task_runner_id = Some(runner_id);
        task.leased_at = Some(now);
        task.updated_at = now;
        mirror_state(graphs, task);
        Ok(Some(task.clone()))
    }

    async fn get_task_by_id(&self, task_id: TaskId) -> Result<TaskRecord, StoreError> {
        self.state
            .lock()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }

    async fn find_ready_tasks(
        &self,
        domain: &str,
        graph_id: GraphId,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.check_fault(FaultPoint::FindReadyTasks)?;
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let StoreState { graphs, tasks, .. } = &mut *guard;

        let runnable = graphs
            .get(&graph_id)
            .is_some_and(|g| g.domain == domain && g.status == GraphStatus::Running);
        if !runnable {
            return Ok(Vec::new());
        }

        let mut ready = Vec::new();
        for task in tasks.values_mut().filter(|t| t.graph_id == graph_id) {
            if task.state == TaskState::Pending && task.dependencies_resolved() {
                task.state = TaskState::Ready;
                task.updated_at = now;
                mirror_state(graphs, task);
            }
            if task.state == TaskState::Ready && task.task_runner_id.is_none() {
                ready.push(task.clone());
            }
        }
        ready.sort_by_key(|t| t.task_id);
        Ok(ready)
    }

    async fn set_task_state(
        &self,
        task_id: TaskId,
        graph_id: GraphId,
        new_state: TaskState,
        owner: Option<RunnerId>,
    ) -> Result<(), StoreError> {
        self.check_fault(FaultPoint::SetTaskState)?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .filter(|t| t.graph_id == graph_id)
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        if let Some(owner) = owner
            && !task.is_owned_by(owner)
        {
            return Err(StoreError::Conflict(format!(
                "{task_id} is no longer owned by {owner}"
            )));
        }

        task.state = new_state;
        task.task_runner_id = None;
        task.leased_at = None;
        task.evaluated = false;
        task.updated_at = now;
        Ok(())
    }

    async fn set_task_state_in_graph(&self, event: &TaskFinishedEvent) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let graph = state
            .graphs
            .get_mut(&event.graph_id)
            .ok_or_else(|| StoreError::not_found("graph", event.graph_id))?;
        graph.task_states.insert(event.task_id, event.state);
        graph.updated_at = now;
        Ok(())
    }

    async fn update_dependent_tasks(
        &self,
        event: &TaskFinishedEvent,
    ) -> Result<Vec<TaskId>, StoreError> {
        self.check_fault(FaultPoint::UpdateDependentTasks)?;
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let StoreState { graphs, tasks, .. } = &mut *guard;

        let mut newly_ready = Vec::new();
        for task in tasks.values_mut().filter(|t| t.graph_id == event.graph_id) {
            let satisfied = task
                .dependencies
                .get(&event.task_id)
                .is_some_and(|accepted| accepted.contains(&event.state));
            if !satisfied {
                continue;
            }
            task.resolved.insert(event.task_id);
            if task.state == TaskState::Pending && task.dependencies_resolved() {
                task.state = TaskState::Ready;
                task.updated_at = now;
                mirror_state(graphs, task);
                newly_ready.push(task.task_id);
            }
        }
        newly_ready.sort();
        Ok(newly_ready)
    }

    async fn update_unreachable_tasks(
        &self,
        event: &TaskFinishedEvent,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        if !event.state.is_finished() {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let StoreState { graphs, tasks, .. } = &mut *guard;

        let mut unreachable = Vec::new();
        for task in tasks.values_mut().filter(|t| t.graph_id == event.graph_id) {
            let blocked = task.state == TaskState::Pending
                && task
                    .dependencies
                    .get(&event.task_id)
                    .is_some_and(|accepted| !accepted.contains(&event.state));
            if !blocked {
                continue;
            }
            task.state = TaskState::Unreachable;
            task.evaluated = false;
            task.updated_at = now;
            mirror_state(graphs, task);
            unreachable.push(task.clone());
        }
        unreachable.sort_by_key(|t| t.task_id);
        Ok(unreachable)
    }

    async fn mark_task_evaluated(&self, task_id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        task.evaluated = true;
        Ok(())
    }

    async fn find_unevaluated_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.domain == domain && t.state.is_finished() && !t.evaluated)
            .cloned()
            .collect();
        found.sort_by_key(|t| (t.updated_at, t.task_id));
        found.truncate(limit);
        Ok(found)
    }

    async fn find_completed_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.domain == domain && t.state.is_finished() && t.evaluated)
            .filter(|t| retention_candidate(state.graphs.get(&t.graph_id), t))
            .cloned()
            .collect();
        found.sort_by_key(|t| (t.updated_at, t.task_id));
        found.truncate(limit);
        Ok(found)
    }

    async fn delete_tasks(&self, task_ids: &[TaskId]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        Ok(task_ids
            .iter()
            .filter(|id| state.tasks.remove(*id).is_some())
            .count())
    }

    async fn heartbeat_tasks_for_runner(&self, runner_id: RunnerId) -> Result<usize, StoreError> {
        self.check_fault(FaultPoint::HeartbeatRunner)?;
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let StoreState { tasks, runners, .. } = &mut *guard;

        let lease = runners
            .get_mut(&runner_id)
            .ok_or_else(|| StoreError::not_found("task runner lease", runner_id))?;
        lease.last_seen = now;
        lease.expired_at = None;

        let mut owned = 0;
        for task in tasks.values_mut().filter(|t| t.is_owned_by(runner_id)) {
            task.leased_at = Some(now);
            owned += 1;
        }
        Ok(owned)
    }

    async fn get_own_tasks(&self, runner_id: RunnerId) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.is_owned_by(runner_id))
            .cloned()
            .collect())
    }

    async fn check_graph_finished(
        &self,
        mut check: FinishedCheck,
    ) -> Result<FinishedCheck, StoreError> {
        let state = self.state.lock().await;
        let graph = state
            .graphs
            .get(&check.graph_id)
            .ok_or_else(|| StoreError::not_found("graph", check.graph_id))?;
        check.done = graph.status.is_terminal() || graph.all_tasks_finished();
        Ok(check)
    }

    async fn set_graph_done(
        &self,
        status: GraphStatus,
        graph_id: GraphId,
    ) -> Result<Option<GraphSummary>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let graph = state
            .graphs
            .get_mut(&graph_id)
            .ok_or_else(|| StoreError::not_found("graph", graph_id))?;
        if graph.status.is_terminal() {
            return Ok(None);
        }
        graph.status = status;
        graph.updated_at = now;
        Ok(Some(graph.summary()))
    }

    async fn heartbeat_scheduler(&self, mut lease: SchedulerLease) -> Result<(), StoreError> {
        self.check_fault(FaultPoint::HeartbeatScheduler)?;
        lease.last_seen = self.clock.now();
        lease.expired_at = None;
        self.state
            .lock()
            .await
            .schedulers
            .insert(lease.scheduler_id, lease);
        Ok(())
    }

    async fn register_task_runner(&self, mut lease: RunnerLease) -> Result<(), StoreError> {
        lease.last_seen = self.clock.now();
        lease.expired_at = None;
        self.state.lock().await.runners.insert(lease.runner_id, lease);
        Ok(())
    }

    async fn find_expired_scheduler_leases(
        &self,
        domain: &str,
        adjust: Duration,
    ) -> Result<Vec<SchedulerLease>, StoreError> {
        self.check_fault(FaultPoint::FindExpiredLeases)?;
        let now = self.clock.now();
        let state = self.state.lock().await;
        Ok(state
            .schedulers
            .values()
            .filter(|l| l.domain == domain && l.is_stale(now, adjust))
            .cloned()
            .collect())
    }

    async fn expire_scheduler_lease(
        &self,
        scheduler_id: SchedulerId,
    ) -> Result<Option<SchedulerLease>, StoreError> {
        self.check_fault(FaultPoint::ExpireLease)?;
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let StoreState {
            graphs, schedulers, ..
        } = &mut *guard;

        let Some(lease) = schedulers
            .get_mut(&scheduler_id)
            .filter(|l| l.expired_at.is_none())
        else {
            return Ok(None);
        };
        lease.expired_at = Some(now);

        for graph in graphs
            .values_mut()
            .filter(|g| g.scheduler_id == Some(scheduler_id) && !g.status.is_terminal())
        {
            graph.scheduler_id = None;
            graph.updated_at = now;
        }
        Ok(Some(lease.clone()))
    }

    async fn find_expired_task_runner_leases(
        &self,
        domain: &str,
        adjust: Duration,
    ) -> Result<Vec<RunnerLease>, StoreError> {
        self.check_fault(FaultPoint::FindExpiredLeases)?;
        let now = self.clock.now();
        let state = self.state.lock().await;
        Ok(state
            .runners
            .values()
            .filter(|l| l.domain == domain && l.is_stale(now, adjust))
            .cloned()
            .collect())
    }

    async fn expire_task_runner_lease(
        &self,
        runner_id: RunnerId,
    ) -> Result<Option<RunnerLease>, StoreError> {
        self.check_fault(FaultPoint::ExpireLease)?;
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let StoreState {
            graphs,
            tasks,
            runners,
            ..
        } = &mut *guard;

        let Some(lease) = runners
            .get_mut(&runner_id)
            .filter(|l| l.expired_at.is_none())
        else {
            return Ok(None);
        };
        lease.expired_at = Some(now);

        for task in tasks.values_mut().filter(|t| t.is_owned_by(runner_id)) {
            task.state = TaskState::Ready;
            task.task_runner_id = None;
            task.leased_at = None;
            task.updated_at = now;
            mirror_state(graphs, task);
        }
        Ok(Some(lease.clone()))
    }
}
