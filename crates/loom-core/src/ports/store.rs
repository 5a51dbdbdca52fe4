//! TaskGraphStore port - graph / task / lease の正本
//!
//! The Store is the only arbiter of ownership. Every method that hands out or
//! takes away ownership (`checkout_task`, `set_graph_done`, the `expire_*`
//! methods, `claim_orphaned_graphs`) must be an atomic check-and-set in the
//! backing implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    FinishedCheck, GraphId, GraphRecord, GraphStatus, GraphSummary, RunnerId, RunnerLease,
    SchedulerId, SchedulerLease, StoreError, TaskFinishedEvent, TaskId, TaskRecord, TaskState,
};

#[async_trait]
pub trait TaskGraphStore: Send + Sync {
    // ---- graphs ----

    /// Persist a new graph with its tasks.
    ///
    /// Fails with `StoreError::Conflict` if a non-terminal graph already owns
    /// the same target.
    async fn create_graph(
        &self,
        graph: GraphRecord,
        tasks: Vec<TaskRecord>,
    ) -> Result<(), StoreError>;

    async fn get_graph(&self, graph_id: GraphId) -> Result<Option<GraphRecord>, StoreError>;

    /// Running graphs of a domain.
    async fn find_active_graphs(&self, domain: &str) -> Result<Vec<GraphRecord>, StoreError>;

    /// Move a graph from `from` to `to`; `None` if it was not in `from`.
    async fn set_graph_status(
        &self,
        graph_id: GraphId,
        from: GraphStatus,
        to: GraphStatus,
    ) -> Result<Option<GraphRecord>, StoreError>;

    /// Take over running graphs of `domain` that have no scheduler.
    async fn claim_orphaned_graphs(
        &self,
        domain: &str,
        scheduler_id: SchedulerId,
    ) -> Result<Vec<GraphId>, StoreError>;

    /// Cancel pending/ready tasks of a graph; returns the running tasks,
    /// which only their runner can stop.
    async fn cancel_graph_tasks(&self, graph_id: GraphId) -> Result<Vec<TaskRecord>, StoreError>;

    // ---- tasks ----

    /// Atomically claim a ready task for `runner_id`. `None` when the task is
    /// not claimable (already owned by a live runner, finished, graph not
    /// running, unknown).
    async fn checkout_task(
        &self,
        runner_id: RunnerId,
        task_id: TaskId,
    ) -> Result<Option<TaskRecord>, StoreError>;

    async fn get_task_by_id(&self, task_id: TaskId) -> Result<TaskRecord, StoreError>;

    /// Promote dependency-satisfied pending tasks to ready and return every
    /// unclaimed ready task of the graph. Empty unless the graph is running.
    async fn find_ready_tasks(
        &self,
        domain: &str,
        graph_id: GraphId,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Record a task's finished state and release its owner.
    ///
    /// With `owner` set, fails with `StoreError::Conflict` unless that runner
    /// still owns the running task.
    async fn set_task_state(
        &self,
        task_id: TaskId,
        graph_id: GraphId,
        state: TaskState,
        owner: Option<RunnerId>,
    ) -> Result<(), StoreError>;

    /// Mirror the task state into the graph record.
    async fn set_task_state_in_graph(&self, event: &TaskFinishedEvent) -> Result<(), StoreError>;

    /// Resolve the finished task for its dependents. Returns the tasks that
    /// became dependency-ready.
    async fn update_dependent_tasks(
        &self,
        event: &TaskFinishedEvent,
    ) -> Result<Vec<TaskId>, StoreError>;

    /// Mark pending dependents whose condition can no longer be satisfied as
    /// unreachable and return them.
    async fn update_unreachable_tasks(
        &self,
        event: &TaskFinishedEvent,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn mark_task_evaluated(&self, task_id: TaskId) -> Result<(), StoreError>;

    /// Finished tasks whose dependency update has not been recorded.
    async fn find_unevaluated_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Finished, evaluated tasks that retention can collect now, oldest
    /// first: their graph is terminal or missing, or the task is terminal and
    /// its graph is running with every task finished (or with this task
    /// failed). Tasks of graphs that keep running are left out.
    async fn find_completed_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn delete_tasks(&self, task_ids: &[TaskId]) -> Result<usize, StoreError>;

    /// Refresh the runner lease and the lease time of every task it owns.
    /// Returns how many tasks the Store thinks the runner owns.
    async fn heartbeat_tasks_for_runner(&self, runner_id: RunnerId) -> Result<usize, StoreError>;

    async fn get_own_tasks(&self, runner_id: RunnerId) -> Result<Vec<TaskRecord>, StoreError>;

    // ---- graph completion ----

    /// Returns `check` with `done` set when every task of the graph finished.
    async fn check_graph_finished(&self, check: FinishedCheck)
    -> Result<FinishedCheck, StoreError>;

    /// Move the graph to a terminal status. Only the first caller gets
    /// `Some(summary)`.
    async fn set_graph_done(
        &self,
        status: GraphStatus,
        graph_id: GraphId,
    ) -> Result<Option<GraphSummary>, StoreError>;

    // ---- leases ----

    /// Upsert and refresh a scheduler lease.
    async fn heartbeat_scheduler(&self, lease: SchedulerLease) -> Result<(), StoreError>;

    /// Create or refresh a runner lease (done once at runner start).
    async fn register_task_runner(&self, lease: RunnerLease) -> Result<(), StoreError>;

    async fn find_expired_scheduler_leases(
        &self,
        domain: &str,
        adjust: Duration,
    ) -> Result<Vec<SchedulerLease>, StoreError>;

    /// Expire one scheduler lease and orphan its graphs. `None` if it was
    /// already expired (or is unknown).
    async fn expire_scheduler_lease(
        &self,
        scheduler_id: SchedulerId,
    ) -> Result<Option<SchedulerLease>, StoreError>;

    async fn find_expired_task_runner_leases(
        &self,
        domain: &str,
        adjust: Duration,
    ) -> Result<Vec<RunnerLease>, StoreError>;

    /// Expire one runner lease and release its running tasks back to ready.
    async fn expire_task_runner_lease(
        &self,
        runner_id: RunnerId,
    ) -> Result<Option<RunnerLease>, StoreError>;
}
