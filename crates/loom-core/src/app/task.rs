//! TaskInstance - one checked-out task while a runner executes it.
//!
//! Task kinds are a closed enum; execution dispatches on the variant. Every
//! kind honours cancellation and the optional per-task timeout.

use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{GraphId, TaskId, TaskKind, TaskRecord, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A cancel event for this task; the result is persisted as cancelled.
    Requested,
    /// The Store no longer lists this runner as owner; the result is dropped.
    OwnershipLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub graph_id: GraphId,
    pub label: String,
    pub kind: &'static str,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub cancel_reason: Option<CancelReason>,
}

pub struct TaskInstance {
    task_id: TaskId,
    graph_id: GraphId,
    label: String,
    kind: TaskKind,
    timeout: Option<Duration>,
    terminal_on_states: Vec<TaskState>,
    started_at: DateTime<Utc>,
    state: Mutex<TaskState>,
    cancel: CancellationToken,
    reason: OnceLock<CancelReason>,
}

impl TaskInstance {
    pub fn create(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id,
            graph_id: record.graph_id,
            label: record.label.clone(),
            kind: record.kind.clone(),
            timeout: record.timeout_ms.map(Duration::from_millis),
            terminal_on_states: record.terminal_on_states.clone(),
            started_at: Utc::now(),
            state: Mutex::new(TaskState::Running),
            cancel: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    pub fn is_terminal(&self, state: TaskState) -> bool {
        state == TaskState::Unreachable || self.terminal_on_states.contains(&state)
    }

    /// Execute the task to a finished state.
    pub async fn run(&self) -> TaskState {
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.execute())
                .await
                .unwrap_or(TaskState::Timeout),
            None => self.execute().await,
        };
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = outcome;
        outcome
    }

    /// The first reason wins; later calls only re-signal the token.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.cancel.cancel();
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub fn to_status(&self) -> TaskStatusView {
        TaskStatusView {
            task_id: self.task_id,
            graph_id: self.graph_id,
            label: self.label.clone(),
            kind: self.kind.name(),
            state: *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            started_at: self.started_at,
            cancel_reason: self.cancel_reason(),
        }
    }

    async fn execute(&self) -> TaskState {
        if self.cancel.is_cancelled() {
            return TaskState::Cancelled;
        }
        match &self.kind {
            TaskKind::Noop => TaskState::Succeeded,
            TaskKind::Sleep { millis } => {
                tokio::select! {
                    _ = self.cancel.cancelled() => TaskState::Cancelled,
                    _ = tokio::time::sleep(Duration::from_millis(*millis)) => TaskState::Succeeded,
                }
            }
            TaskKind::Fail { reason } => {
                warn!(task_id = %self.task_id, label = %self.label, reason = %reason, "task failed");
                TaskState::Failed
            }
            TaskKind::Shell { command } => self.run_shell(command).await,
        }
    }

    async fn run_shell(&self, command: &str) -> TaskState {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                warn!(task_id = %self.task_id, command, error = %err, "failed to spawn command");
                return TaskState::Failed;
            }
        };

        // Dropping the wait future on cancellation kills the child.
        tokio::select! {
            _ = self.cancel.cancelled() => TaskState::Cancelled,
            output = child.wait_with_output() => match output {
                Ok(output) if output.status.success() => {
                    debug!(
                        task_id = %self.task_id,
                        stdout = %String::from_utf8_lossy(&output.stdout).trim_end(),
                        "command succeeded"
                    );
                    TaskState::Succeeded
                }
                Ok(output) => {
                    warn!(
                        task_id = %self.task_id,
                        command,
                        exit_code = ?output.status.code(),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                        "command failed"
                    );
                    TaskState::Failed
                }
                Err(err) => {
                    warn!(task_id = %self.task_id, command, error = %err, "failed to wait for command");
                    TaskState::Failed
                }
            },
        }
    }
}
