//! Task records and task kinds.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GraphId, RunnerId, TaskId};
use super::state::TaskState;

/// Closed set of things a task can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskKind {
    Noop,
    Sleep { millis: u64 },
    Fail { reason: String },
    Shell { command: String },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Noop => "noop",
            TaskKind::Sleep { .. } => "sleep",
            TaskKind::Fail { .. } => "fail",
            TaskKind::Shell { .. } => "shell",
        }
    }
}

/// Persisted state of one task instance.
///
/// Ownership is expressed by `task_runner_id`: a running task has exactly one
/// owner, and only the Store may change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub graph_id: GraphId,
    pub domain: String,
    pub label: String,
    pub name: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub terminal_on_states: Vec<TaskState>,
    /// Upstream task -> states of that task which satisfy this one.
    pub dependencies: BTreeMap<TaskId, Vec<TaskState>>,
    /// Upstream tasks whose condition is already satisfied.
    pub resolved: BTreeSet<TaskId>,
    pub task_runner_id: Option<RunnerId>,
    pub leased_at: Option<DateTime<Utc>>,
    /// Dependency update has processed the latest finished state.
    pub evaluated: bool,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        graph_id: GraphId,
        domain: impl Into<String>,
        label: impl Into<String>,
        kind: TaskKind,
        now: DateTime<Utc>,
    ) -> Self {
        let label = label.into();
        Self {
            task_id,
            graph_id,
            domain: domain.into(),
            name: label.clone(),
            label,
            kind,
            state: TaskState::Pending,
            terminal_on_states: TaskState::default_terminal(),
            dependencies: BTreeMap::new(),
            resolved: BTreeSet::new(),
            task_runner_id: None,
            leased_at: None,
            evaluated: false,
            timeout_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_dependency(mut self, upstream: TaskId, accepted: Vec<TaskState>) -> Self {
        self.dependencies.insert(upstream, accepted);
        self
    }

    pub fn with_terminal_on_states(mut self, states: Vec<TaskState>) -> Self {
        self.terminal_on_states = states;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Whether reaching `state` ends this task's contribution to the graph.
    /// `unreachable` is always absorbing.
    pub fn is_terminal(&self, state: TaskState) -> bool {
        state == TaskState::Unreachable || self.terminal_on_states.contains(&state)
    }

    pub fn dependencies_resolved(&self) -> bool {
        self.dependencies.keys().all(|id| self.resolved.contains(id))
    }

    pub fn is_owned_by(&self, runner_id: RunnerId) -> bool {
        self.state == TaskState::Running && self.task_runner_id == Some(runner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::generate(),
            GraphId::generate(),
            "default",
            "a",
            TaskKind::Noop,
            Utc::now(),
        )
    }

    #[test]
    fn unreachable_is_always_terminal() {
        let task = record().with_terminal_on_states(vec![TaskState::Succeeded]);
        assert!(task.is_terminal(TaskState::Unreachable));
        assert!(task.is_terminal(TaskState::Succeeded));
        assert!(!task.is_terminal(TaskState::Failed));
    }

    #[test]
    fn dependencies_resolve_once_every_upstream_is_satisfied() {
        let up1 = TaskId::generate();
        let up2 = TaskId::generate();
        let mut task = record()
            .with_dependency(up1, vec![TaskState::Succeeded])
            .with_dependency(up2, vec![TaskState::Failed]);

        assert!(!task.dependencies_resolved());
        task.resolved.insert(up1);
        assert!(!task.dependencies_resolved());
        task.resolved.insert(up2);
        assert!(task.dependencies_resolved());
    }

    #[test]
    fn task_kind_uses_type_tag() {
        let kind: TaskKind =
            serde_json::from_str(r#"{"type":"sleep","millis":25}"#).unwrap();
        assert_eq!(kind, TaskKind::Sleep { millis: 25 });
        assert_eq!(kind.name(), "sleep");
    }
}
