//! Graph records and summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{GraphId, SchedulerId, TaskId};
use super::state::{GraphStatus, TaskState};

/// Persisted state of one graph instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub graph_id: GraphId,
    pub name: String,
    pub domain: String,
    pub status: GraphStatus,
    /// External resource this graph acts on. At most one non-terminal graph
    /// may exist per target.
    pub target: Option<String>,
    pub options: serde_json::Value,
    /// Scheduler currently responsible for the graph; `None` when orphaned.
    pub scheduler_id: Option<SchedulerId>,
    /// Last known state of every task, as seen by dependency evaluation.
    pub task_states: BTreeMap<TaskId, TaskState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphRecord {
    pub fn new(
        graph_id: GraphId,
        name: impl Into<String>,
        domain: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            graph_id,
            name: name.into(),
            domain: domain.into(),
            status: GraphStatus::Running,
            target: None,
            options: serde_json::Value::Null,
            scheduler_id: None,
            task_states: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_scheduler(mut self, scheduler_id: Option<SchedulerId>) -> Self {
        self.scheduler_id = scheduler_id;
        self
    }

    /// Every task has reached a state from which it will not run again.
    pub fn all_tasks_finished(&self) -> bool {
        self.task_states.values().all(|state| state.is_finished())
    }

    pub fn summary(&self) -> GraphSummary {
        GraphSummary {
            graph_id: self.graph_id,
            name: self.name.clone(),
            domain: self.domain.clone(),
            status: self.status,
            target: self.target.clone(),
        }
    }
}

/// Returned by `set_graph_done` to the single caller that finished a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub graph_id: GraphId,
    pub name: String,
    pub domain: String,
    pub status: GraphStatus,
    pub target: Option<String>,
}

/// Input and output of the graph-finished check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedCheck {
    pub graph_id: GraphId,
    pub task_id: TaskId,
    pub state: TaskState,
    pub done: bool,
}

impl FinishedCheck {
    pub fn new(graph_id: GraphId, task_id: TaskId, state: TaskState) -> Self {
        Self {
            graph_id,
            task_id,
            state,
            done: false,
        }
    }
}
