//! Events exchanged over the messenger.
//!
//! Delivery is at-least-once and best-effort; every consumer treats an event
//! as a trigger to re-read the Store, never as the source of truth.

use serde::{Deserialize, Serialize};

use super::ids::{GraphId, TaskId};
use super::state::{GraphStatus, TaskState};

/// A task may be ready; runners race to check it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskEvent {
    pub task_id: TaskId,
    pub graph_id: GraphId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskEvent {
    pub task_id: TaskId,
    pub graph_id: GraphId,
}

/// A task reached a finished state (including cascaded `unreachable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFinishedEvent {
    pub task_id: TaskId,
    pub graph_id: GraphId,
    pub state: TaskState,
    /// `state` is one of the task's terminal-on states.
    pub terminal: bool,
}

/// A graph was created, resumed or otherwise changed and needs evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunGraphEvent {
    pub graph_id: GraphId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFinishedEvent {
    pub graph_id: GraphId,
    pub status: GraphStatus,
}
