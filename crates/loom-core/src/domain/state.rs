//! State - タスクとグラフの状態

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskState はタスクの状態を表現
///
/// # 状態遷移
/// - pending: 依存待ち
/// - ready: 実行可能（runner の checkout 待ち）
/// - running: 実行中（runner が所有）
/// - succeeded / failed / cancelled / timeout: 実行結果
/// - unreachable: 依存条件が満たされ得ないため実行されない
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
    Unreachable,
}

impl TaskState {
    /// The task will never run (again).
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed
                | TaskState::Cancelled
                | TaskState::Timeout
                | TaskState::Unreachable
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::Cancelled | TaskState::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Timeout => "timeout",
            TaskState::Unreachable => "unreachable",
        }
    }

    /// Default `terminal_on_states` of a task definition.
    pub fn default_terminal() -> Vec<TaskState> {
        vec![
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Cancelled,
            TaskState::Timeout,
        ]
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GraphStatus はグラフ全体の状態を表現
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl GraphStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GraphStatus::Succeeded | GraphStatus::Failed | GraphStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GraphStatus::Running => "running",
            GraphStatus::Paused => "paused",
            GraphStatus::Succeeded => "succeeded",
            GraphStatus::Failed => "failed",
            GraphStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition a task waits on for one of its upstream tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitOn {
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
    /// Any outcome of an upstream task that actually ran.
    Finished,
}

impl WaitOn {
    /// Upstream states that satisfy this condition.
    pub fn accepted_states(self) -> Vec<TaskState> {
        match self {
            WaitOn::Succeeded => vec![TaskState::Succeeded],
            WaitOn::Failed => vec![TaskState::Failed],
            WaitOn::Cancelled => vec![TaskState::Cancelled],
            WaitOn::Timeout => vec![TaskState::Timeout],
            WaitOn::Finished => TaskState::default_terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Pending, false, false)]
    #[case(TaskState::Ready, false, false)]
    #[case(TaskState::Running, false, false)]
    #[case(TaskState::Succeeded, true, false)]
    #[case(TaskState::Failed, true, true)]
    #[case(TaskState::Cancelled, true, true)]
    #[case(TaskState::Timeout, true, true)]
    #[case(TaskState::Unreachable, true, false)]
    fn task_state_classification(
        #[case] state: TaskState,
        #[case] finished: bool,
        #[case] failure: bool,
    ) {
        assert_eq!(state.is_finished(), finished);
        assert_eq!(state.is_failure(), failure);
    }

    #[rstest]
    #[case(WaitOn::Succeeded, TaskState::Succeeded, true)]
    #[case(WaitOn::Succeeded, TaskState::Failed, false)]
    #[case(WaitOn::Failed, TaskState::Failed, true)]
    #[case(WaitOn::Finished, TaskState::Timeout, true)]
    #[case(WaitOn::Finished, TaskState::Unreachable, false)]
    fn wait_on_accepts_states(#[case] wait_on: WaitOn, #[case] state: TaskState, #[case] ok: bool) {
        assert_eq!(wait_on.accepted_states().contains(&state), ok);
    }

    #[test]
    fn states_use_lowercase_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskState::Unreachable).unwrap(),
            "\"unreachable\""
        );
        let status: GraphStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(status, GraphStatus::Paused);
    }
}
