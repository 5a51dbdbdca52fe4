//! Errors - エラー型と分類

use thiserror::Error;

/// ErrorKind は実行エラーの運用分類
///
/// - Transient: 次の poll / event で回復し得る（stage 内で握りつぶす）
/// - OwnershipLost: lease / checkout を失った。結果は破棄する
/// - Fatal: lease heartbeat の失敗。そのコンポーネントを止める
/// - Validation: 呼び出し元へそのまま返す
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    OwnershipLost,
    Fatal,
    Validation,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("messenger unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("definition has no injectable name")]
    MissingName,

    #[error("graph {0} has no tasks")]
    EmptyGraph(String),

    #[error("duplicate task label: {0}")]
    DuplicateLabel(String),

    #[error("task {0} must set exactly one of taskName or taskDefinition")]
    AmbiguousTask(String),

    #[error("task {label} waits on unknown label {upstream}")]
    UnknownWaitOn { label: String, upstream: String },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("task definition {0} has non-finished terminal states")]
    InvalidTerminalStates(String),
}

/// Errors returned synchronously to a client request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Unable to run multiple task graphs against a single target: {0}")]
    TargetBusy(String),

    #[error("Graph with name {0} does not exist")]
    UnknownGraph(String),

    #[error("Task with name {0} does not exist")]
    UnknownTask(String),

    #[error("no active graph matches the filter")]
    GraphNotFound,

    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Messenger(#[from] MessengerError),
}

/// Umbrella error of pipeline stages and long-running components.
#[derive(Debug, Error)]
pub enum LoomError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Messenger(#[from] MessengerError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("pipeline task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl LoomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoomError::Store(StoreError::Conflict(_)) => ErrorKind::OwnershipLost,
            LoomError::Store(_) | LoomError::Messenger(_) | LoomError::Join(_) => {
                ErrorKind::Transient
            }
            LoomError::Request(_) => ErrorKind::Validation,
            LoomError::LeaseLost(_) => ErrorKind::Fatal,
        }
    }
}
