//! Domain model (IDs, states, records, leases, events, definitions).

pub mod definition;
pub mod dependency;
pub mod errors;
pub mod events;
pub mod graph;
pub mod ids;
pub mod lease;
pub mod state;
pub mod task;

pub use self::definition::{GraphDefinition, GraphTaskSpec, TaskDefinition};
pub use self::dependency::DependencyGraph;
pub use self::errors::{
    DefinitionError, ErrorKind, LoomError, MessengerError, RequestError, StoreError,
};
pub use self::events::{
    CancelTaskEvent, GraphFinishedEvent, RunGraphEvent, RunTaskEvent, TaskFinishedEvent,
};
pub use self::graph::{FinishedCheck, GraphRecord, GraphSummary};
pub use self::ids::{GraphId, RunnerId, SchedulerId, TaskId};
pub use self::lease::{RunnerLease, SchedulerLease};
pub use self::state::{GraphStatus, TaskState, WaitOn};
pub use self::task::{TaskKind, TaskRecord};
