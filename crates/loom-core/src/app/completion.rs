//! Graph completion, shared by the scheduler and the retention poller.

use tracing::{debug, info};

use crate::domain::{
    FinishedCheck, GraphFinishedEvent, GraphStatus, GraphSummary, LoomError, TaskFinishedEvent,
};
use crate::ports::{Messenger, TaskGraphStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// This call moved the graph to a terminal status and published it.
    Finished(GraphSummary),
    /// Another caller finished the graph first.
    AlreadyFinished,
    /// Tasks are still outstanding.
    Running,
}

/// Decide whether a terminal task state finishes its graph.
///
/// A terminal failure fails the graph immediately. Otherwise the graph
/// succeeds once every task has finished. `set_graph_done` is the
/// check-and-set that guarantees a single `GraphFinishedEvent`.
pub async fn handle_potential_finished_graph(
    store: &dyn TaskGraphStore,
    messenger: &dyn Messenger,
    domain: &str,
    event: &TaskFinishedEvent,
) -> Result<Completion, LoomError> {
    let status = if event.state.is_failure() {
        Some(GraphStatus::Failed)
    } else {
        let check = store
            .check_graph_finished(FinishedCheck::new(
                event.graph_id,
                event.task_id,
                event.state,
            ))
            .await?;
        check.done.then_some(GraphStatus::Succeeded)
    };

    let Some(status) = status else {
        return Ok(Completion::Running);
    };

    match store.set_graph_done(status, event.graph_id).await? {
        Some(summary) => {
            messenger
                .publish_graph_finished(
                    domain,
                    GraphFinishedEvent {
                        graph_id: summary.graph_id,
                        status: summary.status,
                    },
                )
                .await?;
            info!(
                graph_id = %summary.graph_id,
                graph_name = %summary.name,
                status = %summary.status,
                task_id = %event.task_id,
                "graph finished"
            );
            Ok(Completion::Finished(summary))
        }
        None => {
            debug!(graph_id = %event.graph_id, "graph already finished");
            Ok(Completion::AlreadyFinished)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GraphId, GraphRecord, TaskId, TaskKind, TaskRecord, TaskState};
    use crate::impls::{InMemoryMessenger, InMemoryStore};
    use chrono::Utc;

    async fn graph_with_two_tasks(store: &InMemoryStore) -> (GraphId, TaskId, TaskId) {
        let now = Utc::now();
        let graph_id = GraphId::generate();
        let (x, y) = (TaskId::generate(), TaskId::generate());
        store
            .create_graph(
                GraphRecord::new(graph_id, "Graph.Pair", "default", now),
                vec![
                    TaskRecord::new(x, graph_id, "default", "x", TaskKind::Noop, now),
                    TaskRecord::new(y, graph_id, "default", "y", TaskKind::Noop, now),
                ],
            )
            .await
            .unwrap();
        (graph_id, x, y)
    }

    fn event(graph_id: GraphId, task_id: TaskId, state: TaskState) -> TaskFinishedEvent {
        TaskFinishedEvent {
            task_id,
            graph_id,
            state,
            terminal: true,
        }
    }

    #[tokio::test]
    async fn terminal_failure_fails_graph_once() {
        let store = InMemoryStore::new();
        let messenger = InMemoryMessenger::new();
        let mut finished = messenger.subscribe_graph_finished("default").await.unwrap();
        let (graph_id, x, _) = graph_with_two_tasks(&store).await;
        let failed = event(graph_id, x, TaskState::Failed);

        let first = handle_potential_finished_graph(&store, &messenger, "default", &failed)
            .await
            .unwrap();
        let second = handle_potential_finished_graph(&store, &messenger, "default", &failed)
            .await
            .unwrap();

        assert!(matches!(first, Completion::Finished(s) if s.status == GraphStatus::Failed));
        assert_eq!(second, Completion::AlreadyFinished);
        assert_eq!(
            finished.recv().await,
            Some(GraphFinishedEvent {
                graph_id,
                status: GraphStatus::Failed
            })
        );
        assert!(finished.try_recv().is_none());
    }

    #[tokio::test]
    async fn graph_succeeds_only_after_every_task_finished() {
        let store = InMemoryStore::new();
        let messenger = InMemoryMessenger::new();
        let (graph_id, x, y) = graph_with_two_tasks(&store).await;

        let x_done = event(graph_id, x, TaskState::Succeeded);
        store.set_task_state_in_graph(&x_done).await.unwrap();
        assert_eq!(
            handle_potential_finished_graph(&store, &messenger, "default", &x_done)
                .await
                .unwrap(),
            Completion::Running
        );

        let y_done = event(graph_id, y, TaskState::Succeeded);
        store.set_task_state_in_graph(&y_done).await.unwrap();
        let completion = handle_potential_finished_graph(&store, &messenger, "default", &y_done)
            .await
            .unwrap();
        assert!(matches!(completion, Completion::Finished(s) if s.status == GraphStatus::Succeeded));
    }
}
