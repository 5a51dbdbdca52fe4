//! CompletedTaskPoller - 完了 task の回収
//!
//! Finished, evaluated tasks are retention candidates. Each tick the poller
//! runs the graph-finished check for terminal ones (publishing
//! `GraphFinishedEvent` if no scheduler did) and deletes the tasks of graphs
//! that reached a terminal status.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::completion::handle_potential_finished_graph;
use crate::domain::{GraphId, LoomError, TaskFinishedEvent, TaskId};
use crate::ports::{Messenger, TaskGraphStore};

pub struct CompletedTaskPoller {
    inner: Arc<PollerInner>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct PollerInner {
    domain: String,
    store: Arc<dyn TaskGraphStore>,
    messenger: Arc<dyn Messenger>,
    poll_interval: Duration,
    batch_limit: usize,
    running: AtomicBool,
}

impl CompletedTaskPoller {
    pub fn new(
        domain: impl Into<String>,
        store: Arc<dyn TaskGraphStore>,
        messenger: Arc<dyn Messenger>,
        poll_interval: Duration,
        batch_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                domain: domain.into(),
                store,
                messenger,
                poll_interval,
                batch_limit,
                running: AtomicBool::new(false),
            }),
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.shutdown = CancellationToken::new();
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move { inner.poll(shutdown).await }));
    }

    pub fn stop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.handle = None;
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// One pass. Returns how many tasks were deleted.
    pub async fn process_completed_tasks(&self) -> Result<usize, LoomError> {
        self.inner.process().await
    }
}

impl Drop for CompletedTaskPoller {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl PollerInner {
    async fn poll(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.process().await {
                error!(domain = %self.domain, error = %err, "failed to process completed tasks");
            }
        }
    }

    async fn process(&self) -> Result<usize, LoomError> {
        let completed = self
            .store
            .find_completed_tasks(&self.domain, self.batch_limit)
            .await?;
        if completed.is_empty() {
            return Ok(0);
        }

        for task in completed.iter().filter(|t| t.is_terminal(t.state)) {
            let event = TaskFinishedEvent {
                task_id: task.task_id,
                graph_id: task.graph_id,
                state: task.state,
                terminal: true,
            };
            if let Err(err) = handle_potential_finished_graph(
                self.store.as_ref(),
                self.messenger.as_ref(),
                &self.domain,
                &event,
            )
            .await
            {
                warn!(
                    domain = %self.domain,
                    task_id = %task.task_id,
                    graph_id = %task.graph_id,
                    error = %err,
                    "failed to check graph completion"
                );
            }
        }

        let mut by_graph: HashMap<GraphId, Vec<TaskId>> = HashMap::new();
        for task in &completed {
            by_graph.entry(task.graph_id).or_default().push(task.task_id);
        }

        let mut finished_graphs = HashSet::new();
        for graph_id in by_graph.keys() {
            match self.store.get_graph(*graph_id).await {
                Ok(Some(graph)) if graph.status.is_terminal() => {
                    finished_graphs.insert(*graph_id);
                }
                // graph record already gone; its tasks are orphans
                Ok(None) => {
                    finished_graphs.insert(*graph_id);
                }
                Ok(Some(_)) => {}
                Err(err) => warn!(
                    domain = %self.domain,
                    graph_id = %graph_id,
                    error = %err,
                    "failed to look up graph"
                ),
            }
        }

        let removable: Vec<TaskId> = by_graph
            .into_iter()
            .filter(|(graph_id, _)| finished_graphs.contains(graph_id))
            .flat_map(|(_, tasks)| tasks)
            .collect();
        if removable.is_empty() {
            debug!(domain = %self.domain, completed = completed.len(), "no graph finished yet");
            return Ok(0);
        }

        let deleted = self.store.delete_tasks(&removable).await?;
        info!(domain = %self.domain, deleted, "deleted completed tasks");
        Ok(deleted)
    }
}
