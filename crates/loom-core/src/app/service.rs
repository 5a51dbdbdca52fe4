//! GraphService - client 向け操作
//!
//! Library queries, definitions, and the run / cancel / pause / resume
//! lifecycle of graph instances. Request errors go straight back to the
//! caller; nothing here retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::registry::{ActiveGraph, GraphFilter, GraphRegistry};
use crate::domain::{
    CancelTaskEvent, DefinitionError, GraphDefinition, GraphFinishedEvent, GraphId, GraphRecord,
    GraphStatus, GraphSummary, LoomError, RequestError, RunGraphEvent, StoreError, TaskDefinition,
    TaskId, TaskRecord,
};
use crate::ports::{IdGenerator, Messenger, TaskGraphStore};

pub struct GraphService {
    domain: String,
    store: Arc<dyn TaskGraphStore>,
    messenger: Arc<dyn Messenger>,
    registry: Arc<GraphRegistry>,
    ids: Arc<dyn IdGenerator>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl GraphService {
    pub fn new(
        domain: impl Into<String>,
        store: Arc<dyn TaskGraphStore>,
        messenger: Arc<dyn Messenger>,
        registry: Arc<GraphRegistry>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            domain: domain.into(),
            store,
            messenger,
            registry,
            ids,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Follow `GraphFinishedEvent`s so finished graphs leave the active index.
    pub async fn start(&mut self) -> Result<(), LoomError> {
        if self.handle.is_some() && !self.shutdown.is_cancelled() {
            return Ok(());
        }
        let mut finished = self.messenger.subscribe_graph_finished(&self.domain).await?;
        self.shutdown = CancellationToken::new();
        let shutdown = self.shutdown.clone();
        let registry = Arc::clone(&self.registry);
        self.handle = Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = finished.recv() => event,
                };
                let Some(event) = event else { break };
                if registry.remove_active(event.graph_id).is_some() {
                    debug!(graph_id = %event.graph_id, status = %event.status, "graph left active index");
                }
            }
        }));
        Ok(())
    }

    pub fn stop(&mut self) {
        self.shutdown.cancel();
        self.handle = None;
    }

    pub fn registry(&self) -> &Arc<GraphRegistry> {
        &self.registry
    }

    // ---- library ----

    pub fn get_task_graph_library(&self, name: Option<&str>) -> Vec<GraphDefinition> {
        self.registry.graph_catalog(name)
    }

    pub fn get_task_library(&self, name: Option<&str>) -> Vec<TaskDefinition> {
        self.registry.task_catalog(name)
    }

    pub fn get_active_task_graph(&self, filter: &GraphFilter) -> Option<ActiveGraph> {
        self.registry.active_graph(filter)
    }

    pub fn get_active_task_graphs(&self, filter: &GraphFilter) -> Vec<ActiveGraph> {
        self.registry.active_graphs(filter)
    }

    pub fn define_task(&self, definition: TaskDefinition) -> Result<String, RequestError> {
        let name = definition.injectable_name.clone();
        self.registry.register_task(definition)?;
        info!(task_name = %name, "task defined");
        Ok(name)
    }

    /// Catalog references must resolve at definition time.
    pub fn define_task_graph(&self, definition: GraphDefinition) -> Result<String, RequestError> {
        definition.validate()?;
        for spec in &definition.tasks {
            if let Some(task_name) = &spec.task_name
                && self.registry.task_definition(task_name).is_none()
            {
                return Err(RequestError::UnknownTask(task_name.clone()));
            }
        }
        let name = definition.injectable_name.clone();
        self.registry.register_graph(definition)?;
        info!(graph_name = %name, "task graph defined");
        Ok(name)
    }

    // ---- lifecycle ----

    pub async fn run_task_graph(
        &self,
        name: &str,
        options: Option<Value>,
        target: Option<String>,
    ) -> Result<ActiveGraph, RequestError> {
        if let Some(target) = &target
            && self.registry.has_active_for_target(target)
        {
            return Err(RequestError::TargetBusy(target.clone()));
        }
        let definition = self
            .registry
            .graph_definition(name)
            .ok_or_else(|| RequestError::UnknownGraph(name.to_string()))?;

        let now = Utc::now();
        let graph_id = self.ids.generate_graph_id();
        let tasks = self.instantiate_tasks(&definition, graph_id)?;
        let graph = GraphRecord::new(graph_id, &definition.injectable_name, &self.domain, now)
            .with_target(target.clone())
            .with_options(merge_options(&definition.options, options));

        match self.store.create_graph(graph.clone(), tasks).await {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                debug!(graph_name = %definition.injectable_name, reason = %reason, "create_graph conflict");
                return Err(RequestError::TargetBusy(
                    target.unwrap_or_else(|| graph_id.to_string()),
                ));
            }
            Err(err) => return Err(err.into()),
        }

        let active = ActiveGraph::from(&graph);
        self.registry.put_active(active.clone());
        self.messenger
            .publish_run_task_graph(&self.domain, RunGraphEvent { graph_id })
            .await?;
        info!(
            graph_id = %graph_id,
            graph_name = %definition.injectable_name,
            target = ?graph.target,
            domain = %self.domain,
            "running task graph"
        );
        Ok(active)
    }

    pub async fn cancel_task_graph(&self, filter: &GraphFilter) -> Result<GraphSummary, RequestError> {
        let graph_id = self.resolve(filter).await?;
        let summary = self
            .store
            .set_graph_done(GraphStatus::Cancelled, graph_id)
            .await?
            .ok_or(RequestError::GraphNotFound)?;

        let running = self.store.cancel_graph_tasks(graph_id).await?;
        for task in &running {
            self.messenger
                .publish_cancel_task(
                    &self.domain,
                    CancelTaskEvent {
                        task_id: task.task_id,
                        graph_id,
                    },
                )
                .await?;
        }
        self.messenger
            .publish_graph_finished(
                &self.domain,
                GraphFinishedEvent {
                    graph_id,
                    status: GraphStatus::Cancelled,
                },
            )
            .await?;
        self.registry.remove_active(graph_id);
        info!(
            graph_id = %graph_id,
            graph_name = %summary.name,
            running_tasks = running.len(),
            "task graph cancelled"
        );
        Ok(summary)
    }

    pub async fn pause_task_graph(&self, filter: &GraphFilter) -> Result<GraphSummary, RequestError> {
        let graph_id = self.resolve(filter).await?;
        let graph = self
            .store
            .set_graph_status(graph_id, GraphStatus::Running, GraphStatus::Paused)
            .await?
            .ok_or(RequestError::GraphNotFound)?;
        self.registry.update_status(graph_id, GraphStatus::Paused);
        info!(graph_id = %graph_id, "task graph paused");
        Ok(graph.summary())
    }

    pub async fn resume_task_graph(&self, filter: &GraphFilter) -> Result<GraphSummary, RequestError> {
        let graph_id = self.resolve(filter).await?;
        let graph = self
            .store
            .set_graph_status(graph_id, GraphStatus::Paused, GraphStatus::Running)
            .await?
            .ok_or(RequestError::GraphNotFound)?;
        self.registry.update_status(graph_id, GraphStatus::Running);
        self.messenger
            .publish_run_task_graph(&self.domain, RunGraphEvent { graph_id })
            .await?;
        info!(graph_id = %graph_id, "task graph resumed");
        Ok(graph.summary())
    }

    /// Re-read a graph from the Store and bring the active index in line.
    pub async fn handle_graph_state_change(
        &self,
        graph_id: GraphId,
    ) -> Result<Option<GraphStatus>, RequestError> {
        let Some(graph) = self.store.get_graph(graph_id).await? else {
            self.registry.remove_active(graph_id);
            return Ok(None);
        };
        if graph.status.is_terminal() {
            self.registry.remove_active(graph_id);
        } else if !self.registry.update_status(graph_id, graph.status) {
            self.registry.put_active(ActiveGraph::from(&graph));
        }
        debug!(graph_id = %graph_id, status = %graph.status, "graph state change handled");
        Ok(Some(graph.status))
    }

    /// The local index answers first; a bare graph id falls back to the Store
    /// for graphs started on another node.
    async fn resolve(&self, filter: &GraphFilter) -> Result<GraphId, RequestError> {
        if let Some(graph) = self.registry.active_graph(filter) {
            return Ok(graph.graph_id);
        }
        if let Some(graph_id) = filter.graph_id
            && let Some(graph) = self.store.get_graph(graph_id).await?
            && !graph.status.is_terminal()
        {
            return Ok(graph.graph_id);
        }
        Err(RequestError::GraphNotFound)
    }

    fn instantiate_tasks(
        &self,
        definition: &GraphDefinition,
        graph_id: GraphId,
    ) -> Result<Vec<TaskRecord>, RequestError> {
        let now = Utc::now();
        let ids: BTreeMap<&str, TaskId> = definition
            .tasks
            .iter()
            .map(|spec| (spec.label.as_str(), self.ids.generate_task_id()))
            .collect();

        let mut records = Vec::with_capacity(definition.tasks.len());
        for spec in &definition.tasks {
            let task = match (&spec.task_definition, &spec.task_name) {
                (Some(inline), _) => inline.clone(),
                (None, Some(name)) => self
                    .registry
                    .task_definition(name)
                    .ok_or_else(|| RequestError::UnknownTask(name.clone()))?,
                (None, None) => {
                    return Err(DefinitionError::AmbiguousTask(spec.label.clone()).into());
                }
            };

            let task_id = ids[spec.label.as_str()];
            let mut record = TaskRecord::new(
                task_id,
                graph_id,
                &self.domain,
                &spec.label,
                task.kind.clone(),
                now,
            )
            .with_name(&task.injectable_name)
            .with_terminal_on_states(task.terminal_on_states.clone())
            .with_timeout_ms(task.timeout_ms);

            for (upstream, condition) in &spec.wait_on {
                let upstream_id = ids.get(upstream.as_str()).copied().ok_or_else(|| {
                    DefinitionError::UnknownWaitOn {
                        label: spec.label.clone(),
                        upstream: upstream.clone(),
                    }
                })?;
                record = record.with_dependency(upstream_id, condition.accepted_states());
            }
            records.push(record);
        }
        Ok(records)
    }
}

impl Drop for GraphService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Run options overlay the definition's defaults key by key.
fn merge_options(defaults: &Value, overrides: Option<Value>) -> Value {
    match (defaults, overrides) {
        (Value::Object(base), Some(Value::Object(extra))) => {
            let mut merged = base.clone();
            merged.extend(extra);
            Value::Object(merged)
        }
        (_, Some(overrides)) => overrides,
        (defaults, None) => defaults.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GraphTaskSpec, TaskKind, TaskState, WaitOn};
    use crate::impls::{InMemoryMessenger, InMemoryStore};
    use crate::ports::{SystemClock, UlidGenerator};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        messenger: Arc<InMemoryMessenger>,
        service: GraphService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let messenger = Arc::new(InMemoryMessenger::new());
        let service = GraphService::new(
            "default",
            store.clone(),
            messenger.clone(),
            Arc::new(GraphRegistry::new()),
            Arc::new(UlidGenerator::new(SystemClock)),
        );
        service
            .define_task(TaskDefinition::new("Task.Noop", TaskKind::Noop))
            .unwrap();
        service
            .define_task_graph(GraphDefinition::new(
                "Graph.Pair",
                vec![
                    GraphTaskSpec::named("a", "Task.Noop"),
                    GraphTaskSpec::named("b", "Task.Noop").wait_on("a", WaitOn::Finished),
                ],
            ))
            .unwrap();
        Fixture {
            store,
            messenger,
            service,
        }
    }

    #[tokio::test]
    async fn run_creates_graph_and_publishes_run_event() {
        let fx = fixture();
        let mut runs = fx.messenger.subscribe_run_task_graph("default").await.unwrap();

        let active = fx
            .service
            .run_task_graph("Graph.Pair", Some(json!({"retries": 1})), Some("node-1".into()))
            .await
            .unwrap();

        assert_eq!(runs.try_recv().unwrap().graph_id, active.graph_id);
        let tasks = fx.store.tasks_of_graph(active.graph_id).await;
        assert_eq!(tasks.len(), 2);
        let a = tasks.iter().find(|t| t.label == "a").unwrap();
        let b = tasks.iter().find(|t| t.label == "b").unwrap();
        assert_eq!(b.dependencies[&a.task_id], TaskState::default_terminal());
        assert_eq!(a.name, "Task.Noop");
        assert_eq!(active.options, json!({"retries": 1}));
        assert_eq!(
            fx.service
                .get_active_task_graphs(&GraphFilter::by_target("node-1"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn second_run_against_busy_target_is_rejected() {
        let fx = fixture();
        fx.service
            .run_task_graph("Graph.Pair", None, Some("node-1".into()))
            .await
            .unwrap();

        let err = fx
            .service
            .run_task_graph("Graph.Pair", None, Some("node-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::TargetBusy(t) if t == "node-1"));

        // other targets are unaffected
        assert!(
            fx.service
                .run_task_graph("Graph.Pair", None, Some("node-2".into()))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn unknown_names_are_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.service.run_task_graph("Graph.Missing", None, None).await,
            Err(RequestError::UnknownGraph(name)) if name == "Graph.Missing"
        ));
        assert!(matches!(
            fx.service.define_task_graph(GraphDefinition::new(
                "Graph.Bad",
                vec![GraphTaskSpec::named("x", "Task.Missing")],
            )),
            Err(RequestError::UnknownTask(name)) if name == "Task.Missing"
        ));
        assert!(matches!(
            fx.service.define_task_graph(GraphDefinition::new(
                "Graph.Cycle",
                vec![
                    GraphTaskSpec::named("x", "Task.Noop").wait_on("y", WaitOn::Succeeded),
                    GraphTaskSpec::named("y", "Task.Noop").wait_on("x", WaitOn::Succeeded),
                ],
            )),
            Err(RequestError::InvalidDefinition(DefinitionError::Cycle(_)))
        ));
    }

    #[tokio::test]
    async fn cancel_finishes_graph_and_frees_target() {
        let fx = fixture();
        let mut finished = fx.messenger.subscribe_graph_finished("default").await.unwrap();
        let active = fx
            .service
            .run_task_graph("Graph.Pair", None, Some("node-1".into()))
            .await
            .unwrap();

        let summary = fx
            .service
            .cancel_task_graph(&GraphFilter::by_target("node-1"))
            .await
            .unwrap();

        assert_eq!(summary.status, GraphStatus::Cancelled);
        assert_eq!(
            finished.try_recv(),
            Some(GraphFinishedEvent {
                graph_id: active.graph_id,
                status: GraphStatus::Cancelled
            })
        );
        assert!(
            fx.store
                .tasks_of_graph(active.graph_id)
                .await
                .iter()
                .all(|t| t.state == TaskState::Cancelled)
        );
        assert!(
            fx.service
                .run_task_graph("Graph.Pair", None, Some("node-1".into()))
                .await
                .is_ok()
        );
        assert!(matches!(
            fx.service.cancel_task_graph(&GraphFilter::by_id(active.graph_id)).await,
            Err(RequestError::GraphNotFound)
        ));
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let fx = fixture();
        let mut runs = fx.messenger.subscribe_run_task_graph("default").await.unwrap();
        let active = fx.service.run_task_graph("Graph.Pair", None, None).await.unwrap();
        let _ = runs.try_recv();
        let filter = GraphFilter::by_id(active.graph_id);

        assert_eq!(
            fx.service.pause_task_graph(&filter).await.unwrap().status,
            GraphStatus::Paused
        );
        assert!(matches!(
            fx.service.pause_task_graph(&filter).await,
            Err(RequestError::GraphNotFound)
        ));
        assert_eq!(
            fx.service.resume_task_graph(&filter).await.unwrap().status,
            GraphStatus::Running
        );
        assert_eq!(runs.try_recv().unwrap().graph_id, active.graph_id);
    }

    #[tokio::test]
    async fn finished_graphs_leave_the_active_index() {
        let mut fx = fixture();
        fx.service.start().await.unwrap();
        let active = fx.service.run_task_graph("Graph.Pair", None, None).await.unwrap();

        fx.store
            .set_graph_done(GraphStatus::Succeeded, active.graph_id)
            .await
            .unwrap();
        fx.messenger
            .publish_graph_finished(
                "default",
                GraphFinishedEvent {
                    graph_id: active.graph_id,
                    status: GraphStatus::Succeeded,
                },
            )
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while fx
                .service
                .get_active_task_graph(&GraphFilter::by_id(active.graph_id))
                .is_some()
            {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            fx.service.handle_graph_state_change(active.graph_id).await.unwrap(),
            Some(GraphStatus::Succeeded)
        );
        fx.service.stop();
    }

    #[test]
    fn run_options_overlay_definition_defaults() {
        let merged = merge_options(&json!({"a": 1, "b": 2}), Some(json!({"b": 3})));
        assert_eq!(merged, json!({"a": 1, "b": 3}));
        assert_eq!(merge_options(&json!({"a": 1}), None), json!({"a": 1}));
    }
}
