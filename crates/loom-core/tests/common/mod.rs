use std::sync::{Arc, Once};
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

use loom_core::app::{Engine, EngineBuilder, Roles};
use loom_core::config::EngineConfig;
use loom_core::domain::{
    GraphDefinition, GraphFinishedEvent, GraphTaskSpec, TaskDefinition, TaskKind, WaitOn,
};
use loom_core::impls::{InMemoryMessenger, InMemoryStore};
use loom_core::ports::Subscription;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Enable levels with e.g. `RUST_LOG=loom_core=debug cargo test`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Short intervals so recovery paths run within a test's lifetime.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.poll_interval_ms = 300;
    config.scheduler.heartbeat_interval_ms = 50;
    config.scheduler.sweep_interval_ms = 100;
    config.runner.heartbeat_interval_ms = 50;
    config.lease_poller.poll_interval_ms = 100;
    config.retention.enabled = false;
    config
}

pub struct Cluster {
    pub store: Arc<InMemoryStore>,
    pub messenger: Arc<InMemoryMessenger>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            messenger: Arc::new(InMemoryMessenger::new()),
        }
    }

    /// A started engine on the shared Store / Messenger with the demo catalog.
    pub async fn engine(&self, roles: Roles, config: EngineConfig) -> Engine {
        let mut engine = catalog(EngineBuilder::new(self.store.clone(), self.messenger.clone()))
            .config(config)
            .roles(roles)
            .build()
            .expect("engine builds");
        engine.start().await.expect("engine starts");
        engine
    }
}

pub fn catalog(builder: EngineBuilder) -> EngineBuilder {
    builder
        .define_task(TaskDefinition::new("Task.Noop", TaskKind::Noop))
        .define_task(TaskDefinition::new("Task.Sleep", TaskKind::Sleep { millis: 30 }))
        .define_task(TaskDefinition::new("Task.Medium", TaskKind::Sleep { millis: 2_000 }))
        .define_task(TaskDefinition::new("Task.Long", TaskKind::Sleep { millis: 60_000 }))
        .define_task(TaskDefinition::new(
            "Task.Fail",
            TaskKind::Fail {
                reason: "expected failure".into(),
            },
        ))
        .define_graph(GraphDefinition::new(
            "Graph.Chain",
            vec![
                GraphTaskSpec::named("a", "Task.Sleep"),
                GraphTaskSpec::named("b", "Task.Noop").wait_on("a", WaitOn::Succeeded),
            ],
        ))
        .define_graph(GraphDefinition::new(
            "Graph.FailFast",
            vec![
                GraphTaskSpec::named("a", "Task.Fail"),
                GraphTaskSpec::named("b", "Task.Noop").wait_on("a", WaitOn::Succeeded),
            ],
        ))
        .define_graph(GraphDefinition::new(
            "Graph.Medium",
            vec![GraphTaskSpec::named("medium", "Task.Medium")],
        ))
        .define_graph(GraphDefinition::new(
            "Graph.Long",
            vec![GraphTaskSpec::named("long", "Task.Long")],
        ))
        .define_graph(GraphDefinition::new(
            "Graph.Wide",
            (0..8)
                .map(|i| GraphTaskSpec::named(format!("t{i}"), "Task.Sleep"))
                .collect(),
        ))
}

pub async fn next_finished(sub: &mut Subscription<GraphFinishedEvent>) -> GraphFinishedEvent {
    tokio::time::timeout(Duration::from_secs(10), sub.recv())
        .await
        .expect("graph did not finish in time")
        .expect("subscription closed")
}

pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
