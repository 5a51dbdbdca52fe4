//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - role（scheduler / runner）ごとのコンポーネント選択

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::app::completed_poller::CompletedTaskPoller;
use crate::app::registry::GraphRegistry;
use crate::app::runner::{RunnerStatus, TaskRunner};
use crate::app::scheduler::{SchedulerStatus, TaskScheduler};
use crate::app::service::GraphService;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{GraphDefinition, LoomError, RequestError, TaskDefinition};
use crate::ports::{IdGenerator, Messenger, SystemClock, TaskGraphStore, UlidGenerator};

/// Which long-running components this process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Roles {
    pub scheduler: bool,
    pub runner: bool,
}

impl Roles {
    pub fn all() -> Self {
        Self {
            scheduler: true,
            runner: true,
        }
    }
}

impl Default for Roles {
    fn default() -> Self {
        Self::all()
    }
}

/// EngineBuilder はエンジンを構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(store, messenger)
///     .roles(Roles::all())
///     .define_task(TaskDefinition::new("Task.Noop", TaskKind::Noop))
///     .define_graph(graph)
///     .expect_graphs(&["Graph.Example"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - 定義は build() 時にすべて検証される
/// - expect_graphs() の名前が 1 つでも未定義なら BuildError
pub struct EngineBuilder {
    store: Arc<dyn TaskGraphStore>,
    messenger: Arc<dyn Messenger>,
    config: EngineConfig,
    roles: Roles,
    tasks: Vec<TaskDefinition>,
    graphs: Vec<GraphDefinition>,
    expected_graphs: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task graphs: {0:?}. These graphs were expected but not defined.")]
    MissingGraphs(Vec<String>),

    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] RequestError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn TaskGraphStore>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            store,
            messenger,
            config: EngineConfig::default(),
            roles: Roles::default(),
            tasks: Vec::new(),
            graphs: Vec::new(),
            expected_graphs: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn roles(mut self, roles: Roles) -> Self {
        self.roles = roles;
        self
    }

    pub fn define_task(mut self, definition: TaskDefinition) -> Self {
        self.tasks.push(definition);
        self
    }

    pub fn define_graph(mut self, definition: GraphDefinition) -> Self {
        self.graphs.push(definition);
        self
    }

    /// Graph names that must be defined once `build()` runs.
    pub fn expect_graphs(mut self, names: &[&str]) -> Self {
        self.expected_graphs = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// # 検証
    /// - config の検証
    /// - task 定義 → graph 定義の順に登録（graph は task 名を参照する）
    /// - expect_graphs() の名前がすべて定義済みか
    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
        let registry = Arc::new(GraphRegistry::new());
        let service = GraphService::new(
            self.config.domain.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.messenger),
            Arc::clone(&registry),
            Arc::clone(&ids),
        );
        for task in self.tasks {
            service.define_task(task)?;
        }
        for graph in self.graphs {
            service.define_task_graph(graph)?;
        }

        if let Some(expected) = &self.expected_graphs {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| registry.graph_definition(name).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingGraphs(missing));
            }
        }

        let config = self.config;
        let scheduler = self.roles.scheduler.then(|| {
            TaskScheduler::new(
                ids.generate_scheduler_id(),
                config.domain.clone(),
                config.scheduler.clone(),
                &config.lease_poller,
                Arc::clone(&self.store),
                Arc::clone(&self.messenger),
            )
        });
        let runner = self.roles.runner.then(|| {
            TaskRunner::new(
                ids.generate_runner_id(),
                config.domain.clone(),
                config.runner.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.messenger),
            )
        });
        // retention runs next to the scheduler
        let retention = (self.roles.scheduler && config.retention.enabled).then(|| {
            CompletedTaskPoller::new(
                config.domain.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.messenger),
                config.retention.poll_interval(),
                config.retention.batch_limit,
            )
        });

        Ok(Engine {
            config,
            roles: self.roles,
            registry,
            service,
            scheduler,
            runner,
            retention,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub domain: String,
    pub roles: Roles,
    pub scheduler: Option<SchedulerStatus>,
    pub runner: Option<RunnerStatus>,
    pub active_graphs: usize,
}

/// Engine は 1 プロセス分のコンポーネント一式
pub struct Engine {
    config: EngineConfig,
    roles: Roles,
    registry: Arc<GraphRegistry>,
    service: GraphService,
    scheduler: Option<TaskScheduler>,
    runner: Option<TaskRunner>,
    retention: Option<CompletedTaskPoller>,
}

impl Engine {
    pub async fn start(&mut self) -> Result<(), LoomError> {
        self.service.start().await?;
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.start().await?;
        }
        if let Some(runner) = &mut self.runner {
            runner.start().await?;
        }
        if let Some(retention) = &mut self.retention {
            retention.start();
        }
        info!(
            domain = %self.config.domain,
            scheduler = self.roles.scheduler,
            runner = self.roles.runner,
            "engine started"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(retention) = &mut self.retention {
            retention.stop();
        }
        if let Some(runner) = &mut self.runner {
            runner.stop();
        }
        if let Some(scheduler) = &mut self.scheduler {
            scheduler.stop();
        }
        self.service.stop();
        info!(domain = %self.config.domain, "engine stopped");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GraphRegistry> {
        &self.registry
    }

    pub fn service(&self) -> &GraphService {
        &self.service
    }

    pub fn scheduler(&self) -> Option<&TaskScheduler> {
        self.scheduler.as_ref()
    }

    pub fn runner(&self) -> Option<&TaskRunner> {
        self.runner.as_ref()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            domain: self.config.domain.clone(),
            roles: self.roles,
            scheduler: self.scheduler.as_ref().map(|s| s.status()),
            runner: self.runner.as_ref().map(|r| r.status()),
            active_graphs: self
                .registry
                .active_graphs(&Default::default())
                .len(),
        }
    }
}
