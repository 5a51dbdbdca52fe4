//! GraphRegistry - 定義カタログと active graph の索引
//!
//! Owned by the engine and shared by reference. Lookups are synchronous;
//! writes take the lock exclusively. The Store stays the source of truth for
//! graph state; the active-graph index here is a local view used to answer
//! client queries and to reject a second run against a busy target early.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    DefinitionError, GraphDefinition, GraphId, GraphRecord, GraphStatus, TaskDefinition,
};

/// Selects active graphs. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFilter {
    #[serde(default)]
    pub graph_id: Option<GraphId>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl GraphFilter {
    pub fn by_id(graph_id: GraphId) -> Self {
        Self {
            graph_id: Some(graph_id),
            ..Self::default()
        }
    }

    pub fn by_target(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, graph: &ActiveGraph) -> bool {
        self.graph_id.is_none_or(|id| id == graph.graph_id)
            && self
                .target
                .as_ref()
                .is_none_or(|t| graph.target.as_ref() == Some(t))
            && self.name.as_ref().is_none_or(|n| *n == graph.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveGraph {
    pub graph_id: GraphId,
    pub name: String,
    pub domain: String,
    pub target: Option<String>,
    pub status: GraphStatus,
    pub options: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<&GraphRecord> for ActiveGraph {
    fn from(record: &GraphRecord) -> Self {
        Self {
            graph_id: record.graph_id,
            name: record.name.clone(),
            domain: record.domain.clone(),
            target: record.target.clone(),
            status: record.status,
            options: record.options.clone(),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStatusView {
    pub graph_id: GraphId,
    pub name: String,
    pub target: Option<String>,
    pub status: GraphStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct GraphRegistry {
    tasks: RwLock<BTreeMap<String, TaskDefinition>>,
    graphs: RwLock<BTreeMap<String, GraphDefinition>>,
    active: RwLock<HashMap<GraphId, ActiveGraph>>,
}

fn task_matches(definition: &TaskDefinition, name: &str) -> bool {
    definition.injectable_name == name || definition.friendly_name == name
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- catalogs ----

    /// Validate and store a task definition. A definition with the same
    /// injectable name is replaced.
    pub fn register_task(&self, definition: TaskDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.injectable_name.clone(), definition);
        Ok(())
    }

    pub fn register_graph(&self, definition: GraphDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.injectable_name.clone(), definition);
        Ok(())
    }

    pub fn task_catalog(&self, name: Option<&str>) -> Vec<TaskDefinition> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|d| name.is_none_or(|n| task_matches(d, n)))
            .cloned()
            .collect()
    }

    pub fn graph_catalog(&self, name: Option<&str>) -> Vec<GraphDefinition> {
        self.graphs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|d| name.is_none_or(|n| d.matches_name(n)))
            .cloned()
            .collect()
    }

    pub fn task_definition(&self, name: &str) -> Option<TaskDefinition> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|d| task_matches(d, name))
            .cloned()
    }

    pub fn graph_definition(&self, name: &str) -> Option<GraphDefinition> {
        self.graphs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|d| d.matches_name(name))
            .cloned()
    }

    pub fn graph_names(&self) -> Vec<String> {
        self.graphs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    // ---- active graphs ----

    pub fn put_active(&self, graph: ActiveGraph) {
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(graph.graph_id, graph);
    }

    pub fn active_graph(&self, filter: &GraphFilter) -> Option<ActiveGraph> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        match filter.graph_id {
            Some(graph_id) => active.get(&graph_id).filter(|g| filter.matches(g)).cloned(),
            None => active
                .values()
                .filter(|g| filter.matches(g))
                .min_by_key(|g| (g.created_at, g.graph_id))
                .cloned(),
        }
    }

    /// Matching active graphs, oldest first.
    pub fn active_graphs(&self, filter: &GraphFilter) -> Vec<ActiveGraph> {
        let mut graphs: Vec<ActiveGraph> = self
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|g| filter.matches(g))
            .cloned()
            .collect();
        graphs.sort_by_key(|g| (g.created_at, g.graph_id));
        graphs
    }

    pub fn has_active_for_target(&self, target: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|g| !g.status.is_terminal() && g.target.as_deref() == Some(target))
    }

    /// Returns false when the graph is not in the index.
    pub fn update_status(&self, graph_id: GraphId, status: GraphStatus) -> bool {
        match self
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&graph_id)
        {
            Some(graph) => {
                graph.status = status;
                true
            }
            None => false,
        }
    }

    pub fn remove_active(&self, graph_id: GraphId) -> Option<ActiveGraph> {
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&graph_id)
    }

    pub fn status(&self, graph_id: GraphId) -> Option<GraphStatusView> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&graph_id)
            .map(|g| GraphStatusView {
                graph_id: g.graph_id,
                name: g.name.clone(),
                target: g.target.clone(),
                status: g.status,
                created_at: g.created_at,
            })
    }
}
