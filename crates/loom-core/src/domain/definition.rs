//! Task and graph definitions (the catalog clients run graphs from).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::dependency::DependencyGraph;
use super::errors::DefinitionError;
use super::state::{TaskState, WaitOn};
use super::task::TaskKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub injectable_name: String,
    #[serde(default)]
    pub friendly_name: String,
    pub kind: TaskKind,
    #[serde(default = "TaskState::default_terminal")]
    pub terminal_on_states: Vec<TaskState>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskDefinition {
    pub fn new(injectable_name: impl Into<String>, kind: TaskKind) -> Self {
        let injectable_name = injectable_name.into();
        Self {
            friendly_name: injectable_name.clone(),
            injectable_name,
            kind,
            terminal_on_states: TaskState::default_terminal(),
            timeout_ms: None,
        }
    }

    pub fn with_terminal_on_states(mut self, states: Vec<TaskState>) -> Self {
        self.terminal_on_states = states;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.injectable_name.trim().is_empty() {
            return Err(DefinitionError::MissingName);
        }
        if self.terminal_on_states.iter().any(|s| !s.is_finished()) {
            return Err(DefinitionError::InvalidTerminalStates(
                self.injectable_name.clone(),
            ));
        }
        Ok(())
    }
}

/// One node of a graph definition.
///
/// Exactly one of `task_name` (catalog reference) or `task_definition`
/// (inline) must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphTaskSpec {
    pub label: String,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub task_definition: Option<TaskDefinition>,
    #[serde(default)]
    pub wait_on: BTreeMap<String, WaitOn>,
}

impl GraphTaskSpec {
    pub fn named(label: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            task_name: Some(task_name.into()),
            task_definition: None,
            wait_on: BTreeMap::new(),
        }
    }

    pub fn inline(label: impl Into<String>, definition: TaskDefinition) -> Self {
        Self {
            label: label.into(),
            task_name: None,
            task_definition: Some(definition),
            wait_on: BTreeMap::new(),
        }
    }

    pub fn wait_on(mut self, upstream: impl Into<String>, condition: WaitOn) -> Self {
        self.wait_on.insert(upstream.into(), condition);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinition {
    pub injectable_name: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub options: serde_json::Value,
    pub tasks: Vec<GraphTaskSpec>,
}

impl GraphDefinition {
    pub fn new(injectable_name: impl Into<String>, tasks: Vec<GraphTaskSpec>) -> Self {
        let injectable_name = injectable_name.into();
        Self {
            friendly_name: injectable_name.clone(),
            injectable_name,
            options: serde_json::Value::Null,
            tasks,
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.injectable_name == name || self.friendly_name == name
    }

    /// Structural validation: names, labels, wait-on references, acyclicity.
    ///
    /// Catalog references (`task_name`) are resolved when the graph is run.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.injectable_name.trim().is_empty() {
            return Err(DefinitionError::MissingName);
        }
        if self.tasks.is_empty() {
            return Err(DefinitionError::EmptyGraph(self.injectable_name.clone()));
        }

        let mut labels = BTreeSet::new();
        for task in &self.tasks {
            if !labels.insert(task.label.as_str()) {
                return Err(DefinitionError::DuplicateLabel(task.label.clone()));
            }
            match (&task.task_name, &task.task_definition) {
                (Some(_), None) => {}
                (None, Some(def)) => def.validate()?,
                _ => return Err(DefinitionError::AmbiguousTask(task.label.clone())),
            }
        }

        let mut dependencies = DependencyGraph::new();
        for task in &self.tasks {
            dependencies.add_node(task.label.as_str());
            for upstream in task.wait_on.keys() {
                if !labels.contains(upstream.as_str()) {
                    return Err(DefinitionError::UnknownWaitOn {
                        label: task.label.clone(),
                        upstream: upstream.clone(),
                    });
                }
                dependencies.add_dependency(task.label.as_str(), upstream.as_str());
            }
        }
        if let Some(cycle) = dependencies.detect_cycle() {
            return Err(DefinitionError::Cycle(
                cycle.into_iter().map(str::to_string).collect(),
            ));
        }
        Ok(())
    }
}
