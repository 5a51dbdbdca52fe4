//! Dependency graph used to validate graph definitions.
//!
//! Edges point from a task to the tasks it waits for.

use std::collections::{BTreeMap, BTreeSet};

/// Dependency graph keyed by any ordered node type.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K: Ord + Clone> {
    edges: BTreeMap<K, BTreeSet<K>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl<K: Ord + Clone> DependencyGraph<K> {
    pub fn new() -> Self {
        Self {
            edges: BTreeMap::new(),
        }
    }

    /// Register a node without dependencies.
    pub fn add_node(&mut self, task: K) {
        self.edges.entry(task).or_default();
    }

    /// `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: K, depends_on: K) {
        self.edges
            .entry(task.clone())
            .or_default()
            .insert(depends_on.clone());
        self.edges.entry(depends_on).or_default();
    }

    pub fn get_dependencies(&self, task: &K) -> Vec<K> {
        self.edges
            .get(task)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Detect a cycle with a three-color DFS.
    ///
    /// Returns the nodes of the first cycle found (first node repeated at the
    /// end), or `None` if the graph is a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<K>> {
        let mut colors: BTreeMap<K, Color> = self
            .edges
            .keys()
            .map(|k| (k.clone(), Color::White))
            .collect();
        let mut path = Vec::new();

        for start in self.edges.keys() {
            if colors.get(start) == Some(&Color::White)
                && let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: &K,
        colors: &mut BTreeMap<K, Color>,
        path: &mut Vec<K>,
    ) -> Option<Vec<K>> {
        colors.insert(node.clone(), Color::Gray);
        path.push(node.clone());

        for dep in self.get_dependencies(node) {
            match colors.get(&dep).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<K> = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.dfs_cycle(&dep, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        colors.insert(node.clone(), Color::Black);
        path.pop();
        None
    }
}

impl<K: Ord + Clone> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self::new()
    }
}
