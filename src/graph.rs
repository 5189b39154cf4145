//! Dependency graph construction
//!
//! Starting from a target, each task's parameter names are resolved against the
//! registry and the reachable providers and tasks are collected into a petgraph
//! DAG. Cycles are reported with their full path before anything executes.

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

use crate::error::{MasonError, Result};
use crate::registry::{Entry, Registry};

/// Whether a node is a provider or a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Provider,
    Task,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Provider => "provider",
            NodeKind::Task => "task",
        }
    }
}

/// A node in the dependency graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub kind: NodeKind,
}

/// The resolved DAG for one invocation
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Edges go from a dependency to its consumer
    graph: DiGraph<GraphNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    target: String,
}

impl DependencyGraph {
    /// Build the graph of everything `target` needs
    pub fn build(registry: &Registry, target: &str) -> Result<Self> {
        if registry.task(target).is_none() {
            return Err(MasonError::TaskNotFound {
                name: target.to_string(),
                available: registry.task_names(),
            });
        }

        let mut graph = Self {
            graph: DiGraph::new(),
            name_to_index: HashMap::new(),
            target: target.to_string(),
        };
        graph.extend(registry, target)?;
        Ok(graph)
    }

    /// Add `name` and everything it depends on, reusing nodes already present
    pub fn extend(&mut self, registry: &Registry, name: &str) -> Result<NodeIndex> {
        let mut visiting = Vec::new();
        self.visit(registry, name, None, &mut visiting)
    }

    fn visit(
        &mut self,
        registry: &Registry,
        name: &str,
        consumer: Option<&str>,
        visiting: &mut Vec<String>,
    ) -> Result<NodeIndex> {
        if let Some(&idx) = self.name_to_index.get(name) {
            return Ok(idx);
        }

        if let Some(pos) = visiting.iter().position(|n| n == name) {
            let mut cycle: Vec<&str> = visiting[pos..].iter().map(String::as_str).collect();
            cycle.push(name);
            return Err(MasonError::CyclicDependency {
                cycle: cycle.join(" -> "),
            });
        }

        let entry = registry.lookup(name).ok_or_else(|| match consumer {
            Some(task) => MasonError::UnknownDependency {
                task: task.to_string(),
                name: name.to_string(),
            },
            None => MasonError::TaskNotFound {
                name: name.to_string(),
                available: registry.task_names(),
            },
        })?;

        let (kind, params) = match entry {
            Entry::Provider(_) => (NodeKind::Provider, Vec::new()),
            Entry::Task(task) => (NodeKind::Task, task.params.clone()),
        };

        visiting.push(name.to_string());
        let mut deps = Vec::with_capacity(params.len());
        for param in &params {
            deps.push(self.visit(registry, param, Some(name), visiting)?);
        }
        visiting.pop();

        let idx = self.graph.add_node(GraphNode {
            name: name.to_string(),
            kind,
        });
        self.name_to_index.insert(name.to_string(), idx);

        for dep in deps {
            // A parameter listed twice still makes one edge
            if !self.graph.contains_edge(dep, idx) {
                self.graph.add_edge(dep, idx, ());
            }
        }

        Ok(idx)
    }

    /// Record a dependency discovered while `consumer` was running
    pub(crate) fn add_dynamic_edge(&mut self, dependency: NodeIndex, consumer: NodeIndex) -> Result<()> {
        if dependency == consumer || has_path_connecting(&self.graph, consumer, dependency, None) {
            return Err(MasonError::CyclicDependency {
                cycle: format!(
                    "{} -> {} -> {}",
                    self.graph[consumer].name, self.graph[dependency].name, self.graph[consumer].name
                ),
            });
        }

        if !self.graph.contains_edge(dependency, consumer) {
            self.graph.add_edge(dependency, consumer, ());
        }
        Ok(())
    }

    /// All nodes with dependencies before their consumers
    pub fn execution_order(&self) -> Vec<&GraphNode> {
        // Construction never adds a cycle, so the sort cannot fail
        toposort(&self.graph, None)
            .map(|sorted| sorted.into_iter().map(|idx| &self.graph[idx]).collect())
            .unwrap_or_default()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.name_to_index.get(name).map(|&idx| &self.graph[idx])
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|n| n.name.as_str())
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, name: &str) -> Option<Vec<&str>> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Nodes that consume the given node directly
    pub fn dependents(&self, name: &str) -> Option<Vec<&str>> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Option<Vec<&str>> {
        self.name_to_index.get(name).map(|&idx| {
            let mut names: Vec<&str> = self
                .graph
                .neighbors_directed(idx, direction)
                .map(|n| self.graph[n].name.as_str())
                .collect();
            names.sort_unstable();
            names
        })
    }

    pub(crate) fn index(&self, name: &str) -> Option<NodeIndex> {
        self.name_to_index.get(name).copied()
    }

    pub(crate) fn node(&self, idx: NodeIndex) -> &GraphNode {
        &self.graph[idx]
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub(crate) fn incoming(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Incoming)
    }

    pub(crate) fn outgoing(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Outgoing)
    }
}
