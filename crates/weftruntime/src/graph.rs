//! Dependency graph derived once per workflow definition.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use weftcore::{NodeId, WorkflowDefinition, WorkflowError};

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    order: Vec<NodeId>,
}

impl DependencyGraph {
    /// Build the graph and reject cycles before anything runs.
    pub fn build(workflow: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        workflow.validate()?;

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node_spec in &workflow.nodes {
            let idx = graph.add_node(node_spec.id.clone());
            index.insert(node_spec.id.clone(), idx);
        }

        for conn in &workflow.connections {
            let from_idx = index.get(&conn.from_node)
                .ok_or_else(|| WorkflowError::NodeNotFound(conn.from_node.clone()))?;
            let to_idx = index.get(&conn.to_node)
                .ok_or_else(|| WorkflowError::NodeNotFound(conn.to_node.clone()))?;

            // Several port connections between the same pair are one dependency
            if graph.find_edge(*from_idx, *to_idx).is_none() {
                graph.add_edge(*from_idx, *to_idx, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| WorkflowError::CyclicDependency {
                node: graph[cycle.node_id()].clone(),
            })?
            .into_iter()
            .map(|idx| graph[idx].clone())
            .collect();

        Ok(Self { graph, index, order })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.index.keys()
    }

    /// Nodes not in `completed` whose every upstream dependency is.
    /// The returned order carries no meaning.
    pub fn ready_nodes(&self, completed: &HashSet<NodeId>) -> Vec<NodeId> {
        self.index
            .iter()
            .filter(|(node_id, _)| !completed.contains(*node_id))
            .filter(|(_, idx)| {
                self.graph
                    .neighbors_directed(**idx, Direction::Incoming)
                    .all(|dep| completed.contains(&self.graph[dep]))
            })
            .map(|(node_id, _)| node_id.clone())
            .collect()
    }

    /// Direct upstream nodes
    pub fn dependencies(&self, node_id: &str) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Direct downstream nodes
    pub fn dependents(&self, node_id: &str) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    /// Every node reachable downstream of `node_id`, excluding itself
    pub fn descendants(&self, node_id: &str) -> Vec<NodeId> {
        let Some(&start) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                found.push(self.graph[idx].clone());
            }
        }
        found
    }

    /// Nodes with no upstream dependency; they receive the run payload
    pub fn roots(&self) -> Vec<NodeId> {
        self.externals(Direction::Incoming)
    }

    /// Nodes with no downstream dependents
    pub fn terminals(&self) -> Vec<NodeId> {
        self.externals(Direction::Outgoing)
    }

    pub fn is_root(&self, node_id: &str) -> bool {
        self.index
            .get(node_id)
            .map(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .unwrap_or(false)
    }

    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes grouped by their longest distance from a root. Every node in a
    /// layer depends only on nodes in earlier layers.
    pub fn layers(&self) -> Vec<Vec<NodeId>> {
        let mut depth: HashMap<&NodeId, usize> = HashMap::new();
        for node_id in &self.order {
            let level = self
                .dependencies(node_id)
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node_id, level);
        }

        let max_level = depth.values().copied().max().unwrap_or(0);
        let mut layers = vec![Vec::new(); if depth.is_empty() { 0 } else { max_level + 1 }];
        for node_id in &self.order {
            layers[depth[node_id]].push(node_id.clone());
        }
        for layer in &mut layers {
            layer.sort();
        }
        layers
    }

    fn neighbors(&self, node_id: &str, direction: Direction) -> Vec<NodeId> {
        match self.index.get(node_id) {
            Some(idx) => self
                .graph
                .neighbors_directed(*idx, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn externals(&self, direction: Direction) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .graph
            .externals(direction)
            .map(|idx| self.graph[idx].clone())
            .collect();
        ids.sort();
        ids
    }
}
