// src/dag/graph.rs

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::config::model::FlowDefinition;
use crate::errors::{FlowError, Result};
use crate::types::NodeId;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct DagNode {
    /// Direct dependencies: nodes that must be built before this one.
    deps: Vec<NodeId>,
    /// Direct dependents: nodes that wait on this one.
    dependents: Vec<NodeId>,
}

/// Static adjacency of a validated flow.
///
/// Acyclicity is already checked in `config::validate`, so this only keeps
/// adjacency for ordering, partial runs and diagnostics. Parallel edges
/// between the same pair of nodes collapse into one dependency.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<NodeId, DagNode>,
    /// Node ids in definition order.
    order: Vec<NodeId>,
}

impl DagGraph {
    pub fn from_definition(def: &FlowDefinition) -> Self {
        let pairs = def.edges.iter().map(|e| (e.source.as_str(), e.target.as_str()));
        Self::from_parts(def.nodes.iter().map(|n| n.id.as_str()), pairs)
    }

    /// Build from bare ids and `(source, target)` pairs. Pairs naming
    /// unknown ids are ignored.
    pub fn from_parts<'a>(
        ids: impl IntoIterator<Item = &'a str>,
        edges: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut nodes: HashMap<NodeId, DagNode> = HashMap::new();
        let mut order = Vec::new();

        for id in ids {
            if nodes.insert(id.to_string(), DagNode::default()).is_none() {
                order.push(id.to_string());
            }
        }

        for (source, target) in edges {
            if !nodes.contains_key(source) || !nodes.contains_key(target) {
                continue;
            }
            if let Some(node) = nodes.get_mut(target) {
                if node.deps.iter().any(|d| d == source) {
                    continue;
                }
                node.deps.push(source.to_string());
            }
            if let Some(node) = nodes.get_mut(source) {
                node.dependents.push(target.to_string());
            }
        }

        Self { nodes, order }
    }

    /// All node ids, in definition order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Immediate dependencies of a node (sources of its incoming edges).
    pub fn dependencies_of(&self, id: &str) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a node (targets of its outgoing edges).
    pub fn dependents_of(&self, id: &str) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Kahn layers: layer `k` holds nodes whose longest dependency chain has
    /// length `k`. Ids are sorted within a layer.
    pub fn layers(&self) -> Vec<Vec<NodeId>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id.as_str(), n.deps.len()))
            .collect();

        let mut current: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut layers = Vec::new();
        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in self.dependents_of(id) {
                    if let Some(d) = in_degree.get_mut(dependent.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            next.insert(dependent.as_str());
                        }
                    }
                }
            }
            layers.push(current.iter().map(|s| s.to_string()).collect());
            current = next;
        }
        layers
    }

    /// Flattened [`layers`](Self::layers).
    pub fn build_order(&self) -> Vec<NodeId> {
        self.layers().into_iter().flatten().collect()
    }

    /// Every node `id` transitively depends on, excluding `id`.
    pub fn ancestors_of(&self, id: &str) -> HashSet<NodeId> {
        self.walk(id, |n| self.dependencies_of(n))
    }

    /// Every node transitively depending on `id`, excluding `id`.
    pub fn descendants_of(&self, id: &str) -> HashSet<NodeId> {
        self.walk(id, |n| self.dependents_of(n))
    }

    fn walk<'a>(&'a self, root: &str, next: impl Fn(&str) -> &'a [NodeId]) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = next(root).iter().map(|s| s.as_str()).collect();
        while let Some(id) = stack.pop() {
            if seen.insert(id.to_string()) {
                stack.extend(next(id).iter().map(|s| s.as_str()));
            }
        }
        seen
    }

    /// Nodes that take part in a partial run.
    ///
    /// - `stop`: the stop node and everything it depends on.
    /// - `start`: the start node, everything downstream of it, and every
    ///   dependency those nodes need.
    ///
    /// `stop` wins when both are given. With neither, every node runs.
    pub fn sort_up_to(&self, stop: Option<&str>, start: Option<&str>) -> Result<HashSet<NodeId>> {
        if let Some(stop) = stop {
            self.ensure_known(stop)?;
            let mut set = self.ancestors_of(stop);
            set.insert(stop.to_string());
            return Ok(set);
        }

        if let Some(start) = start {
            self.ensure_known(start)?;
            let mut downstream = self.descendants_of(start);
            downstream.insert(start.to_string());

            let mut set = downstream.clone();
            for id in &downstream {
                set.extend(self.ancestors_of(id));
            }
            return Ok(set);
        }

        Ok(self.order.iter().cloned().collect())
    }

    fn ensure_known(&self, id: &str) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(FlowError::UnknownNode(id.to_string()))
        }
    }
}
