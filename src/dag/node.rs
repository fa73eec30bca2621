// src/dag/node.rs

//! Nodes, edges and the per-run build state machine.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::model::{EdgeDefinition, NodeDefinition};
use crate::errors::{FlowError, Result};
use crate::types::{FieldValue, NodeId};

/// Build state of a node within one run.
///
/// `Pending -> Building -> {Built, Errored}`. Both outcomes are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    Building,
    Built,
    Errored,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Built | NodeState::Errored)
    }

    pub fn can_transition_to(self, next: NodeState) -> bool {
        matches!(
            (self, next),
            (NodeState::Pending, NodeState::Building)
                | (NodeState::Building, NodeState::Built)
                | (NodeState::Building, NodeState::Errored)
                // Failures found before the build starts (bad reference,
                // errored dynamic dependency).
                | (NodeState::Pending, NodeState::Errored)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Building => "building",
            NodeState::Built => "built",
            NodeState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// One unit of work in a run.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: String,
    pub display_name: String,
    pub slug: String,
    pub config: BTreeMap<String, FieldValue>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub frozen: bool,
    state: NodeState,
}

impl Node {
    pub fn from_definition(def: &NodeDefinition, slug: impl Into<String>) -> Self {
        Self {
            id: def.id.clone(),
            kind: def.kind.clone(),
            display_name: def.label().to_string(),
            slug: slug.into(),
            config: def.config.clone(),
            inputs: def.inputs.clone(),
            outputs: def.outputs.clone(),
            frozen: def.frozen,
            state: NodeState::Pending,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: NodeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(FlowError::node_build(
                &self.id,
                format!("illegal state transition {} -> {}", self.state, next),
            ));
        }
        self.state = next;
        Ok(())
    }
}

/// Static dependency between two nodes, optionally wiring one output into
/// one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub source_output: Option<String>,
    pub target_input: Option<String>,
}

impl Edge {
    /// Whether this edge delivers a value, rather than only ordering.
    pub fn carries_value(&self) -> bool {
        self.target_input.is_some()
    }
}

impl From<&EdgeDefinition> for Edge {
    fn from(def: &EdgeDefinition) -> Self {
        Self {
            source: def.source.clone(),
            target: def.target.clone(),
            source_output: def.source_output.clone(),
            target_input: def.target_input.clone(),
        }
    }
}
