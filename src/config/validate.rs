// src/config/validate.rs

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{FlowDefinition, RawFlowDefinition};
use crate::errors::{FlowError, Result};
use crate::reference::SlugTable;

impl TryFrom<RawFlowDefinition> for FlowDefinition {
    type Error = FlowError;

    fn try_from(raw: RawFlowDefinition) -> std::result::Result<Self, Self::Error> {
        validate_raw_definition(&raw)?;
        let slugs = assign_slugs(&raw);
        Ok(FlowDefinition::new_unchecked(raw, slugs))
    }
}

fn validate_raw_definition(def: &RawFlowDefinition) -> Result<()> {
    ensure_has_nodes(def)?;
    validate_engine_config(def)?;
    validate_node_ids(def)?;
    validate_edges(def)?;
    validate_dag(def)?;
    Ok(())
}

fn ensure_has_nodes(def: &RawFlowDefinition) -> Result<()> {
    if def.nodes.is_empty() {
        return Err(FlowError::Config(
            "flow must contain at least one [[nodes]] entry".to_string(),
        ));
    }
    Ok(())
}

fn validate_engine_config(def: &RawFlowDefinition) -> Result<()> {
    if def.engine.task_log_capacity == 0 {
        return Err(FlowError::Config(
            "[engine].task_log_capacity must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_node_ids(def: &RawFlowDefinition) -> Result<()> {
    let mut seen = HashSet::new();
    for node in &def.nodes {
        if node.id.trim().is_empty() {
            return Err(FlowError::Config("node id must not be empty".to_string()));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(FlowError::DuplicateNode(node.id.clone()));
        }
    }
    Ok(())
}

fn validate_edges(def: &RawFlowDefinition) -> Result<()> {
    for edge in &def.edges {
        let source = def
            .nodes
            .iter()
            .find(|n| n.id == edge.source)
            .ok_or_else(|| FlowError::UnknownNode(edge.source.clone()))?;
        let target = def
            .nodes
            .iter()
            .find(|n| n.id == edge.target)
            .ok_or_else(|| FlowError::UnknownNode(edge.target.clone()))?;

        if edge.source == edge.target {
            return Err(FlowError::Config(format!(
                "node '{}' cannot depend on itself",
                edge.source
            )));
        }

        if let Some(input) = &edge.target_input {
            if !target.inputs.contains(input) {
                return Err(FlowError::UnknownInput {
                    source_id: edge.source.clone(),
                    target_id: edge.target.clone(),
                    input: input.clone(),
                });
            }
        }

        if let Some(output) = &edge.source_output {
            if !source.outputs.is_empty() && !source.outputs.contains(output) {
                return Err(FlowError::Config(format!(
                    "edge {} -> {} reads undeclared output '{}'",
                    edge.source, edge.target, output
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(def: &RawFlowDefinition) -> Result<()> {
    // Edge direction: source -> target.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for node in &def.nodes {
        graph.add_node(node.id.as_str());
    }
    for edge in &def.edges {
        graph.add_edge(edge.source.as_str(), edge.target.as_str(), ());
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(FlowError::DagCycle(format!(
            "cycle detected in flow graph involving node '{}'",
            cycle.node_id()
        ))),
    }
}

/// Slugs are assigned in definition order, so collisions resolve the same
/// way on every load.
fn assign_slugs(def: &RawFlowDefinition) -> SlugTable {
    let mut table = SlugTable::new();
    for node in &def.nodes {
        table.assign(&node.id, node.label());
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{EdgeDefinition, EngineConfig, NodeDefinition};

    fn node(id: &str, label: &str) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            kind: "static".to_string(),
            display_name: Some(label.to_string()),
            config: Default::default(),
            inputs: vec!["in".to_string()],
            outputs: vec!["out".to_string()],
            frozen: false,
        }
    }

    fn edge(source: &str, target: &str) -> EdgeDefinition {
        EdgeDefinition {
            source: source.to_string(),
            target: target.to_string(),
            source_output: None,
            target_input: None,
        }
    }

    fn raw(nodes: Vec<NodeDefinition>, edges: Vec<EdgeDefinition>) -> RawFlowDefinition {
        RawFlowDefinition {
            id: "flow".to_string(),
            name: None,
            nodes,
            edges,
            viewport: None,
            engine: EngineConfig::default(),
        }
    }

    #[test]
    fn empty_flow_is_rejected() {
        let err = FlowDefinition::try_from(raw(vec![], vec![])).unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err =
            FlowDefinition::try_from(raw(vec![node("a", "A"), node("a", "B")], vec![])).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn unknown_target_input_is_rejected() {
        let mut e = edge("a", "b");
        e.target_input = Some("prompt".to_string());
        let err = FlowDefinition::try_from(raw(vec![node("a", "A"), node("b", "B")], vec![e]))
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownInput { ref input, .. } if input == "prompt"));
        assert_eq!(err.node_id(), Some("b"));
    }

    #[test]
    fn static_cycle_is_rejected() {
        let err = FlowDefinition::try_from(raw(
            vec![node("a", "A"), node("b", "B"), node("c", "C")],
            vec![edge("a", "b"), edge("b", "c"), edge("c", "a")],
        ))
        .unwrap_err();
        assert!(matches!(err, FlowError::DagCycle(_)));
    }

    #[test]
    fn slugs_are_unique_after_load() {
        let def = FlowDefinition::try_from(raw(
            vec![node("a", "Fetch"), node("b", "Fetch"), node("c", "")],
            vec![edge("a", "b")],
        ))
        .unwrap();
        assert_eq!(def.slugs().slug_for("a"), Some("Fetch"));
        assert_eq!(def.slugs().slug_for("b"), Some("Fetch2"));
        assert_eq!(def.slugs().slug_for("c"), Some("Node"));
    }
}
