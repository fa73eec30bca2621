#![allow(dead_code)]

use flowdag::config::{EdgeDefinition, EngineConfig, FlowDefinition, NodeDefinition, RawFlowDefinition};
use flowdag::types::FieldValue;

/// Builder for `FlowDefinition` to simplify test setup.
pub struct FlowDefinitionBuilder {
    raw: RawFlowDefinition,
}

impl FlowDefinitionBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            raw: RawFlowDefinition {
                id: id.to_string(),
                name: None,
                nodes: vec![],
                edges: vec![],
                viewport: None,
                engine: EngineConfig::default(),
            },
        }
    }

    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.raw.nodes.push(node);
        self
    }

    /// Ordering-only edge: no value is delivered.
    pub fn with_edge(mut self, source: &str, target: &str) -> Self {
        self.raw.edges.push(EdgeDefinition {
            source: source.to_string(),
            target: target.to_string(),
            source_output: None,
            target_input: None,
        });
        self
    }

    /// Edge delivering `source.output` into `target.input`.
    pub fn with_value_edge(mut self, source: &str, output: &str, target: &str, input: &str) -> Self {
        self.raw.edges.push(EdgeDefinition {
            source: source.to_string(),
            target: target.to_string(),
            source_output: Some(output.to_string()),
            target_input: Some(input.to_string()),
        });
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.raw.engine = engine;
        self
    }

    pub fn build_raw(self) -> RawFlowDefinition {
        self.raw
    }

    pub fn build(self) -> FlowDefinition {
        FlowDefinition::try_from(self.raw).expect("Failed to build valid flow from builder")
    }
}

/// Builder for `NodeDefinition`.
pub struct NodeBuilder {
    node: NodeDefinition,
}

impl NodeBuilder {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            node: NodeDefinition {
                id: id.to_string(),
                kind: kind.to_string(),
                display_name: None,
                config: Default::default(),
                inputs: vec![],
                outputs: vec![],
                frozen: false,
            },
        }
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.node.display_name = Some(name.to_string());
        self
    }

    pub fn config(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.node.config.insert(key.to_string(), value.into());
        self
    }

    pub fn input(mut self, name: &str) -> Self {
        self.node.inputs.push(name.to_string());
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.node.outputs.push(name.to_string());
        self
    }

    pub fn frozen(mut self) -> Self {
        self.node.frozen = true;
        self
    }

    pub fn build(self) -> NodeDefinition {
        self.node
    }
}
