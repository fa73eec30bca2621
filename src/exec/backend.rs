// src/exec/backend.rs

//! The build contract between the engine and node kinds.
//!
//! The engine never interprets what a node computes. Every node kind
//! implements [`NodeLogic`]: one `build` entry point receiving a
//! [`BuildContext`] with references already resolved, returning a
//! [`NodeOutput`]. Kinds are looked up by tag in a [`NodeRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::RuntimeValue;
use crate::config::model::NodeDefinition;
use crate::errors::{FlowError, Result};
use crate::pause::PauseRegistry;
use crate::types::{FieldSpec, NodeId, OutputMap, RunId};

pub type BuildFuture<'a> = Pin<Box<dyn Future<Output = Result<NodeOutput>> + Send + 'a>>;

/// Compute logic of one node kind.
pub trait NodeLogic: Send + Sync {
    fn build(&self, ctx: BuildContext) -> BuildFuture<'_>;

    /// Declared config schema, checked when a graph is constructed.
    fn fields(&self) -> &[FieldSpec] {
        &[]
    }
}

/// What a node build produced.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    /// Named outputs other nodes can reference or receive over edges.
    pub values: OutputMap,
    pub artifacts: BTreeMap<String, RuntimeValue>,
    /// Executable object built by the node. Only cached in normalized form.
    pub built_object: Option<RuntimeValue>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_artifact(mut self, name: impl Into<String>, value: RuntimeValue) -> Self {
        self.artifacts.insert(name.into(), value);
        self
    }

    pub fn with_built_object(mut self, value: RuntimeValue) -> Self {
        self.built_object = Some(value);
        self
    }
}

/// Everything a node build may look at.
#[derive(Clone)]
pub struct BuildContext {
    pub node_id: NodeId,
    pub slug: String,
    pub run_id: RunId,
    /// Node config with every reference substituted.
    pub config: BTreeMap<String, Value>,
    /// Values delivered over incoming edges, keyed by target input name.
    pub inputs: BTreeMap<String, Value>,
    pub run_inputs: Arc<BTreeMap<String, Value>>,
    cancel: CancellationToken,
    pause: Arc<PauseRegistry>,
    pause_timeout: Duration,
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("node_id", &self.node_id)
            .field("slug", &self.slug)
            .field("run_id", &self.run_id)
            .field("config", &self.config)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

impl BuildContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<NodeId>,
        slug: impl Into<String>,
        run_id: impl Into<RunId>,
        config: BTreeMap<String, Value>,
        inputs: BTreeMap<String, Value>,
        run_inputs: Arc<BTreeMap<String, Value>>,
        cancel: CancellationToken,
        pause: Arc<PauseRegistry>,
        pause_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            slug: slug.into(),
            run_id: run_id.into(),
            config,
            inputs,
            run_inputs,
            cancel,
            pause,
            pause_timeout,
        }
    }

    pub fn config(&self, name: &str) -> Option<&Value> {
        self.config.get(name)
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn run_input(&self, name: &str) -> Option<&Value> {
        self.run_inputs.get(name)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for external data for this run, up to the engine's pause timeout.
    pub async fn pause(&self) -> Result<Value> {
        self.pause_for(self.pause_timeout).await
    }

    pub async fn pause_for(&self, timeout: Duration) -> Result<Value> {
        self.pause.wait(&self.run_id, timeout).await
    }

    /// Node-scoped build failure.
    pub fn fail(&self, message: impl fmt::Display) -> FlowError {
        FlowError::node_build(&self.node_id, message)
    }
}

/// Kind tag -> node logic.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    kinds: HashMap<String, Arc<dyn NodeLogic>>,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("NodeRegistry").field("kinds", &kinds).finish()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, logic: impl NodeLogic + 'static) -> &mut Self {
        self.register_arc(kind, Arc::new(logic))
    }

    pub fn register_arc(&mut self, kind: impl Into<String>, logic: Arc<dyn NodeLogic>) -> &mut Self {
        self.kinds.insert(kind.into(), logic);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeLogic>> {
        self.kinds.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Check a node's kind is registered and its config fits the kind's
    /// declared fields.
    pub fn validate(&self, node: &NodeDefinition) -> Result<()> {
        let logic = self.kinds.get(&node.kind).ok_or_else(|| {
            FlowError::Config(format!(
                "node '{}' has unregistered kind '{}'",
                node.id, node.kind
            ))
        })?;

        for spec in logic.fields() {
            match node.config.get(spec.name) {
                None if spec.required => {
                    return Err(FlowError::Config(format!(
                        "node '{}' is missing required field '{}'",
                        node.id, spec.name
                    )));
                }
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(FlowError::Config(format!(
                        "node '{}' field '{}' expects {:?}, got {:?}",
                        node.id,
                        spec.name,
                        spec.kind,
                        value.kind()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
