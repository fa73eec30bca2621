// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::reference::SlugTable;
use crate::types::{FieldValue, NodeId};

/// Flow definition exactly as read from disk, before any validation.
///
/// ```toml
/// id = "summarize"
///
/// [engine]
/// max_concurrent_nodes = 4
///
/// [[nodes]]
/// id = "fetch"
/// kind = "http"
/// display_name = "Fetch"
/// outputs = ["body"]
/// config = { url = "https://example.com" }
///
/// [[nodes]]
/// id = "llm"
/// kind = "llm"
/// inputs = ["context"]
/// config = { prompt = "Summarize: @Fetch.body.text" }
///
/// [[edges]]
/// source = "fetch"
/// target = "llm"
/// source_output = "body"
/// target_input = "context"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawFlowDefinition {
    /// Flow id; scopes the cache entries of frozen nodes.
    #[serde(default = "default_flow_id")]
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,

    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,

    /// UI layout block; never interpreted.
    #[serde(default)]
    pub viewport: Option<Value>,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_flow_id() -> String {
    "flow".to_string()
}

/// One `[[nodes]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,

    /// Tag selecting the registered node logic.
    pub kind: String,

    /// Human label the node's slug is derived from. Falls back to `kind`.
    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub config: BTreeMap<String, FieldValue>,

    /// Declared input names edges may target.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Declared output names.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Serve this node from the flow-scoped cache when possible.
    #[serde(default)]
    pub frozen: bool,
}

impl NodeDefinition {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.kind)
    }
}

/// One `[[edges]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EdgeDefinition {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub source_output: Option<String>,
    #[serde(default)]
    pub target_input: Option<String>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on node builds in flight at once.
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,

    #[serde(default = "default_pause_timeout_secs")]
    pub pause_timeout_secs: u64,

    /// How long a run may go without any build completing.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,

    /// Transactions kept per node id in the task log.
    #[serde(default = "default_task_log_capacity")]
    pub task_log_capacity: usize,

    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
}

fn default_max_concurrent_nodes() -> usize {
    16
}

fn default_pause_timeout_secs() -> u64 {
    3600
}

fn default_liveness_timeout_secs() -> u64 {
    600
}

fn default_task_log_capacity() -> usize {
    3
}

fn default_cache_enabled() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            pause_timeout_secs: default_pause_timeout_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            task_log_capacity: default_task_log_capacity(),
            cache_enabled: default_cache_enabled(),
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by `FLOWDAG_*` environment variables when set
    /// and parseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_concurrent_nodes: env_or("FLOWDAG_MAX_CONCURRENT_NODES", defaults.max_concurrent_nodes),
            pause_timeout_secs: env_or("FLOWDAG_PAUSE_TIMEOUT_SECS", defaults.pause_timeout_secs),
            liveness_timeout_secs: env_or(
                "FLOWDAG_LIVENESS_TIMEOUT_SECS",
                defaults.liveness_timeout_secs,
            ),
            task_log_capacity: env_or("FLOWDAG_TASK_LOG_CAPACITY", defaults.task_log_capacity),
            cache_enabled: defaults.cache_enabled,
        }
    }

    pub fn with_max_concurrent_nodes(mut self, max: usize) -> Self {
        self.max_concurrent_nodes = max.max(1);
        self
    }

    pub fn with_pause_timeout(mut self, timeout: Duration) -> Self {
        self.pause_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_secs = timeout.as_secs();
        self
    }

    /// Effective fan-out limit (never zero).
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_nodes.max(1)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_secs(self.pause_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

/// A validated flow definition.
///
/// Only obtainable through `TryFrom<RawFlowDefinition>`, so holding one
/// means the node ids are unique, every edge points at known nodes and
/// declared inputs, and the static graph is acyclic.
#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub id: String,
    pub name: Option<String>,
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<EdgeDefinition>,
    pub viewport: Option<Value>,
    pub engine: EngineConfig,
    slugs: SlugTable,
}

impl FlowDefinition {
    pub(crate) fn new_unchecked(raw: RawFlowDefinition, slugs: SlugTable) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            nodes: raw.nodes,
            edges: raw.edges,
            viewport: raw.viewport,
            engine: raw.engine,
            slugs,
        }
    }

    pub fn slugs(&self) -> &SlugTable {
        &self.slugs
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
