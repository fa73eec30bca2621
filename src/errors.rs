// src/errors.rs

//! Crate-wide error types.
//!
//! Every error that reaches a caller can report an [`ErrorKind`] and, when it
//! is scoped to one node, the id of that node.

use thiserror::Error;

use crate::types::NodeId;

/// Coarse classification used by callers to decide whether to continue a
/// run, retry, or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed graph, static cycle, unknown node/input. Fatal before any
    /// node runs.
    Load,
    /// Unknown slug/output or an unwalkable path segment.
    Reference,
    /// Failure raised by a node's compute logic (or an upstream failure
    /// blocking it).
    NodeBuild,
    /// Normalization or cache write failure.
    Cache,
    /// Pause/Resume timeout, cancellation or missing waiter.
    Pause,
    /// The run was cancelled by its owner.
    Cancelled,
    /// The scheduler made no progress (deadlock or hung build).
    Liveness,
    /// Filesystem errors while loading a definition.
    Io,
}

/// Errors raised while parsing or resolving an `@Slug.output.path` reference.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("no node with slug '{slug}'")]
    UnknownSlug { slug: String },

    #[error("node '{slug}' has no output named '{output}'")]
    UnknownOutput { slug: String, output: String },

    #[error("cannot walk segment '{segment}' of reference '{reference}'")]
    BadPath { reference: String, segment: String },

    #[error("node '{slug}' has not been built yet")]
    NotBuilt { slug: String },
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cycle detected in flow graph: {0}")]
    DagCycle(String),

    #[error("Node not found: {0}")]
    UnknownNode(NodeId),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Edge {source_id} -> {target_id} targets undeclared input '{input}'")]
    UnknownInput {
        source_id: NodeId,
        target_id: NodeId,
        input: String,
    },

    #[error("Reference error in node {node_id}: {source}")]
    Reference {
        node_id: NodeId,
        #[source]
        source: ReferenceError,
    },

    #[error("Node {node_id} failed to build: {message}")]
    NodeBuild { node_id: NodeId, message: String },

    #[error("Node {node_id} blocked by failed upstream node {upstream}")]
    Blocked { node_id: NodeId, upstream: NodeId },

    #[error("Normalization error: {0}")]
    Normalization(String),

    #[error("Pause for run {run_id} timed out")]
    PauseTimeout { run_id: String },

    #[error("No pause is waiting for run {run_id}")]
    PauseNotFound { run_id: String },

    #[error("Pause for run {run_id} was cancelled")]
    PauseCancelled { run_id: String },

    #[error("A pause is already waiting for run {run_id}")]
    PauseInUse { run_id: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run stalled; nodes still pending: {pending:?}")]
    Stalled { pending: Vec<NodeId> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Build a node-scoped failure from anything displayable.
    pub fn node_build(node_id: impl Into<NodeId>, message: impl std::fmt::Display) -> Self {
        FlowError::NodeBuild {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }

    pub fn reference(node_id: impl Into<NodeId>, source: ReferenceError) -> Self {
        FlowError::Reference {
            node_id: node_id.into(),
            source,
        }
    }

    /// Scope an error returned by node logic to the node that raised it.
    ///
    /// Node-scoped, pause and cancellation errors keep their variant; any
    /// other error becomes a [`FlowError::NodeBuild`] for `node_id`.
    pub fn within_node(self, node_id: &str) -> Self {
        match self {
            FlowError::Reference { .. }
            | FlowError::NodeBuild { .. }
            | FlowError::Blocked { .. }
            | FlowError::PauseTimeout { .. }
            | FlowError::PauseNotFound { .. }
            | FlowError::PauseCancelled { .. }
            | FlowError::PauseInUse { .. }
            | FlowError::Cancelled => self,
            other => FlowError::node_build(node_id, other),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Config(_)
            | FlowError::Toml(_)
            | FlowError::Json(_)
            | FlowError::DagCycle(_)
            | FlowError::UnknownNode(_)
            | FlowError::DuplicateNode(_)
            | FlowError::UnknownInput { .. } => ErrorKind::Load,
            FlowError::Io(_) => ErrorKind::Io,
            FlowError::Reference { .. } => ErrorKind::Reference,
            FlowError::NodeBuild { .. } | FlowError::Blocked { .. } | FlowError::Other(_) => {
                ErrorKind::NodeBuild
            }
            FlowError::Normalization(_) => ErrorKind::Cache,
            FlowError::PauseTimeout { .. }
            | FlowError::PauseNotFound { .. }
            | FlowError::PauseCancelled { .. }
            | FlowError::PauseInUse { .. } => ErrorKind::Pause,
            FlowError::Cancelled => ErrorKind::Cancelled,
            FlowError::Stalled { .. } => ErrorKind::Liveness,
        }
    }

    /// Id of the node this error is scoped to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            FlowError::UnknownNode(id) | FlowError::DuplicateNode(id) => Some(id),
            FlowError::UnknownInput { target_id, .. } => Some(target_id),
            FlowError::Reference { node_id, .. }
            | FlowError::NodeBuild { node_id, .. }
            | FlowError::Blocked { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlowError>;
