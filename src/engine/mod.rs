// src/engine/mod.rs

//! Orchestration engine.
//!
//! [`Graph`] owns a validated flow, the node registry and the shared
//! session resources (cache, task log, pause registry). Each call to
//! [`Graph::run`] or [`Graph::run_streaming`] drives one run through the
//! async loop in [`runtime`], which pulls ready nodes from the pure
//! [`Scheduler`](crate::dag::Scheduler) and builds them concurrently.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dag::NodeState;
use crate::errors::{ErrorKind, FlowError};
use crate::types::{NodeId, OutputMap, RunId};

pub mod graph;
pub mod runtime;

pub use graph::Graph;

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Values every node can read through `BuildContext::run_input`.
    pub inputs: BTreeMap<String, Value>,
    /// Run only this node and what it depends on.
    pub stop_node: Option<NodeId>,
    /// Run this node, everything downstream, and what those depend on.
    pub start_node: Option<NodeId>,
    /// Fixed run id; a fresh uuid is generated when absent.
    pub run_id: Option<RunId>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn stop_at(mut self, node: impl Into<NodeId>) -> Self {
        self.stop_node = Some(node.into());
        self
    }

    pub fn start_from(mut self, node: impl Into<NodeId>) -> Self {
        self.start_node = Some(node.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Cloneable summary of a node failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FlowError> for NodeFailure {
    fn from(err: &FlowError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Per-node result, streamed as soon as the node settles.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub slug: String,
    pub state: NodeState,
    /// Never built because an upstream node failed.
    pub blocked: bool,
    pub from_cache: bool,
    pub outputs: OutputMap,
    pub error: Option<NodeFailure>,
}

/// Final result of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub run_id: RunId,
    /// Built nodes, in completion order.
    pub built: Vec<NodeId>,
    pub errored: Vec<NodeId>,
    pub blocked: Vec<NodeId>,
    pub outputs: BTreeMap<NodeId, OutputMap>,
    /// Failures of errored and blocked nodes.
    pub errors: BTreeMap<NodeId, FlowError>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.errored.is_empty() && self.blocked.is_empty()
    }

    pub fn output(&self, node_id: &str, name: &str) -> Option<&Value> {
        self.outputs.get(node_id)?.get(name)
    }
}

/// Handle that aborts one active run.
///
/// Cancelling stops new dispatch, cancels the run's pause wait and waits
/// for in-flight builds before the run returns [`FlowError::Cancelled`].
/// Other runs of the same [`Graph`] are unaffected; use
/// [`Graph::shutdown`] to stop them all.
#[derive(Debug, Clone)]
pub struct RunCancel {
    token: CancellationToken,
}

impl RunCancel {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Cancellation tokens of the runs currently executing on a graph.
#[derive(Debug, Default)]
pub(crate) struct ActiveRuns {
    runs: DashMap<RunId, (u64, CancellationToken)>,
    next: AtomicU64,
}

impl ActiveRuns {
    /// Track `run_id` until the returned guard drops.
    pub(crate) fn register(self: &Arc<Self>, run_id: &str, token: CancellationToken) -> ActiveRunGuard {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        self.runs.insert(run_id.to_string(), (seq, token));
        ActiveRunGuard {
            runs: Arc::clone(self),
            run_id: run_id.to_string(),
            seq,
        }
    }

    pub(crate) fn token(&self, run_id: &str) -> Option<CancellationToken> {
        self.runs.get(run_id).map(|entry| entry.value().1.clone())
    }

    pub(crate) fn ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// Removes its run from [`ActiveRuns`] on drop, unless a newer run has
/// since registered under the same id.
#[derive(Debug)]
pub(crate) struct ActiveRunGuard {
    runs: Arc<ActiveRuns>,
    run_id: RunId,
    seq: u64,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.runs
            .runs
            .remove_if(&self.run_id, |_, (seq, _)| *seq == self.seq);
    }
}
