// src/dag/scheduler_step.rs

//! Step-by-step result types for the scheduler.

use crate::types::NodeId;

/// Structured result of a single scheduler "step".
///
/// Useful for tests that step the DAG by hand and assert on what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStep {
    /// Nodes that became ready as a result of this step.
    pub newly_ready: Vec<NodeId>,
    /// Nodes newly blocked by an upstream failure in this step.
    pub newly_blocked: Vec<NodeId>,
    /// Whether every member is now Built, Errored or blocked.
    pub run_just_finished: bool,
}

/// Verdict on the nodes a ready node references through its config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicCheck {
    /// Every referenced node is built; go ahead.
    Ready,
    /// These referenced nodes were added as dynamic dependencies.
    Deferred(Vec<NodeId>),
    /// A referenced node failed (or was itself blocked by `upstream`).
    Blocked { upstream: NodeId },
    /// A referenced node is not part of this run.
    OutsideRun(NodeId),
}
