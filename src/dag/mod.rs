// src/dag/mod.rs

//! DAG representation and scheduling.
//!
//! - [`graph`] holds the static adjacency of a flow, its layered order and
//!   partial-run selection.
//! - [`node`] defines nodes, edges and the build state machine.
//! - [`run_manager`] keeps the live dependency maps and ready queue of one
//!   run and notifies observers of every mutation.
//! - [`scheduler`] is the per-run state machine deciding what is ready and
//!   what is blocked.
//! - [`scheduler_step`] defines the result types for scheduler steps.

pub mod graph;
pub mod node;
pub mod run_manager;
pub mod scheduler;
pub mod scheduler_step;

pub use graph::DagGraph;
pub use node::{Edge, Node, NodeState};
pub use run_manager::{MutationEvent, MutationKind, MutationPhase, Observer, RunManager};
pub use scheduler::{BuildOutcome, Scheduler};
pub use scheduler_step::{DynamicCheck, SchedulerStep};
