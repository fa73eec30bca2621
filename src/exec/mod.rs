// src/exec/mod.rs

//! Node execution layer.
//!
//! - [`backend`] defines the build contract: the [`NodeLogic`] trait every
//!   node kind implements, the [`NodeRegistry`] mapping kind tags to logic,
//!   and the [`BuildContext`] / [`NodeOutput`] passed across it.
//! - [`task_runner`] builds one node: frozen-cache restore, cancellation and
//!   snapshot caching.

pub mod backend;
pub mod task_runner;

pub use backend::{BuildContext, BuildFuture, NodeLogic, NodeOutput, NodeRegistry};
pub use task_runner::{build_node, BuildJob, BuildSuccess};
