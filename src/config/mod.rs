// src/config/mod.rs

//! Flow definition loading and validation.
//!
//! - [`model`] is the serde data model (nodes, edges, `[engine]`).
//! - [`loader`] reads JSON or TOML files from disk.
//! - [`validate`] turns a raw definition into a checked [`FlowDefinition`].

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_json, parse_toml};
pub use model::{EdgeDefinition, EngineConfig, FlowDefinition, NodeDefinition, RawFlowDefinition};
