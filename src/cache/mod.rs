// src/cache/mod.rs

//! Memoization of node builds.
//!
//! - [`normalize`] turns an execution snapshot into plain JSON.
//! - [`store`] holds normalized entries behind per-key locks.

pub mod normalize;
pub mod store;

pub use normalize::{normalize, normalize_json, ExecutionSnapshot, Handle, RuntimeValue};
pub use store::{CacheEntry, CacheKey, CacheStore};
