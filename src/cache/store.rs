// src/cache/store.rs

//! Shared cache of normalized node snapshots.

use std::fmt;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::normalize::{is_tagged_snapshot, normalize, RuntimeValue};
use crate::keyed_lock::KeyedLocks;
use crate::types::{NodeId, OutputMap};

/// A cache slot: one node within one run or flow scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub node_id: NodeId,
    /// Run id for per-run entries, flow id for frozen nodes.
    pub scope: String,
}

impl CacheKey {
    pub fn new(node_id: impl Into<NodeId>, scope: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            scope: scope.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.scope)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub type_tag: String,
    pub value: Value,
}

impl CacheEntry {
    /// Outputs recorded in a snapshot entry.
    ///
    /// Returns `None` when the entry is not a complete, built snapshot; the
    /// caller should then rebuild instead of trusting it.
    pub fn snapshot_results(&self) -> Option<OutputMap> {
        if self.type_tag != "snapshot" || !is_tagged_snapshot(&self.value) {
            return None;
        }
        if !self.value.get("built").and_then(Value::as_bool)? {
            return None;
        }
        let results = self.value.get("results")?.as_object()?;
        Some(
            results
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Concurrent cache where writes to the same key serialize and writes to
/// different keys run in parallel.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
    locks: KeyedLocks<CacheKey>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize `value` and store it under `key`.
    ///
    /// Returns `false` (and leaves any existing entry untouched) when the
    /// value cannot be normalized. Never fails the caller.
    pub async fn set(&self, key: CacheKey, value: &RuntimeValue) -> bool {
        let normalized = match normalize(value) {
            Ok(v) => v,
            Err(err) => {
                warn!(key = %key, error = %err, "normalization failed; skipping cache write");
                return false;
            }
        };

        let _guard = self.locks.lock(&key).await;
        debug!(key = %key, type_tag = value.type_tag(), "writing cache entry");
        self.entries.insert(
            key,
            CacheEntry {
                type_tag: value.type_tag().to_string(),
                value: normalized,
            },
        );
        true
    }

    /// Store a raw entry as-is. Used to seed or repair a cache.
    pub async fn put_entry(&self, key: CacheKey, entry: CacheEntry) {
        let _guard = self.locks.lock(&key).await;
        self.entries.insert(key, entry);
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub async fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let _guard = self.locks.lock(key).await;
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Drop every entry of one scope; returns how many were removed.
    pub async fn clear_scope(&self, scope: &str) -> usize {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.key().scope == scope)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.remove(&key).await.is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
