// src/tasklog.rs

//! Process-wide queue of side-effect log tasks with a per-node cap.
//!
//! Only [`LogTask::Transaction`] entries are capped: once a node id holds
//! `capacity` of them, pushing another drops that node's oldest transaction
//! first. [`LogTask::VertexBuild`] entries are never dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::keyed_lock::KeyedLocks;
use crate::types::{NodeId, RunId};

const REDACTED: &str = "***REDACTED***";

/// Values this short are fully redacted instead of partially shown.
const MIN_MASKABLE_LEN: usize = 13;

/// Key tokens (split on `_` and `-`) that mark a value as sensitive.
const SENSITIVE_TOKENS: &[&str] = &[
    "apikey",
    "password",
    "secret",
    "token",
    "credential",
    "auth",
    "bearer",
];

/// Adjacent token pairs that mark a value as sensitive.
const SENSITIVE_PAIRS: &[(&str, &str)] = &[("api", "key"), ("private", "key"), ("access", "key")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Error,
    Blocked,
}

/// Record of one node build, as handed to the transaction sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub status: TransactionStatus,
    pub inputs: Value,
    pub outputs: Value,
    pub error: Option<String>,
}

impl TransactionRecord {
    /// Build a record with inputs and outputs already sanitized.
    pub fn new(
        node_id: impl Into<NodeId>,
        run_id: impl Into<RunId>,
        status: TransactionStatus,
        inputs: &Value,
        outputs: &Value,
        error: Option<String>,
    ) -> Self {
        let mut inputs = sanitize(inputs);
        if let Value::Object(map) = &mut inputs {
            map.remove("code");
        }
        Self {
            node_id: node_id.into(),
            run_id: run_id.into(),
            status,
            inputs,
            outputs: sanitize(outputs),
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VertexBuildRecord {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub valid: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogTask {
    Transaction(TransactionRecord),
    VertexBuild(VertexBuildRecord),
}

impl LogTask {
    pub fn node_id(&self) -> &str {
        match self {
            LogTask::Transaction(t) => &t.node_id,
            LogTask::VertexBuild(v) => &v.node_id,
        }
    }

    fn is_capped(&self) -> bool {
        matches!(self, LogTask::Transaction(_))
    }
}

#[derive(Debug)]
struct Queued {
    seq: u64,
    task: LogTask,
}

#[derive(Debug)]
pub struct BoundedTaskLog {
    capacity: usize,
    queues: DashMap<NodeId, VecDeque<Queued>>,
    locks: KeyedLocks<NodeId>,
    seq: AtomicU64,
}

impl BoundedTaskLog {
    /// `capacity` is clamped to at least one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: DashMap::new(),
            locks: KeyedLocks::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a task; returns the transaction dropped to make room, if any.
    pub async fn push(&self, task: LogTask) -> Option<LogTask> {
        let node_id = task.node_id().to_string();
        let _guard = self.locks.lock(&node_id).await;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queues.entry(node_id.clone()).or_default();

        let mut dropped = None;
        if task.is_capped() {
            let capped = queue.iter().filter(|q| q.task.is_capped()).count();
            if capped >= self.capacity {
                if let Some(pos) = queue.iter().position(|q| q.task.is_capped()) {
                    dropped = queue.remove(pos).map(|q| q.task);
                    debug!(node_id = %node_id, "task log full; dropped oldest transaction");
                }
            }
        }

        queue.push_back(Queued { seq, task });
        dropped
    }

    /// Number of queued tasks for one node id.
    pub fn pending_for(&self, node_id: &str) -> usize {
        self.queues.get(node_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued task, oldest first.
    pub async fn drain(&self) -> Vec<LogTask> {
        let node_ids: Vec<NodeId> = self.queues.iter().map(|e| e.key().clone()).collect();

        let mut taken = Vec::new();
        for node_id in node_ids {
            let _guard = self.locks.lock(&node_id).await;
            if let Some((_, queue)) = self.queues.remove(&node_id) {
                taken.extend(queue);
            }
        }

        taken.sort_by_key(|q| q.seq);
        taken.into_iter().map(|q| q.task).collect()
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    let tokens: Vec<&str> = key.split(['_', '-']).collect();
    tokens.iter().any(|t| SENSITIVE_TOKENS.iter().any(|s| s == t))
        || tokens
            .windows(2)
            .any(|w| SENSITIVE_PAIRS.iter().any(|&(a, b)| w[0] == a && w[1] == b))
}

fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < MIN_MASKABLE_LEN {
        return REDACTED.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Mask string values stored under sensitive keys, recursively.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                let cleaned = match v {
                    Value::String(s) if is_sensitive_key(key) => Value::String(mask(s)),
                    other => sanitize(other),
                };
                out.insert(key.clone(), cleaned);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}
