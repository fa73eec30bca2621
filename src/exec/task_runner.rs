// src/exec/task_runner.rs

//! Build of a single node: frozen-cache restore, cancellable compute,
//! snapshot caching.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore, ExecutionSnapshot, RuntimeValue};
use crate::dag::Node;
use crate::errors::{FlowError, Result};
use crate::exec::backend::{BuildContext, NodeLogic, NodeOutput};
use crate::keyed_lock::KeyedLocks;
use crate::types::{NodeId, OutputMap};

/// Everything needed to build one node, owned so it can be spawned.
pub struct BuildJob {
    pub node: Node,
    pub logic: Arc<dyn NodeLogic>,
    pub ctx: BuildContext,
    /// `None` when caching is disabled.
    pub cache: Option<Arc<CacheStore>>,
    /// Cache scope for frozen nodes.
    pub flow_id: String,
    pub build_locks: Arc<KeyedLocks<NodeId>>,
}

#[derive(Debug, Clone)]
pub struct BuildSuccess {
    pub outputs: OutputMap,
    pub from_cache: bool,
    pub duration: Duration,
}

/// Run one node build to completion.
///
/// Holds the node's build lock for the whole build, so a node never has
/// two builds in flight within a run.
pub async fn build_node(job: BuildJob) -> Result<BuildSuccess> {
    let BuildJob {
        node,
        logic,
        ctx,
        cache,
        flow_id,
        build_locks,
    } = job;

    let _guard = build_locks.lock(&node.id).await;
    let started = Instant::now();

    if node.frozen {
        if let Some(outputs) = restore_frozen(cache.as_deref(), &node, &flow_id) {
            info!(node_id = %node.id, run_id = %ctx.run_id, "frozen node restored from cache");
            return Ok(BuildSuccess {
                outputs,
                from_cache: true,
                duration: started.elapsed(),
            });
        }
    }

    info!(node_id = %node.id, slug = %node.slug, run_id = %ctx.run_id, kind = %node.kind, "building node");

    let cancel = ctx.cancellation().clone();
    let run_id = ctx.run_id.clone();
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(node_id = %node.id, "build cancelled");
            return Err(FlowError::Cancelled);
        }
        res = logic.build(ctx) => res.map_err(|err| err.within_node(&node.id))?,
    };

    for name in output.values.keys() {
        if !node.outputs.is_empty() && !node.outputs.contains(name) {
            warn!(node_id = %node.id, output = %name, "node produced an undeclared output");
        }
    }

    if let Some(cache) = &cache {
        let scope = if node.frozen { flow_id.as_str() } else { run_id.as_str() };
        let snapshot = snapshot_of(&node, &run_id, &output);
        cache.set(CacheKey::new(node.id.clone(), scope), &snapshot).await;
    }

    let duration = started.elapsed();
    info!(
        node_id = %node.id,
        run_id = %run_id,
        duration_ms = duration.as_millis() as u64,
        "node built"
    );

    Ok(BuildSuccess {
        outputs: output.values,
        from_cache: false,
        duration,
    })
}

/// Outputs of a valid flow-scoped entry, or `None` (with the built flag
/// effectively reset) when there is none or it is malformed.
fn restore_frozen(cache: Option<&CacheStore>, node: &Node, flow_id: &str) -> Option<OutputMap> {
    let entry = cache?.get(&CacheKey::new(node.id.clone(), flow_id))?;
    match entry.snapshot_results() {
        Some(outputs) => Some(outputs),
        None => {
            warn!(
                node_id = %node.id,
                type_tag = %entry.type_tag,
                "cached entry for frozen node is malformed; rebuilding"
            );
            None
        }
    }
}

fn snapshot_of(node: &Node, run_id: &str, output: &NodeOutput) -> RuntimeValue {
    let results: BTreeMap<String, RuntimeValue> = output
        .values
        .iter()
        .map(|(k, v)| (k.clone(), RuntimeValue::from(v.clone())))
        .collect();

    let built_result = match output.values.len() {
        0 => RuntimeValue::Null,
        1 => results.values().next().cloned().unwrap_or(RuntimeValue::Null),
        _ => RuntimeValue::Mapping(results.clone()),
    };

    RuntimeValue::Snapshot(Box::new(ExecutionSnapshot {
        built: true,
        results,
        artifacts: output.artifacts.clone(),
        built_object: output.built_object.clone(),
        built_result,
        full_data: RuntimeValue::from(json!({
            "id": node.id,
            "kind": node.kind,
            "run_id": run_id,
        })),
    }))
}
