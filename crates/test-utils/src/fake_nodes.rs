//! Node logic used by tests in place of real components.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowdag::errors::Result;
use flowdag::exec::{BuildContext, BuildFuture, NodeLogic, NodeOutput, NodeRegistry};
use flowdag::types::OutputMap;
use serde_json::{json, Value};

/// Always produces the same outputs.
#[derive(Debug, Clone, Default)]
pub struct StaticNode {
    outputs: OutputMap,
}

impl StaticNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.outputs.insert(name.to_string(), value);
        self
    }
}

impl NodeLogic for StaticNode {
    fn build(&self, _ctx: BuildContext) -> BuildFuture<'_> {
        Box::pin(async move {
            let mut out = NodeOutput::new();
            out.values = self.outputs.clone();
            Ok(out)
        })
    }
}

/// Outputs every resolved config value and every edge input under its own
/// name.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoNode;

impl NodeLogic for EchoNode {
    fn build(&self, ctx: BuildContext) -> BuildFuture<'_> {
        Box::pin(async move {
            let mut out = NodeOutput::new();
            for (k, v) in ctx.config.iter().chain(ctx.inputs.iter()) {
                out.values.insert(k.clone(), v.clone());
            }
            Ok(out)
        })
    }
}

/// Fails with the `message` config value, or a fixed message.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingNode;

impl NodeLogic for FailingNode {
    fn build(&self, ctx: BuildContext) -> BuildFuture<'_> {
        Box::pin(async move {
            let message = ctx
                .config("message")
                .and_then(Value::as_str)
                .unwrap_or("boom")
                .to_string();
            Err(ctx.fail(message))
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingNode;

impl NodeLogic for PanickingNode {
    fn build(&self, _ctx: BuildContext) -> BuildFuture<'_> {
        Box::pin(explode())
    }
}

async fn explode() -> Result<NodeOutput> {
    panic!("node logic panicked")
}

/// Waits for external data through the pause primitive and outputs it as
/// `out`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateNode;

impl NodeLogic for GateNode {
    fn build(&self, ctx: BuildContext) -> BuildFuture<'_> {
        Box::pin(async move {
            let data = ctx.pause().await?;
            Ok(NodeOutput::new().with_value("out", data))
        })
    }
}

/// Shared log of build starts plus a concurrency high-water mark.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    started: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node ids in the order their builds started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn count(&self, node_id: &str) -> usize {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == node_id)
            .count()
    }

    /// Most builds observed running at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self, node_id: &str) -> ActiveGuard {
        self.started.lock().unwrap().push(node_id.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(Arc::clone(&self.active))
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Records its start, sleeps for the `delay_ms` config value (if any), and
/// outputs its own id as `out` alongside its edge inputs.
#[derive(Debug, Clone, Default)]
pub struct RecordingNode {
    recorder: Recorder,
}

impl RecordingNode {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl NodeLogic for RecordingNode {
    fn build(&self, ctx: BuildContext) -> BuildFuture<'_> {
        Box::pin(async move {
            let _active = self.recorder.enter(&ctx.node_id);
            if let Some(ms) = ctx.config("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }

            let mut out = NodeOutput::new().with_value("out", json!(ctx.node_id));
            for (k, v) in &ctx.inputs {
                out.values.insert(k.clone(), v.clone());
            }
            Ok(out)
        })
    }
}

/// Registry with every fake kind: `echo`, `fail`, `panic`, `gate` and
/// `record` (sharing `recorder`).
pub fn fake_registry(recorder: &Recorder) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry
        .register("echo", EchoNode)
        .register("fail", FailingNode)
        .register("panic", PanickingNode)
        .register("gate", GateNode)
        .register("record", RecordingNode::new(recorder.clone()));
    registry
}
