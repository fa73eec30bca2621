#![allow(dead_code)]

use std::time::Duration;

use flowdag::config::FlowDefinition;
use flowdag::engine::NodeResult;
use flowdag::Graph;
use flowdag_test_utils::{fake_registry, Recorder};
use tokio::sync::mpsc;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Graph over the fake node kinds, with a fresh recorder.
pub fn fake_graph(flow: FlowDefinition) -> (Graph, Recorder) {
    let recorder = Recorder::new();
    let graph = Graph::new(flow, fake_registry(&recorder)).expect("fake kinds are registered");
    (graph, recorder)
}

/// Poll until a node of `run_id` is waiting on the pause registry.
pub async fn wait_for_pause(graph: &Graph, run_id: &str) {
    while !graph.pause_registry().is_waiting(run_id) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the recorder has seen `node_id` start.
pub async fn wait_for_start(recorder: &Recorder, node_id: &str) {
    while recorder.count(node_id) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn collect(mut rx: mpsc::Receiver<NodeResult>) -> Vec<NodeResult> {
    let mut out = Vec::new();
    while let Some(result) = rx.recv().await {
        out.push(result);
    }
    out
}
