// tests/partial_runs.rs

mod common;

use std::sync::{Arc, Mutex};

use common::{collect, fake_graph, TestResult};
use flowdag::config::FlowDefinition;
use flowdag::dag::{MutationEvent, MutationKind, MutationPhase};
use flowdag::errors::FlowError;
use flowdag::RunRequest;
use flowdag_test_utils::{with_timeout, FlowDefinitionBuilder, NodeBuilder};

/// a -> b -> c, plus an unrelated d.
fn chain() -> FlowDefinition {
    FlowDefinitionBuilder::new("chain")
        .with_node(NodeBuilder::new("a", "record").build())
        .with_node(NodeBuilder::new("b", "record").build())
        .with_node(NodeBuilder::new("c", "record").build())
        .with_node(NodeBuilder::new("d", "record").build())
        .with_edge("a", "b")
        .with_edge("b", "c")
        .build()
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

#[tokio::test]
async fn stop_node_runs_only_its_ancestry() -> TestResult {
    let (graph, recorder) = fake_graph(chain());

    let report = with_timeout(graph.run(RunRequest::new().stop_at("b"))).await?;

    assert_eq!(report.built, vec!["a", "b"]);
    assert_eq!(recorder.count("c"), 0);
    assert_eq!(recorder.count("d"), 0);
    Ok(())
}

#[tokio::test]
async fn start_node_runs_downstream_and_its_needs() -> TestResult {
    let (graph, recorder) = fake_graph(chain());

    let report = with_timeout(graph.run(RunRequest::new().start_from("b"))).await?;

    assert_eq!(sorted(report.built), vec!["a", "b", "c"]);
    assert_eq!(recorder.count("d"), 0);
    Ok(())
}

#[tokio::test]
async fn stop_wins_over_start() -> TestResult {
    let (graph, _recorder) = fake_graph(chain());

    let report = with_timeout(graph.run(RunRequest::new().start_from("a").stop_at("a"))).await?;

    assert_eq!(report.built, vec!["a"]);
    Ok(())
}

#[tokio::test]
async fn unknown_start_node_fails_before_streaming() {
    let (graph, recorder) = fake_graph(chain());

    let err = graph
        .run_streaming(RunRequest::new().start_from("zzz"))
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, FlowError::UnknownNode(id) if id == "zzz"));
    assert!(recorder.started().is_empty());
}

#[tokio::test]
async fn reference_to_node_outside_partial_run_errors_the_node() -> TestResult {
    let flow = FlowDefinitionBuilder::new("outside")
        .with_node(NodeBuilder::new("src", "echo").display_name("Source").config("v", "x").build())
        .with_node(NodeBuilder::new("user", "echo").config("v", "@Source.v").build())
        .with_node(NodeBuilder::new("tail", "record").build())
        .with_edge("user", "tail")
        .build();
    let (graph, _recorder) = fake_graph(flow);

    let (rx, handle) = graph.run_streaming(RunRequest::new().start_from("user"))?;
    let results = with_timeout(collect(rx)).await;
    let report = with_timeout(handle).await??;

    assert_eq!(report.errored, vec!["user"]);
    assert_eq!(report.blocked, vec!["tail"]);
    assert!(results.iter().all(|r| r.node_id != "src"));
    assert_eq!(report.errors["user"].node_id(), Some("user"));
    Ok(())
}

#[tokio::test]
async fn observers_see_one_pair_per_mutation() -> TestResult {
    let (mut graph, _recorder) = fake_graph(
        FlowDefinitionBuilder::new("observed")
            .with_node(NodeBuilder::new("a", "record").build())
            .with_node(NodeBuilder::new("b", "record").build())
            .with_edge("a", "b")
            .build(),
    );

    let events: Arc<Mutex<Vec<MutationEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    graph.register_observer(move |e| sink.lock().unwrap().push(e.clone()));

    let report = with_timeout(graph.run(RunRequest::new().with_run_id("obs"))).await?;
    assert!(report.is_success());

    let events = events.lock().unwrap();
    let count = |kind: MutationKind, phase: MutationPhase| {
        events.iter().filter(|e| e.kind == kind && e.phase == phase).count()
    };

    // start [a], complete a -> [b]; each node popped and completed once.
    assert_eq!(count(MutationKind::ExtendQueue, MutationPhase::Before), 2);
    assert_eq!(count(MutationKind::PopReady, MutationPhase::Before), 2);
    assert_eq!(count(MutationKind::Complete, MutationPhase::Before), 2);
    assert_eq!(count(MutationKind::AddDynamicDependency, MutationPhase::Before), 0);

    for pair in events.chunks(2) {
        assert_eq!(pair[0].phase, MutationPhase::Before);
        assert_eq!(pair[1].phase, MutationPhase::After);
        assert_eq!(pair[0].step, pair[1].step);
        assert_eq!(pair[0].kind, pair[1].kind);
    }
    assert!(events.iter().all(|e| e.run_id == "obs"));
    Ok(())
}

#[tokio::test]
async fn frozen_node_is_restored_on_later_runs() -> TestResult {
    let flow = FlowDefinitionBuilder::new("frozen")
        .with_node(NodeBuilder::new("expensive", "record").output("out").frozen().build())
        .with_node(NodeBuilder::new("cheap", "record").input("in").build())
        .with_value_edge("expensive", "out", "cheap", "in")
        .build();
    let (graph, recorder) = fake_graph(flow);

    with_timeout(graph.run(RunRequest::new())).await?;
    let (rx, handle) = graph.run_streaming(RunRequest::new())?;
    let results = with_timeout(collect(rx)).await;
    let report = with_timeout(handle).await??;

    assert_eq!(recorder.count("expensive"), 1);
    assert_eq!(recorder.count("cheap"), 2);

    let restored = results.iter().find(|r| r.node_id == "expensive").unwrap();
    assert!(restored.from_cache);
    assert_eq!(report.output("cheap", "in"), Some(&serde_json::json!("expensive")));
    Ok(())
}
