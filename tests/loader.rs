// tests/loader.rs

use std::io::Write;

use flowdag::config::{load_and_validate, load_from_path};
use flowdag::errors::{ErrorKind, FlowError};
use flowdag::types::FieldValue;
use tempfile::{Builder, NamedTempFile};

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn json_file(contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(".json").tempfile().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn toml_flow_loads_with_engine_section() {
    let file = toml_file(
        r#"
id = "summarize"
name = "Summarize a page"

[engine]
max_concurrent_nodes = 4
task_log_capacity = 5

[[nodes]]
id = "fetch"
kind = "http"
display_name = "Fetch Page"
outputs = ["body"]
config = { url = "https://example.com", retries = 3 }

[[nodes]]
id = "llm"
kind = "llm"
inputs = ["context"]
frozen = true
config = { prompt = "Summarize: @FetchPage.body", tags = ["a", "b"] }

[[edges]]
source = "fetch"
target = "llm"
source_output = "body"
target_input = "context"
"#,
    );

    let flow = load_and_validate(file.path()).unwrap();

    assert_eq!(flow.id, "summarize");
    assert_eq!(flow.engine.max_concurrent_nodes, 4);
    assert_eq!(flow.engine.task_log_capacity, 5);
    assert_eq!(flow.engine.pause_timeout_secs, 3600);
    assert_eq!(flow.slugs().slug_for("fetch"), Some("FetchPage"));
    assert_eq!(flow.slugs().slug_for("llm"), Some("Llm"));

    let llm = flow.node("llm").unwrap();
    assert!(llm.frozen);
    assert_eq!(
        llm.config["prompt"],
        FieldValue::Text("Summarize: @FetchPage.body".to_string())
    );
    assert!(matches!(llm.config["tags"], FieldValue::Sequence(_)));
}

#[test]
fn json_flow_is_detected_by_extension() {
    let file = json_file(
        r#"{
  "id": "web",
  "viewport": { "x": 0, "y": 0, "zoom": 1.0 },
  "nodes": [
    { "id": "in", "kind": "input", "outputs": ["text"] },
    { "id": "out", "kind": "output", "inputs": ["text"], "config": { "format": null } }
  ],
  "edges": [
    { "source": "in", "target": "out", "source_output": "text", "target_input": "text" }
  ]
}"#,
    );

    let flow = load_and_validate(file.path()).unwrap();
    assert_eq!(flow.id, "web");
    assert_eq!(flow.nodes.len(), 2);
    assert!(flow.viewport.is_some());
    assert_eq!(flow.node("out").unwrap().config["format"], FieldValue::Null);
}

#[test]
fn raw_load_skips_semantic_checks() {
    let file = toml_file(
        r#"
[[nodes]]
id = "a"
kind = "x"

[[edges]]
source = "a"
target = "ghost"
"#,
    );

    let raw = load_from_path(file.path()).unwrap();
    assert_eq!(raw.id, "flow");
    assert_eq!(raw.edges.len(), 1);

    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, FlowError::UnknownNode(ref id) if id == "ghost"));
}

#[test]
fn static_cycle_returns_structured_error() {
    let file = toml_file(
        r#"
[[nodes]]
id = "a"
kind = "x"

[[nodes]]
id = "b"
kind = "x"

[[edges]]
source = "a"
target = "b"

[[edges]]
source = "b"
target = "a"
"#,
    );

    match load_and_validate(file.path()) {
        Err(FlowError::DagCycle(msg)) => {
            assert!(msg.contains("cycle detected"));
            assert!(msg.contains('a') || msg.contains('b'));
        }
        Err(e) => panic!("Expected DagCycle error, got: {e:?}"),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn edge_into_undeclared_input_is_rejected() {
    let file = toml_file(
        r#"
[[nodes]]
id = "a"
kind = "x"
outputs = ["out"]

[[nodes]]
id = "b"
kind = "x"
inputs = ["in"]

[[edges]]
source = "a"
target = "b"
source_output = "out"
target_input = "nope"
"#,
    );

    let err = load_and_validate(file.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Load);
    match err {
        FlowError::UnknownInput { source_id, target_id, input } => {
            assert_eq!(source_id, "a");
            assert_eq!(target_id, "b");
            assert_eq!(input, "nope");
        }
        other => panic!("Expected UnknownInput, got: {other:?}"),
    }
}

#[test]
fn malformed_files_surface_parse_errors() {
    let toml = toml_file("[[nodes]\nid = ");
    assert!(matches!(load_from_path(toml.path()), Err(FlowError::Toml(_))));

    let json = json_file("{ \"nodes\": [ ");
    assert!(matches!(load_from_path(json.path()), Err(FlowError::Json(_))));

    let missing = load_from_path("/definitely/not/here.toml").unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::Io);
}

#[test]
fn empty_flow_is_a_config_error() {
    let file = toml_file("id = \"empty\"\n");
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}
