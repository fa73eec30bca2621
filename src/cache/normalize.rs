// src/cache/normalize.rs

//! Conversion of execution state into a cache-safe form.
//!
//! Node builds may leave behind values that only make sense inside the
//! current process: callables, dynamically created types, opaque handles.
//! [`normalize`] maps every [`RuntimeValue`] to plain JSON:
//!
//! - callables and dynamic types become `{"__class_path__": "<path>"}`
//! - structured records flatten to their fields
//! - execution snapshots are tagged with `"__snapshot__": true` and their
//!   executable handle is replaced by `{"__unbuilt__": true}`
//! - non-finite floats become `{"__non_finite__": "NaN" | "inf" | "-inf"}`
//! - scalars, maps and sequences pass through
//!
//! Normalizing an already-normalized value returns it unchanged.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Number, Value};

use crate::errors::{FlowError, Result};

pub const CLASS_PATH_KEY: &str = "__class_path__";
pub const SNAPSHOT_MARKER: &str = "__snapshot__";
pub const UNBUILT_MARKER: &str = "__unbuilt__";
pub const NON_FINITE_KEY: &str = "__non_finite__";

/// Deepest nesting a cache entry may have; matches serde_json's recursion
/// limit so stored entries can always be read back.
pub const MAX_DEPTH: usize = 128;

/// Field holding the executable handle inside a snapshot.
pub const BUILT_OBJECT_KEY: &str = "built_object";

/// Keys that identify a plain mapping as an execution snapshot.
const SNAPSHOT_SHAPE: [&str; 3] = ["built", "results", BUILT_OBJECT_KEY];

/// Opaque process-local handle (a callable, a connection, a client...).
#[derive(Clone)]
pub struct Handle {
    /// Fully qualified path of the handle's type, e.g. `tools::search::Client`.
    pub type_path: String,
    pub inner: Arc<dyn Any + Send + Sync>,
}

impl Handle {
    pub fn new<T: Any + Send + Sync>(type_path: impl Into<String>, inner: T) -> Self {
        Self {
            type_path: type_path.into(),
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("type_path", &self.type_path)
            .finish_non_exhaustive()
    }
}

/// State a node build leaves behind, as held in memory during a run.
#[derive(Debug, Clone)]
pub enum RuntimeValue {
    Null,
    Bool(bool),
    Number(Number),
    /// Raw float from node logic; may be non-finite.
    Float(f64),
    Text(String),
    Sequence(Vec<RuntimeValue>),
    Mapping(BTreeMap<String, RuntimeValue>),
    /// Structured value object with a type and named fields.
    Record {
        type_path: String,
        fields: BTreeMap<String, RuntimeValue>,
    },
    Callable(Handle),
    /// A type created at run time, known only by its path.
    DynamicType { type_path: String },
    Snapshot(Box<ExecutionSnapshot>),
}

impl RuntimeValue {
    /// Tag stored next to a normalized value in the cache.
    pub fn type_tag(&self) -> &'static str {
        match self {
            RuntimeValue::Null => "null",
            RuntimeValue::Bool(_) => "bool",
            RuntimeValue::Number(_) | RuntimeValue::Float(_) => "number",
            RuntimeValue::Text(_) => "text",
            RuntimeValue::Sequence(_) => "sequence",
            RuntimeValue::Mapping(map) if is_snapshot_shape(map) => "snapshot",
            RuntimeValue::Mapping(_) => "mapping",
            RuntimeValue::Record { fields, .. } if is_snapshot_shape(fields) => "snapshot",
            RuntimeValue::Record { .. } => "record",
            RuntimeValue::Callable(_) | RuntimeValue::DynamicType { .. } => "class_path",
            RuntimeValue::Snapshot(_) => "snapshot",
        }
    }
}

impl From<Value> for RuntimeValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RuntimeValue::Null,
            Value::Bool(b) => RuntimeValue::Bool(b),
            Value::Number(n) => RuntimeValue::Number(n),
            Value::String(s) => RuntimeValue::Text(s),
            Value::Array(items) => RuntimeValue::Sequence(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                RuntimeValue::Mapping(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Everything a node build produced, before normalization.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub built: bool,
    /// Named output values.
    pub results: BTreeMap<String, RuntimeValue>,
    /// Side-channel artifacts (logs, previews, ...).
    pub artifacts: BTreeMap<String, RuntimeValue>,
    /// The executable object built by the node, if any. Never cached as-is.
    pub built_object: Option<RuntimeValue>,
    /// Final built value.
    pub built_result: RuntimeValue,
    /// Compact run descriptor (node id, kind, run id).
    pub full_data: RuntimeValue,
}

/// Convert a runtime value into its cache-safe JSON form.
///
/// Fails only for values nested deeper than [`MAX_DEPTH`].
pub fn normalize(value: &RuntimeValue) -> Result<Value> {
    normalize_at(value, 0)
}

fn normalize_at(value: &RuntimeValue, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(FlowError::Normalization(format!(
            "value nested deeper than {MAX_DEPTH} levels"
        )));
    }
    let depth = depth + 1;
    match value {
        RuntimeValue::Null => Ok(Value::Null),
        RuntimeValue::Bool(b) => Ok(Value::Bool(*b)),
        RuntimeValue::Number(n) => Ok(Value::Number(n.clone())),
        RuntimeValue::Float(f) => Ok(Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or_else(|| non_finite(*f))),
        RuntimeValue::Text(s) => Ok(Value::String(s.clone())),
        RuntimeValue::Sequence(items) => items
            .iter()
            .map(|item| normalize_at(item, depth))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        RuntimeValue::Mapping(map) | RuntimeValue::Record { fields: map, .. } => {
            if is_snapshot_shape(map) {
                normalize_snapshot_map(map, depth)
            } else {
                normalize_map(map, depth).map(Value::Object)
            }
        }
        RuntimeValue::Callable(handle) => Ok(class_path(&handle.type_path)),
        RuntimeValue::DynamicType { type_path } => Ok(class_path(type_path)),
        RuntimeValue::Snapshot(snapshot) => normalize_snapshot(snapshot, depth),
    }
}

/// Normalize plain JSON. Values too deep to normalize are returned as-is.
pub fn normalize_json(value: &Value) -> Value {
    let runtime = RuntimeValue::from(value.clone());
    normalize(&runtime).unwrap_or_else(|_| value.clone())
}

/// Whether a normalized value carries the snapshot marker.
pub fn is_tagged_snapshot(value: &Value) -> bool {
    value
        .get(SNAPSHOT_MARKER)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn class_path(path: &str) -> Value {
    json!({ CLASS_PATH_KEY: path })
}

fn unbuilt_placeholder() -> Value {
    json!({ UNBUILT_MARKER: true })
}

fn non_finite(f: f64) -> Value {
    let label = if f.is_nan() {
        "NaN"
    } else if f.is_sign_positive() {
        "inf"
    } else {
        "-inf"
    };
    json!({ NON_FINITE_KEY: label })
}

fn is_snapshot_shape(map: &BTreeMap<String, RuntimeValue>) -> bool {
    SNAPSHOT_SHAPE.iter().all(|key| map.contains_key(*key))
}

fn normalize_map(map: &BTreeMap<String, RuntimeValue>, depth: usize) -> Result<Map<String, Value>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), normalize_at(v, depth)?)))
        .collect()
}

fn normalize_snapshot_map(map: &BTreeMap<String, RuntimeValue>, depth: usize) -> Result<Value> {
    let mut out = normalize_map(map, depth)?;
    out.insert(SNAPSHOT_MARKER.to_string(), Value::Bool(true));
    out.insert(BUILT_OBJECT_KEY.to_string(), unbuilt_placeholder());
    Ok(Value::Object(out))
}

fn normalize_snapshot(snapshot: &ExecutionSnapshot, depth: usize) -> Result<Value> {
    let mut out = Map::new();
    out.insert(SNAPSHOT_MARKER.to_string(), Value::Bool(true));
    out.insert("built".to_string(), Value::Bool(snapshot.built));
    out.insert(
        "results".to_string(),
        normalize_map(&snapshot.results, depth).map(Value::Object)?,
    );
    out.insert(
        "artifacts".to_string(),
        normalize_map(&snapshot.artifacts, depth).map(Value::Object)?,
    );
    out.insert(BUILT_OBJECT_KEY.to_string(), unbuilt_placeholder());
    out.insert("built_result".to_string(), normalize_at(&snapshot.built_result, depth)?);
    out.insert("full_data".to_string(), normalize_at(&snapshot.full_data, depth)?);
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> ExecutionSnapshot {
        let mut results = BTreeMap::new();
        results.insert("text".to_string(), RuntimeValue::Text("hello".into()));
        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            "client".to_string(),
            RuntimeValue::Callable(Handle::new("tools::search::Client", 42u32)),
        );
        ExecutionSnapshot {
            built: true,
            results,
            artifacts,
            built_object: Some(RuntimeValue::Callable(Handle::new("llm::Chain", ()))),
            built_result: RuntimeValue::Record {
                type_path: "llm::Message".into(),
                fields: BTreeMap::from([("text".to_string(), RuntimeValue::Text("hello".into()))]),
            },
            full_data: RuntimeValue::from(json!({"id": "llm-1", "kind": "llm"})),
        }
    }

    #[test]
    fn snapshot_is_tagged_and_handle_replaced() {
        let v = normalize(&RuntimeValue::Snapshot(Box::new(sample_snapshot()))).unwrap();
        assert!(is_tagged_snapshot(&v));
        assert_eq!(v[BUILT_OBJECT_KEY], json!({ UNBUILT_MARKER: true }));
        assert_eq!(
            v["artifacts"]["client"],
            json!({ CLASS_PATH_KEY: "tools::search::Client" })
        );
        assert_eq!(v["built_result"], json!({"text": "hello"}));
        assert_eq!(v["results"]["text"], json!("hello"));
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let once = normalize(&RuntimeValue::Snapshot(Box::new(sample_snapshot()))).unwrap();
        assert_eq!(normalize_json(&once), once);
    }

    #[test]
    fn untagged_snapshot_shaped_mapping_gets_tagged() {
        let raw = json!({
            "built": true,
            "results": {"out": 1},
            "built_object": {"anything": "here"}
        });
        let v = normalize_json(&raw);
        assert!(is_tagged_snapshot(&v));
        assert_eq!(v[BUILT_OBJECT_KEY], json!({ UNBUILT_MARKER: true }));
        assert_eq!(v["results"], json!({"out": 1}));
    }

    #[test]
    fn plain_values_pass_through() {
        let raw = json!({"a": [1, 2.5, "x", null, {"b": false}]});
        assert_eq!(normalize_json(&raw), raw);
    }

    #[test]
    fn dynamic_types_become_class_paths() {
        let v = normalize(&RuntimeValue::DynamicType {
            type_path: "flows::generated::Output".into(),
        })
        .unwrap();
        assert_eq!(v, json!({ CLASS_PATH_KEY: "flows::generated::Output" }));
    }

    #[test]
    fn non_finite_floats_get_placeholders() {
        let v = normalize(&RuntimeValue::Sequence(vec![
            RuntimeValue::Float(f64::NAN),
            RuntimeValue::Float(f64::NEG_INFINITY),
            RuntimeValue::Float(1.5),
        ]))
        .unwrap();
        assert_eq!(
            v,
            json!([{ NON_FINITE_KEY: "NaN" }, { NON_FINITE_KEY: "-inf" }, 1.5])
        );
        assert_eq!(normalize_json(&v), v);
    }

    #[test]
    fn snapshot_shaped_record_flattens_like_a_mapping() {
        let fields = BTreeMap::from([
            ("built".to_string(), RuntimeValue::Bool(true)),
            ("results".to_string(), RuntimeValue::from(json!({"a": 1}))),
            (BUILT_OBJECT_KEY.to_string(), RuntimeValue::Text("kept".into())),
        ]);
        let record = RuntimeValue::Record {
            type_path: "flows::Vertex".into(),
            fields: fields.clone(),
        };

        let once = normalize(&record).unwrap();
        assert_eq!(once, normalize(&RuntimeValue::Mapping(fields)).unwrap());
        assert!(is_tagged_snapshot(&once));
        assert_eq!(once[BUILT_OBJECT_KEY], json!({ UNBUILT_MARKER: true }));
        assert_eq!(normalize_json(&once), once);
        assert_eq!(record.type_tag(), "snapshot");
    }

    #[test]
    fn too_deep_values_fail() {
        let mut value = RuntimeValue::Null;
        for _ in 0..=MAX_DEPTH {
            value = RuntimeValue::Sequence(vec![value]);
        }
        let err = normalize(&value).unwrap_err();
        assert!(matches!(err, FlowError::Normalization(_)));
    }

    #[test]
    fn type_tags() {
        assert_eq!(
            RuntimeValue::Snapshot(Box::new(sample_snapshot())).type_tag(),
            "snapshot"
        );
        assert_eq!(RuntimeValue::from(json!({"a": 1})).type_tag(), "mapping");
    }
}
