// src/types.rs

//! Shared identifiers and the tagged value model for node configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Opaque node identifier as written in the flow definition.
pub type NodeId = String;

/// Identifier of one execution of a flow.
pub type RunId = String;

/// Named output values produced by a node build.
pub type OutputMap = BTreeMap<String, Value>;

/// A single configuration field of a node.
///
/// Strings may embed `@Slug.output.path` references which are substituted
/// just before the node builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    Sequence(Vec<FieldValue>),
    Mapping(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Null => FieldKind::Any,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Sequence(_) => FieldKind::Sequence,
            FieldValue::Mapping(_) => FieldKind::Mapping,
        }
    }

    /// Every text fragment in this value, depth first.
    pub fn texts(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_texts(&mut out);
        out
    }

    fn collect_texts<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FieldValue::Text(s) => out.push(s),
            FieldValue::Sequence(items) => items.iter().for_each(|v| v.collect_texts(out)),
            FieldValue::Mapping(map) => map.values().for_each(|v| v.collect_texts(out)),
            _ => {}
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Number(n) => Value::Number(n.clone()),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Sequence(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            FieldValue::Mapping(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => FieldValue::Number(n),
            Value::String(s) => FieldValue::Text(s),
            Value::Array(items) => FieldValue::Sequence(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                FieldValue::Mapping(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

/// Shape a node kind expects for one of its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Any,
    Bool,
    Number,
    Text,
    Sequence,
    Mapping,
}

impl FieldKind {
    /// Whether a configured value satisfies this declared kind.
    pub fn accepts(self, value: &FieldValue) -> bool {
        match (self, value) {
            (FieldKind::Any, _) | (_, FieldValue::Null) => true,
            (expected, v) => expected == v.kind(),
        }
    }
}

/// One entry of a node kind's declared schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}
