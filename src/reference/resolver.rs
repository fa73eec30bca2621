// src/reference/resolver.rs

//! Resolution of references against outputs that have already been produced.

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::ReferenceError;
use crate::reference::parser::{find_references, PathSegment, Reference};
use crate::types::{FieldValue, NodeId, OutputMap};

/// Source of already-built outputs, addressed by slug.
pub trait ReferenceScope {
    /// Outputs of the node owning `slug`.
    ///
    /// Must fail with [`ReferenceError::UnknownSlug`] for slugs that do not
    /// exist and [`ReferenceError::NotBuilt`] for nodes without outputs yet.
    fn outputs_of(&self, slug: &str) -> Result<&OutputMap, ReferenceError>;
}

/// Borrowed view over a slug table and the outputs produced so far.
#[derive(Debug, Clone, Copy)]
pub struct BuiltOutputs<'a> {
    slugs: &'a HashMap<String, NodeId>,
    outputs: &'a HashMap<NodeId, OutputMap>,
}

impl<'a> BuiltOutputs<'a> {
    pub fn new(
        slugs: &'a HashMap<String, NodeId>,
        outputs: &'a HashMap<NodeId, OutputMap>,
    ) -> Self {
        Self { slugs, outputs }
    }
}

impl ReferenceScope for BuiltOutputs<'_> {
    fn outputs_of(&self, slug: &str) -> Result<&OutputMap, ReferenceError> {
        let node_id = self
            .slugs
            .get(slug)
            .ok_or_else(|| ReferenceError::UnknownSlug {
                slug: slug.to_string(),
            })?;
        self.outputs
            .get(node_id)
            .ok_or_else(|| ReferenceError::NotBuilt {
                slug: slug.to_string(),
            })
    }
}

/// Look up a single reference: slug, then output, then the trailing path.
pub fn resolve(reference: &Reference, scope: &dyn ReferenceScope) -> Result<Value, ReferenceError> {
    let outputs = scope.outputs_of(&reference.slug)?;
    let mut current = outputs
        .get(&reference.output)
        .ok_or_else(|| ReferenceError::UnknownOutput {
            slug: reference.slug.clone(),
            output: reference.output.clone(),
        })?;

    for segment in &reference.path {
        let next = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key),
            (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx),
            _ => None,
        };
        current = next.ok_or_else(|| ReferenceError::BadPath {
            reference: reference.render(),
            segment: segment.to_string(),
        })?;
    }

    Ok(current.clone())
}

/// Substitute every reference inside `text`.
///
/// Text that is exactly one reference yields the referenced value as-is;
/// otherwise each reference is replaced by its rendering (strings verbatim,
/// everything else as compact JSON) and the result is a string.
pub fn interpolate(text: &str, scope: &dyn ReferenceScope) -> Result<Value, ReferenceError> {
    if let Some(reference) = Reference::parse(text) {
        return resolve(&reference, scope);
    }

    let matches = find_references(text);
    if matches.is_empty() {
        return Ok(Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for m in matches {
        out.push_str(&text[cursor..m.range.start]);
        match resolve(&m.reference, scope)? {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        cursor = m.range.end;
    }
    out.push_str(&text[cursor..]);
    Ok(Value::String(out))
}

/// Resolve every reference embedded anywhere in a config value.
pub fn resolve_field(value: &FieldValue, scope: &dyn ReferenceScope) -> Result<Value, ReferenceError> {
    match value {
        FieldValue::Text(s) => interpolate(s, scope),
        FieldValue::Sequence(items) => items
            .iter()
            .map(|v| resolve_field(v, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        FieldValue::Mapping(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_field(v, scope)?)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.to_json()),
    }
}

/// Every reference embedded in a config value.
pub fn references_in(value: &FieldValue) -> Vec<Reference> {
    value
        .texts()
        .into_iter()
        .flat_map(find_references)
        .map(|m| m.reference)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (HashMap<String, NodeId>, HashMap<NodeId, OutputMap>) {
        let slugs = HashMap::from([
            ("Fetch".to_string(), "fetch-1".to_string()),
            ("Pending".to_string(), "pending-1".to_string()),
        ]);
        let mut fetch = OutputMap::new();
        fetch.insert("body".to_string(), json!({"items": ["x", "y"], "count": 2}));
        let outputs = HashMap::from([("fetch-1".to_string(), fetch)]);
        (slugs, outputs)
    }

    #[test]
    fn interpolates_indexed_path_inside_text() {
        let (slugs, outputs) = fixture();
        let scope = BuiltOutputs::new(&slugs, &outputs);
        let v = interpolate("value: @Fetch.body.items[0]", &scope).unwrap();
        assert_eq!(v, json!("value: x"));
    }

    #[test]
    fn whole_reference_keeps_value_type() {
        let (slugs, outputs) = fixture();
        let scope = BuiltOutputs::new(&slugs, &outputs);
        assert_eq!(interpolate("@Fetch.body.count", &scope).unwrap(), json!(2));
        assert_eq!(
            interpolate("n=@Fetch.body.count", &scope).unwrap(),
            json!("n=2")
        );
    }

    #[test]
    fn unknown_slug_output_and_path_are_distinct_errors() {
        let (slugs, outputs) = fixture();
        let scope = BuiltOutputs::new(&slugs, &outputs);

        assert!(matches!(
            interpolate("@Nope.body", &scope),
            Err(ReferenceError::UnknownSlug { .. })
        ));
        assert!(matches!(
            interpolate("@Fetch.headers", &scope),
            Err(ReferenceError::UnknownOutput { .. })
        ));
        assert!(matches!(
            interpolate("@Fetch.body.items[5]", &scope),
            Err(ReferenceError::BadPath { .. })
        ));
        assert!(matches!(
            interpolate("@Fetch.body.items.first", &scope),
            Err(ReferenceError::BadPath { .. })
        ));
        assert!(matches!(
            interpolate("@Pending.out", &scope),
            Err(ReferenceError::NotBuilt { .. })
        ));
    }

    #[test]
    fn resolves_nested_config_values() {
        let (slugs, outputs) = fixture();
        let scope = BuiltOutputs::new(&slugs, &outputs);
        let field = FieldValue::from(json!({
            "first": "@Fetch.body.items[0]",
            "all": ["@Fetch.body.items", 3, "plain"]
        }));
        let resolved = resolve_field(&field, &scope).unwrap();
        assert_eq!(
            resolved,
            json!({"first": "x", "all": [["x", "y"], 3, "plain"]})
        );
    }

    #[test]
    fn collects_references_from_config() {
        let field = FieldValue::from(json!({"a": "@A.out and @B.out[1]", "b": ["@C.x.y"]}));
        let slugs: Vec<_> = references_in(&field).into_iter().map(|r| r.slug).collect();
        assert_eq!(slugs, vec!["A", "B", "C"]);
    }
}
