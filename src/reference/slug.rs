// src/reference/slug.rs

use std::collections::HashMap;

use crate::types::NodeId;

/// Alias used when a display name has no alphanumeric characters at all.
pub const DEFAULT_SLUG: &str = "Node";

/// Derive a slug from display metadata.
///
/// Each whitespace-separated word is stripped of non-alphanumerics and
/// title-cased, then the words are concatenated:
/// `"OpenAI Model 3.5"` becomes `"OpenaiModel35"`.
pub fn generate_slug(display_name: &str) -> String {
    let slug: String = display_name
        .split_whitespace()
        .map(|word| {
            let cleaned: String = word.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            title_case(&cleaned)
        })
        .collect();

    if slug.is_empty() {
        DEFAULT_SLUG.to_string()
    } else {
        slug
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}

/// Slug assignment for one graph; guarantees uniqueness.
///
/// Collisions get a numeric suffix starting at 2 (`Fetch`, `Fetch2`, ...).
#[derive(Debug, Clone, Default)]
pub struct SlugTable {
    by_slug: HashMap<String, NodeId>,
    by_node: HashMap<NodeId, String>,
}

impl SlugTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a slug to `node_id`, returning the one actually used.
    pub fn assign(&mut self, node_id: &str, display_name: &str) -> String {
        if let Some(existing) = self.by_node.get(node_id) {
            return existing.clone();
        }

        let base = generate_slug(display_name);
        let mut slug = base.clone();
        let mut suffix = 2;
        while self.by_slug.contains_key(&slug) {
            slug = format!("{base}{suffix}");
            suffix += 1;
        }

        self.by_slug.insert(slug.clone(), node_id.to_string());
        self.by_node.insert(node_id.to_string(), slug.clone());
        slug
    }

    pub fn node_for(&self, slug: &str) -> Option<&NodeId> {
        self.by_slug.get(slug)
    }

    pub fn slug_for(&self, node_id: &str) -> Option<&str> {
        self.by_node.get(node_id).map(String::as_str)
    }

    /// Slug -> node id map, used by reference resolution.
    pub fn as_map(&self) -> &HashMap<String, NodeId> {
        &self.by_slug
    }

    pub fn len(&self) -> usize {
        self.by_slug.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slug.is_empty()
    }
}
