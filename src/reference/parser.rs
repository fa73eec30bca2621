// src/reference/parser.rs

//! Grammar for inline references:
//!
//! ```text
//! @<slug>.<output>(.<key> | [<index>])*
//! ```
//!
//! The `@` must not follow a word character, so `user@Example.com` is plain
//! text. Anything that does not match is left untouched.

use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@([A-Za-z0-9_]+)\.([A-Za-z0-9_]+)((?:\.[A-Za-z0-9_]+|\[[0-9]+\])*)")
        .expect("reference pattern compiles")
});

static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.([A-Za-z0-9_]+)|\[([0-9]+)\]").expect("segment pattern compiles")
});

/// One step of the trailing path after the output name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// `.name` - map or field access.
    Key(String),
    /// `[3]` - sequence index.
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, ".{k}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A parsed `@Slug.output.path[0]` expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub slug: String,
    pub output: String,
    pub path: Vec<PathSegment>,
}

impl Reference {
    pub fn new(slug: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            output: output.into(),
            path: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.path.push(PathSegment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.path.push(PathSegment::Index(index));
        self
    }

    /// Parse text that consists of exactly one reference (surrounding
    /// whitespace allowed).
    pub fn parse(text: &str) -> Option<Reference> {
        let trimmed = text.trim();
        let found = find_references(trimmed);
        match found.as_slice() {
            [only] if only.range == (0..trimmed.len()) => Some(only.reference.clone()),
            _ => None,
        }
    }

    /// Full textual form, including the leading `@`.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", self.slug, self.output)?;
        for seg in &self.path {
            write!(f, "{seg}")?;
        }
        Ok(())
    }
}

/// A reference found inside a larger string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMatch {
    /// Byte range of the whole expression, `@` included.
    pub range: Range<usize>,
    pub reference: Reference,
}

/// Find every well-formed reference in `text`, in order of appearance.
pub fn find_references(text: &str) -> Vec<ReferenceMatch> {
    REFERENCE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            if preceded_by_word_char(text, whole.start()) {
                return None;
            }
            let path = parse_path(caps.get(3).map_or("", |m| m.as_str()))?;
            Some(ReferenceMatch {
                range: whole.range(),
                reference: Reference {
                    slug: caps[1].to_string(),
                    output: caps[2].to_string(),
                    path,
                },
            })
        })
        .collect()
}

/// Whether `text` contains at least one reference.
pub fn contains_reference(text: &str) -> bool {
    !find_references(text).is_empty()
}

fn preceded_by_word_char(text: &str, at: usize) -> bool {
    text[..at]
        .chars()
        .next_back()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
}

/// `None` when an index does not fit in `usize`; the whole match is then
/// treated as plain text.
fn parse_path(raw: &str) -> Option<Vec<PathSegment>> {
    SEGMENT_RE
        .captures_iter(raw)
        .map(|caps| match (caps.get(1), caps.get(2)) {
            (Some(key), _) => Some(PathSegment::Key(key.as_str().to_string())),
            (None, Some(idx)) => idx.as_str().parse().ok().map(PathSegment::Index),
            (None, None) => None,
        })
        .collect()
}
