// src/reference/mod.rs

//! Inline symbolic references between nodes.
//!
//! - [`parser`] recognises `@Slug.output.path[0]` expressions inside strings.
//! - [`resolver`] looks them up against outputs that were already built.
//! - [`slug`] derives the human-typed alias each node is addressed by.

pub mod parser;
pub mod resolver;
pub mod slug;

pub use parser::{find_references, PathSegment, Reference, ReferenceMatch};
pub use resolver::{interpolate, references_in, resolve, resolve_field, BuiltOutputs, ReferenceScope};
pub use slug::{generate_slug, SlugTable, DEFAULT_SLUG};
