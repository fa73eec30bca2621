// src/config/loader.rs

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::model::{FlowDefinition, RawFlowDefinition};
use crate::errors::Result;

/// Load a flow definition from `path` without semantic validation.
///
/// `.json` files are parsed as JSON; anything else is parsed as TOML.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawFlowDefinition> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    debug!(path = %path.display(), json = is_json, "loading flow definition");

    let raw = if is_json {
        parse_json(&contents)?
    } else {
        parse_toml(&contents)?
    };
    Ok(raw)
}

/// Load a flow definition and run all load-time checks.
///
/// Fails before any node could run on:
/// - an empty node list or duplicate node ids,
/// - edges pointing at unknown nodes or undeclared inputs,
/// - static cycles.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<FlowDefinition> {
    let raw = load_from_path(&path)?;
    FlowDefinition::try_from(raw)
}

pub fn parse_json(contents: &str) -> Result<RawFlowDefinition> {
    Ok(serde_json::from_str(contents)?)
}

pub fn parse_toml(contents: &str) -> Result<RawFlowDefinition> {
    Ok(toml::from_str(contents)?)
}
