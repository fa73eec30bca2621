// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod keyed_lock;
pub mod logging;
pub mod pause;
pub mod reference;
pub mod tasklog;
pub mod types;

use std::path::PathBuf;

use anyhow::Result;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::FlowDefinition;
use crate::dag::DagGraph;
use crate::reference::references_in;

pub use crate::engine::{Graph, NodeResult, RunCancel, RunReport, RunRequest};
pub use crate::errors::{FlowError, Result as FlowResult};
pub use crate::exec::{BuildContext, BuildFuture, NodeLogic, NodeOutput, NodeRegistry};

/// High-level entry point used by `main.rs`.
///
/// Loads and validates a flow definition, then prints its static plan.
/// Node logic is supplied by embedders through [`Graph`], so the binary
/// never builds nodes.
pub async fn run(args: CliArgs) -> Result<()> {
    let flow_path = PathBuf::from(&args.flow);
    let flow = load_and_validate(&flow_path)?;

    info!(
        flow_id = %flow.id,
        nodes = flow.nodes.len(),
        edges = flow.edges.len(),
        "flow definition is valid"
    );

    if args.check {
        println!("{}: ok ({} nodes)", flow_path.display(), flow.nodes.len());
        return Ok(());
    }

    print_plan(&flow);
    Ok(())
}

/// Print layers, slugs and the references each node's config contains.
fn print_plan(flow: &FlowDefinition) {
    let dag = DagGraph::from_definition(flow);

    match &flow.name {
        Some(name) => println!("flowdag plan: {} ({name})", flow.id),
        None => println!("flowdag plan: {}", flow.id),
    }
    println!(
        "  engine.max_concurrent_nodes = {}",
        flow.engine.concurrency()
    );
    println!("  engine.cache_enabled = {}", flow.engine.cache_enabled);
    println!();

    for (depth, layer) in dag.layers().iter().enumerate() {
        println!("layer {depth}:");
        for id in layer {
            let Some(node) = flow.node(id) else {
                continue;
            };
            let slug = flow.slugs().slug_for(id).unwrap_or_default();
            println!("  - {id} [{}] @{slug}", node.kind);

            let deps = dag.dependencies_of(id);
            if !deps.is_empty() {
                println!("      after: {deps:?}");
            }
            if node.frozen {
                println!("      frozen: true");
            }

            let references: Vec<String> = node
                .config
                .values()
                .flat_map(references_in)
                .map(|r| r.render())
                .collect();
            if !references.is_empty() {
                println!("      references: {references:?}");
            }
        }
    }

    debug!("plan printed (no execution)");
}
