// src/engine/graph.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::model::{EngineConfig, FlowDefinition};
use crate::dag::{DagGraph, Edge, MutationEvent, Node, Observer, Scheduler};
use crate::errors::{FlowError, Result};
use crate::exec::NodeRegistry;
use crate::pause::PauseRegistry;
use crate::tasklog::BoundedTaskLog;
use crate::types::{NodeId, RunId};

use super::runtime::{RunLoop, RunResources};
use super::{ActiveRuns, NodeResult, RunCancel, RunReport, RunRequest};

/// Capacity of the per-run result stream.
const RESULT_CHANNEL_CAPACITY: usize = 64;

/// An executable flow: validated definition, node logic and the session
/// resources shared by its runs.
///
/// Cloning is cheap; clones share cache, task log, pause registry, active
/// runs and the shutdown signal.
#[derive(Clone)]
pub struct Graph {
    definition: Arc<FlowDefinition>,
    dag: DagGraph,
    nodes: Arc<BTreeMap<NodeId, Node>>,
    edges: Arc<Vec<Edge>>,
    slugs: Arc<HashMap<String, NodeId>>,
    registry: NodeRegistry,
    config: EngineConfig,
    cache: Arc<CacheStore>,
    task_log: Arc<BoundedTaskLog>,
    pause: Arc<PauseRegistry>,
    observers: Vec<Observer>,
    active: Arc<ActiveRuns>,
    /// Parent of every run token; cancelled only by [`Graph::shutdown`].
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("flow_id", &self.definition.id)
            .field("nodes", &self.dag.len())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Check every node against the registry and set up fresh session
    /// resources sized from the flow's engine section.
    pub fn new(definition: FlowDefinition, registry: NodeRegistry) -> Result<Self> {
        for node in &definition.nodes {
            registry.validate(node)?;
        }

        let mut nodes = BTreeMap::new();
        for def in &definition.nodes {
            let slug = definition
                .slugs()
                .slug_for(&def.id)
                .ok_or_else(|| FlowError::UnknownNode(def.id.clone()))?;
            nodes.insert(def.id.clone(), Node::from_definition(def, slug));
        }

        let dag = DagGraph::from_definition(&definition);
        let edges = definition.edges.iter().map(Edge::from).collect();
        let slugs = definition.slugs().as_map().clone();
        let config = definition.engine.clone();

        Ok(Self {
            dag,
            nodes: Arc::new(nodes),
            edges: Arc::new(edges),
            slugs: Arc::new(slugs),
            registry,
            cache: Arc::new(CacheStore::new()),
            task_log: Arc::new(BoundedTaskLog::new(config.task_log_capacity)),
            pause: PauseRegistry::new(),
            observers: Vec::new(),
            active: Arc::default(),
            shutdown: CancellationToken::new(),
            config,
            definition: Arc::new(definition),
        })
    }

    /// Replace the engine settings. The task log is resized to match.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        if config.task_log_capacity != self.config.task_log_capacity {
            self.task_log = Arc::new(BoundedTaskLog::new(config.task_log_capacity));
        }
        self.config = config;
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_task_log(mut self, task_log: Arc<BoundedTaskLog>) -> Self {
        self.task_log = task_log;
        self
    }

    pub fn with_pause_registry(mut self, pause: Arc<PauseRegistry>) -> Self {
        self.pause = pause;
        self
    }

    /// Observe every run-manager mutation of subsequent runs.
    pub fn register_observer(&mut self, observer: impl Fn(&MutationEvent) + Send + Sync + 'static) {
        self.observers.push(Arc::new(observer));
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn dag(&self) -> &DagGraph {
        &self.dag
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn slug_of(&self, id: &str) -> Option<&str> {
        self.definition.slugs().slug_for(id)
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn task_log(&self) -> &Arc<BoundedTaskLog> {
        &self.task_log
    }

    pub fn pause_registry(&self) -> &Arc<PauseRegistry> {
        &self.pause
    }

    /// Cancellation handle for the active run `run_id`, or `None` when no
    /// such run is executing.
    pub fn cancel_handle(&self, run_id: &str) -> Option<RunCancel> {
        self.active.token(run_id).map(RunCancel::new)
    }

    /// Ids of the runs currently executing, sorted.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.active.ids()
    }

    /// Cancel every active run of this graph and its clones, and refuse
    /// new runs from now on.
    pub fn shutdown(&self) {
        debug!(flow_id = %self.definition.id, active = ?self.active.ids(), "shutting down graph");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Deliver external data to a paused node of `run_id`.
    pub fn resume(&self, run_id: &str, data: Value) -> Result<()> {
        self.pause.resume(run_id, data)
    }

    /// Run to completion and return the report.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport> {
        self.prepare(request, None)?.run().await
    }

    /// Start a run in the background. Each node result is sent as soon as
    /// the node settles; the handle yields the final report.
    ///
    /// Fails synchronously for unknown stop or start nodes.
    pub fn run_streaming(
        &self,
        request: RunRequest,
    ) -> Result<(mpsc::Receiver<NodeResult>, JoinHandle<Result<RunReport>>)> {
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let run = self.prepare(request, Some(tx))?;
        Ok((rx, tokio::spawn(run.run())))
    }

    fn prepare(
        &self,
        request: RunRequest,
        results_tx: Option<mpsc::Sender<NodeResult>>,
    ) -> Result<RunLoop> {
        if self.shutdown.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        let members = self
            .dag
            .sort_up_to(request.stop_node.as_deref(), request.start_node.as_deref())?;
        let run_id = request
            .run_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(
            run_id = %run_id,
            members = members.len(),
            stop = ?request.stop_node,
            start = ?request.start_node,
            "preparing run"
        );

        let cancel = self.shutdown.child_token();
        let active = self.active.register(&run_id, cancel.clone());

        let scheduler = Scheduler::new(
            run_id,
            self.dag.clone(),
            (*self.nodes).clone(),
            members,
            self.observers.clone(),
        );
        let resources = RunResources {
            flow_id: self.definition.id.clone(),
            edges: Arc::clone(&self.edges),
            slugs: Arc::clone(&self.slugs),
            registry: self.registry.clone(),
            config: self.config.clone(),
            cache: Arc::clone(&self.cache),
            task_log: Arc::clone(&self.task_log),
            pause: Arc::clone(&self.pause),
        };

        Ok(RunLoop::new(
            scheduler,
            resources,
            request.inputs,
            cancel,
            results_tx,
            active,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{EdgeDefinition, NodeDefinition, RawFlowDefinition};
    use crate::exec::{BuildContext, BuildFuture, NodeLogic, NodeOutput};
    use serde_json::json;

    struct Constant;

    impl NodeLogic for Constant {
        fn build(&self, ctx: BuildContext) -> BuildFuture<'_> {
            Box::pin(async move { Ok(NodeOutput::new().with_value("out", json!(ctx.node_id))) })
        }
    }

    fn node(id: &str) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            kind: "constant".to_string(),
            display_name: None,
            config: Default::default(),
            inputs: vec!["in".to_string()],
            outputs: vec!["out".to_string()],
            frozen: false,
        }
    }

    fn raw(nodes: Vec<NodeDefinition>, edges: Vec<EdgeDefinition>) -> RawFlowDefinition {
        RawFlowDefinition {
            id: "flow".to_string(),
            name: None,
            nodes,
            edges,
            viewport: None,
            engine: EngineConfig::default(),
        }
    }

    fn graph() -> Graph {
        let raw = raw(
            vec![node("a"), node("b")],
            vec![EdgeDefinition {
                source: "a".to_string(),
                target: "b".to_string(),
                source_output: Some("out".to_string()),
                target_input: Some("in".to_string()),
            }],
        );
        let mut registry = NodeRegistry::new();
        registry.register("constant", Constant);
        Graph::new(FlowDefinition::try_from(raw).unwrap(), registry).unwrap()
    }

    #[test]
    fn unregistered_kind_fails_construction() {
        let raw = raw(vec![node("a")], vec![]);
        let err = Graph::new(FlowDefinition::try_from(raw).unwrap(), NodeRegistry::new()).unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn slugs_come_from_the_definition() {
        let g = graph();
        assert_eq!(g.slug_of("a"), Some("Constant"));
        assert_eq!(g.slug_of("b"), Some("Constant2"));
        assert_eq!(g.node("b").unwrap().slug, "Constant2");
    }

    #[tokio::test]
    async fn unknown_stop_node_is_rejected_before_running() {
        let err = graph()
            .run(RunRequest::new().stop_at("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownNode(id) if id == "nope"));
    }

    #[tokio::test]
    async fn edge_values_reach_the_target() {
        let report = graph().run(RunRequest::new().with_run_id("r1")).await.unwrap();
        assert_eq!(report.run_id, "r1");
        assert_eq!(report.built, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report.output("b", "out"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn shut_down_graph_refuses_new_runs() {
        let g = graph();
        let clone = g.clone();
        g.shutdown();
        assert!(clone.is_shut_down());
        let err = clone.run(RunRequest::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
    }

    #[tokio::test]
    async fn finished_runs_are_no_longer_cancellable() {
        let g = graph();
        g.run(RunRequest::new().with_run_id("done")).await.unwrap();
        assert!(g.cancel_handle("done").is_none());
        assert!(g.active_runs().is_empty());
    }
}
