// src/engine/runtime.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::config::model::EngineConfig;
use crate::dag::{BuildOutcome, DynamicCheck, Edge, NodeState, Scheduler};
use crate::errors::{FlowError, ReferenceError, Result};
use crate::exec::{build_node, BuildContext, BuildJob, BuildSuccess, NodeRegistry};
use crate::keyed_lock::KeyedLocks;
use crate::pause::PauseRegistry;
use crate::reference::{references_in, resolve_field, BuiltOutputs};
use crate::tasklog::{BoundedTaskLog, LogTask, TransactionRecord, TransactionStatus, VertexBuildRecord};
use crate::types::{NodeId, OutputMap, RunId};

use super::{ActiveRunGuard, NodeFailure, NodeResult, RunReport};

type Joined = (NodeId, Result<BuildSuccess>);

/// Shared resources a run borrows from its [`Graph`](super::Graph).
pub(crate) struct RunResources {
    pub flow_id: String,
    pub edges: Arc<Vec<Edge>>,
    pub slugs: Arc<HashMap<String, NodeId>>,
    pub registry: NodeRegistry,
    pub config: EngineConfig,
    pub cache: Arc<CacheStore>,
    pub task_log: Arc<BoundedTaskLog>,
    pub pause: Arc<PauseRegistry>,
}

/// Drives one run: pulls ready nodes from the [`Scheduler`], builds them
/// concurrently up to the fan-out limit, and feeds completions back.
///
/// The scheduler holds all run semantics; this loop only does the async
/// work around it (spawning builds, waiting on completions, cancellation
/// and liveness).
pub struct RunLoop {
    run_id: RunId,
    scheduler: Scheduler,
    res: RunResources,
    run_inputs: Arc<BTreeMap<String, Value>>,
    cancel: CancellationToken,
    results_tx: Option<mpsc::Sender<NodeResult>>,
    build_locks: Arc<KeyedLocks<NodeId>>,
    outputs: HashMap<NodeId, OutputMap>,
    /// Sanitization input for each node's transaction record.
    build_inputs: HashMap<NodeId, Value>,
    report: RunReport,
    /// Keeps the run cancellable by id while it executes.
    _active: ActiveRunGuard,
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("run_id", &self.run_id)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl RunLoop {
    pub(crate) fn new(
        scheduler: Scheduler,
        res: RunResources,
        run_inputs: BTreeMap<String, Value>,
        cancel: CancellationToken,
        results_tx: Option<mpsc::Sender<NodeResult>>,
        active: ActiveRunGuard,
    ) -> Self {
        let run_id = scheduler.run_id().to_string();
        Self {
            report: RunReport {
                run_id: run_id.clone(),
                ..RunReport::default()
            },
            run_id,
            scheduler,
            res,
            run_inputs: Arc::new(run_inputs),
            cancel,
            results_tx,
            build_locks: Arc::new(KeyedLocks::new()),
            outputs: HashMap::new(),
            build_inputs: HashMap::new(),
            _active: active,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Main loop.
    ///
    /// Returns the report once every member is Built, Errored or blocked.
    /// Fails with `Cancelled` when the run is cancelled and with `Stalled`
    /// when nothing can make progress.
    pub async fn run(mut self) -> Result<RunReport> {
        info!(run_id = %self.run_id, flow_id = %self.res.flow_id, "run started");

        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        self.scheduler.start();

        let semaphore = Arc::new(Semaphore::new(self.res.config.concurrency()));
        let mut tasks: JoinSet<Joined> = JoinSet::new();
        let liveness = self.res.config.liveness_timeout();
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                return self.shutdown(&mut tasks).await;
            }

            self.dispatch_ready(&semaphore, &mut tasks).await;

            if tasks.is_empty() {
                if self.scheduler.is_finished() {
                    break;
                }
                let pending = self.scheduler.unresolved();
                error!(run_id = %self.run_id, ?pending, "no build in flight but nodes remain; run stalled");
                return Err(FlowError::Stalled { pending });
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.shutdown(&mut tasks).await;
                }
                joined = tokio::time::timeout(liveness, tasks.join_next()) => match joined {
                    Err(_elapsed) => {
                        if self.res.pause.is_waiting(&self.run_id) {
                            debug!(run_id = %self.run_id, "liveness timeout while paused; still waiting");
                            continue;
                        }
                        let pending = self.scheduler.unresolved();
                        error!(run_id = %self.run_id, ?pending, "no build completed within liveness timeout");
                        tasks.abort_all();
                        cancel.cancel();
                        return Err(FlowError::Stalled { pending });
                    }
                    Ok(None) => continue,
                    Ok(Some(Ok((node_id, result)))) => self.on_build_finished(node_id, result).await,
                    Ok(Some(Err(join_err))) => {
                        error!(run_id = %self.run_id, error = %join_err, "build task failed to join");
                        tasks.abort_all();
                        return Err(FlowError::Other(anyhow::anyhow!("build task failed: {join_err}")));
                    }
                }
            }
        }

        info!(
            run_id = %self.run_id,
            built = self.report.built.len(),
            errored = self.report.errored.len(),
            blocked = self.report.blocked.len(),
            "run finished"
        );
        Ok(self.report)
    }

    async fn dispatch_ready(&mut self, semaphore: &Arc<Semaphore>, tasks: &mut JoinSet<Joined>) {
        while let Some(id) = self.scheduler.next_ready() {
            let referenced = self.referenced_nodes(&id);
            match self.scheduler.check_dynamic(&id, &referenced) {
                DynamicCheck::Ready => {}
                DynamicCheck::Deferred(deps) => {
                    debug!(node_id = %id, ?deps, "node waits on referenced nodes");
                    continue;
                }
                DynamicCheck::Blocked { upstream } => {
                    let step = self.scheduler.mark_blocked(&id, &upstream);
                    self.report_blocked(step.newly_blocked).await;
                    continue;
                }
                DynamicCheck::OutsideRun(other) => {
                    let slug = self
                        .scheduler
                        .node(&other)
                        .map(|n| n.slug.clone())
                        .unwrap_or(other);
                    let err = FlowError::reference(&id, ReferenceError::NotBuilt { slug });
                    self.fail_node(id, err).await;
                    continue;
                }
            }

            let job = match self.prepare_job(&id) {
                Ok(job) => job,
                Err(err) => {
                    self.fail_node(id, err).await;
                    continue;
                }
            };
            if let Err(err) = self.scheduler.mark_building(&id) {
                self.fail_node(id, err).await;
                continue;
            }

            let semaphore = Arc::clone(semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let result = run_isolated(&id, job).await;
                        drop(permit);
                        result
                    }
                    Err(closed) => Err(FlowError::Other(closed.into())),
                };
                (id, result)
            });
        }
    }

    /// Member ids whose slugs appear in the node's config. Unknown slugs
    /// are left for resolution to report.
    fn referenced_nodes(&self, id: &str) -> Vec<NodeId> {
        let Some(node) = self.scheduler.node(id) else {
            return Vec::new();
        };
        node.config
            .values()
            .flat_map(references_in)
            .filter_map(|r| self.res.slugs.get(&r.slug).cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn prepare_job(&mut self, id: &str) -> Result<BuildJob> {
        let node = self
            .scheduler
            .node(id)
            .cloned()
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))?;
        let logic = self.res.registry.get(&node.kind).ok_or_else(|| {
            FlowError::node_build(id, format!("no logic registered for kind '{}'", node.kind))
        })?;

        let scope = BuiltOutputs::new(&self.res.slugs, &self.outputs);
        let mut config = BTreeMap::new();
        for (name, value) in &node.config {
            let resolved = resolve_field(value, &scope).map_err(|e| FlowError::reference(id, e))?;
            config.insert(name.clone(), resolved);
        }

        let mut inputs = BTreeMap::new();
        for edge in self.res.edges.iter().filter(|e| e.target == id) {
            let Some(input) = &edge.target_input else {
                continue;
            };
            let upstream = self.outputs.get(&edge.source).ok_or_else(|| {
                FlowError::node_build(id, format!("upstream '{}' has no outputs", edge.source))
            })?;
            let value = match &edge.source_output {
                Some(name) => upstream.get(name).cloned().ok_or_else(|| {
                    FlowError::node_build(
                        id,
                        format!("upstream '{}' produced no output '{}'", edge.source, name),
                    )
                })?,
                None => Value::Object(upstream.clone().into_iter().collect()),
            };
            inputs.insert(input.clone(), value);
        }

        let mut logged = serde_json::Map::new();
        logged.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        logged.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.build_inputs.insert(id.to_string(), Value::Object(logged));

        let ctx = BuildContext::new(
            id,
            node.slug.clone(),
            self.run_id.clone(),
            config,
            inputs,
            Arc::clone(&self.run_inputs),
            self.cancel.child_token(),
            Arc::clone(&self.res.pause),
            self.res.config.pause_timeout(),
        );

        Ok(BuildJob {
            node,
            logic,
            ctx,
            cache: self
                .res
                .config
                .cache_enabled
                .then(|| Arc::clone(&self.res.cache)),
            flow_id: self.res.flow_id.clone(),
            build_locks: Arc::clone(&self.build_locks),
        })
    }

    async fn on_build_finished(&mut self, id: NodeId, result: Result<BuildSuccess>) {
        let success = match result {
            Ok(success) => success,
            Err(err) => return self.fail_node(id, err).await,
        };

        let step = self.scheduler.handle_completion(&id, BuildOutcome::Built);
        debug!(node_id = %id, newly_ready = ?step.newly_ready, "node completion applied");

        self.outputs.insert(id.clone(), success.outputs.clone());
        self.report.built.push(id.clone());
        self.report.outputs.insert(id.clone(), success.outputs.clone());

        let outputs_json = Value::Object(success.outputs.clone().into_iter().collect());
        self.log_transaction(&id, TransactionStatus::Success, &outputs_json, None)
            .await;
        self.res
            .task_log
            .push(LogTask::VertexBuild(VertexBuildRecord {
                node_id: id.clone(),
                run_id: self.run_id.clone(),
                valid: true,
                duration_ms: success.duration.as_millis() as u64,
            }))
            .await;

        let slug = self.slug_of(&id);
        self.emit(NodeResult {
            node_id: id,
            slug,
            state: NodeState::Built,
            blocked: false,
            from_cache: success.from_cache,
            outputs: success.outputs,
            error: None,
        })
        .await;
    }

    /// Record a node failure and block its dependents. Unrelated branches
    /// keep running.
    async fn fail_node(&mut self, id: NodeId, err: FlowError) {
        warn!(node_id = %id, run_id = %self.run_id, kind = ?err.kind(), error = %err, "node errored");

        let step = self.scheduler.handle_completion(&id, BuildOutcome::Errored);

        let failure = NodeFailure::from(&err);
        self.log_transaction(&id, TransactionStatus::Error, &Value::Null, Some(failure.message.clone()))
            .await;
        self.report.errored.push(id.clone());
        self.report.errors.insert(id.clone(), err);

        let slug = self.slug_of(&id);
        self.emit(NodeResult {
            node_id: id,
            slug,
            state: NodeState::Errored,
            blocked: false,
            from_cache: false,
            outputs: OutputMap::new(),
            error: Some(failure),
        })
        .await;

        self.report_blocked(step.newly_blocked).await;
    }

    async fn report_blocked(&mut self, blocked: Vec<NodeId>) {
        for id in blocked {
            let upstream = self
                .scheduler
                .blocked_by(&id)
                .unwrap_or_default()
                .to_string();
            let err = FlowError::Blocked {
                node_id: id.clone(),
                upstream,
            };
            let failure = NodeFailure::from(&err);

            self.log_transaction(&id, TransactionStatus::Blocked, &Value::Null, Some(failure.message.clone()))
                .await;
            self.report.blocked.push(id.clone());
            self.report.errors.insert(id.clone(), err);

            let slug = self.slug_of(&id);
            self.emit(NodeResult {
                node_id: id,
                slug,
                state: NodeState::Pending,
                blocked: true,
                from_cache: false,
                outputs: OutputMap::new(),
                error: Some(failure),
            })
            .await;
        }
    }

    async fn log_transaction(
        &self,
        id: &str,
        status: TransactionStatus,
        outputs: &Value,
        error: Option<String>,
    ) {
        let inputs = self.build_inputs.get(id).cloned().unwrap_or(Value::Null);
        let record = TransactionRecord::new(id, self.run_id.clone(), status, &inputs, outputs, error);
        if let Some(dropped) = self.res.task_log.push(LogTask::Transaction(record)).await {
            debug!(node_id = %dropped.node_id(), "dropped oldest transaction record");
        }
    }

    async fn emit(&self, result: NodeResult) {
        if let Some(tx) = &self.results_tx {
            // A dropped receiver only means nobody is streaming.
            let _ = tx.send(result).await;
        }
    }

    fn slug_of(&self, id: &str) -> String {
        self.scheduler
            .node(id)
            .map(|n| n.slug.clone())
            .unwrap_or_default()
    }

    /// Stop dispatching, release pause waits, let in-flight builds settle.
    async fn shutdown(&mut self, tasks: &mut JoinSet<Joined>) -> Result<RunReport> {
        warn!(run_id = %self.run_id, in_flight = tasks.len(), "run cancelled; waiting for in-flight builds");
        self.cancel.cancel();
        self.res.pause.cancel(&self.run_id);

        while let Some(joined) = tasks.join_next().await {
            if let Ok((id, result)) = joined {
                self.on_build_finished(id, result).await;
            }
        }
        Err(FlowError::Cancelled)
    }
}

/// Build in a nested task so a panicking node only fails that node.
async fn run_isolated(id: &str, job: BuildJob) -> Result<BuildSuccess> {
    let handle = tokio::spawn(build_node(job));
    let _abort = AbortOnDrop(handle.abort_handle());

    match handle.await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(FlowError::node_build(id, "node build panicked")),
        Err(err) => Err(FlowError::node_build(id, err)),
    }
}

/// Aborts the nested build if the outer task is aborted.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
