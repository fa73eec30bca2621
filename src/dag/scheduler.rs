// src/dag/scheduler.rs

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::dag::graph::DagGraph;
use crate::dag::node::{Node, NodeState};
use crate::dag::run_manager::{Observer, RunManager};
use crate::dag::scheduler_step::{DynamicCheck, SchedulerStep};
use crate::errors::Result;
use crate::types::NodeId;

/// Outcome of a node build, as far as scheduling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Built,
    Errored,
}

/// Per-run state machine: decides which nodes are ready, tracks node
/// states, and blocks the dependents of failed nodes.
///
/// It is synchronous and owned by a single run loop, so mutation events
/// are delivered in issue order.
#[derive(Debug)]
pub struct Scheduler {
    graph: DagGraph,
    nodes: BTreeMap<NodeId, Node>,
    members: HashSet<NodeId>,
    run: RunManager,
    /// Blocked node -> the failed node that blocked it.
    blocked: HashMap<NodeId, NodeId>,
    started: bool,
}

impl Scheduler {
    pub fn new(
        run_id: impl Into<String>,
        graph: DagGraph,
        nodes: BTreeMap<NodeId, Node>,
        members: HashSet<NodeId>,
        observers: Vec<Observer>,
    ) -> Self {
        let run = RunManager::new(run_id, &graph, &members, observers);
        Self {
            graph,
            nodes,
            members,
            run,
            blocked: HashMap::new(),
            started: false,
        }
    }

    pub fn run_id(&self) -> &str {
        self.run.run_id()
    }

    pub fn run_manager(&self) -> &RunManager {
        &self.run
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(Node::state)
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn blocked_by(&self, id: &str) -> Option<&str> {
        self.blocked.get(id).map(String::as_str)
    }

    /// Enqueue every member with no predecessors. Idempotent.
    pub fn start(&mut self) -> SchedulerStep {
        if self.started {
            return SchedulerStep::default();
        }
        self.started = true;

        let ready = self.run.initial_ready(&self.graph);
        info!(
            run_id = %self.run.run_id(),
            members = self.members.len(),
            initial = ready.len(),
            "scheduler: starting run"
        );
        self.run.extend_queue(ready.clone());

        SchedulerStep {
            newly_ready: ready,
            run_just_finished: self.is_finished(),
            ..SchedulerStep::default()
        }
    }

    /// Next node to consider building. Blocked or already-started nodes
    /// that somehow reached the queue are skipped.
    pub fn next_ready(&mut self) -> Option<NodeId> {
        while let Some(id) = self.run.pop_ready() {
            if self.blocked.contains_key(&id) {
                continue;
            }
            match self.state_of(&id) {
                Some(NodeState::Pending) => return Some(id),
                other => {
                    warn!(node_id = %id, state = ?other, "ready queue held a non-pending node; skipping");
                }
            }
        }
        None
    }

    /// Check the nodes a ready node references at run time.
    ///
    /// Unbuilt members become dynamic dependencies and the node goes back
    /// to waiting; it is re-queued once they are built.
    pub fn check_dynamic(&mut self, id: &str, referenced: &[NodeId]) -> DynamicCheck {
        let mut missing = Vec::new();

        for dep in referenced {
            if dep == id {
                continue;
            }
            if !self.members.contains(dep) {
                return DynamicCheck::OutsideRun(dep.clone());
            }
            if let Some(root) = self.blocked.get(dep) {
                return DynamicCheck::Blocked {
                    upstream: root.clone(),
                };
            }
            match self.state_of(dep) {
                Some(NodeState::Built) => {}
                Some(NodeState::Errored) => {
                    return DynamicCheck::Blocked {
                        upstream: dep.clone(),
                    };
                }
                _ => missing.push(dep.clone()),
            }
        }

        if missing.is_empty() {
            return DynamicCheck::Ready;
        }

        for dep in &missing {
            debug!(node_id = %id, dependency = %dep, "deferring node on dynamic dependency");
            self.run.add_dynamic_dependency(id, dep);
        }
        DynamicCheck::Deferred(missing)
    }

    /// Pending -> Building.
    pub fn mark_building(&mut self, id: &str) -> Result<()> {
        if let Some(node) = self.nodes.get_mut(id) {
            node.transition(NodeState::Building)?;
            debug!(node_id = %id, "dependencies built; marking Building");
        }
        Ok(())
    }

    /// Record that `id` was blocked before it could build.
    pub fn mark_blocked(&mut self, id: &str, upstream: &str) -> SchedulerStep {
        let mut newly_blocked = vec![id.to_string()];
        self.blocked.insert(id.to_string(), upstream.to_string());
        newly_blocked.extend(self.block_dependents(id, upstream));
        SchedulerStep {
            newly_blocked,
            run_just_finished: self.is_finished(),
            ..SchedulerStep::default()
        }
    }

    /// Apply a finished build and return what changed.
    pub fn handle_completion(&mut self, id: &str, outcome: BuildOutcome) -> SchedulerStep {
        let mut step = SchedulerStep::default();

        let Some(node) = self.nodes.get_mut(id) else {
            warn!(node_id = %id, "completion for unknown node; ignoring");
            return step;
        };

        match outcome {
            BuildOutcome::Built => {
                if let Err(err) = node.transition(NodeState::Built) {
                    warn!(node_id = %id, error = %err, "ignoring completion");
                    return step;
                }
                let ready = self.run.complete(id);
                self.run.extend_queue(ready.clone());
                step.newly_ready = ready;
            }
            BuildOutcome::Errored => {
                if let Err(err) = node.transition(NodeState::Errored) {
                    warn!(node_id = %id, error = %err, "ignoring failure");
                    return step;
                }
                warn!(node_id = %id, "node errored; blocking dependents in this run");
                step.newly_blocked = self.block_dependents(id, id);
            }
        }

        step.run_just_finished = self.is_finished();
        step
    }

    /// Mark every still-pending node waiting on `failed` (transitively) as
    /// blocked by `root`.
    fn block_dependents(&mut self, failed: &str, root: &str) -> Vec<NodeId> {
        let mut stack: Vec<NodeId> = self
            .run
            .dependents_of(failed)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        stack.sort();

        let mut newly_blocked = Vec::new();
        while let Some(id) = stack.pop() {
            if self.blocked.contains_key(&id) {
                continue;
            }
            if self.state_of(&id) != Some(NodeState::Pending) {
                continue;
            }
            self.blocked.insert(id.clone(), root.to_string());
            debug!(node_id = %id, upstream = %root, "marking dependent as blocked");
            if let Some(deps) = self.run.dependents_of(&id) {
                stack.extend(deps.iter().cloned());
            }
            newly_blocked.push(id);
        }
        newly_blocked
    }

    /// Members that are neither terminal nor blocked.
    pub fn unresolved(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|id| !self.blocked.contains_key(*id))
            .filter(|id| !self.state_of(id).is_some_and(NodeState::is_terminal))
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every member is Built, Errored or blocked.
    pub fn is_finished(&self) -> bool {
        self.unresolved().is_empty()
    }

    /// Members in a given state, sorted.
    pub fn members_in(&self, state: NodeState) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(id, n)| self.members.contains(*id) && n.state() == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn blocked(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self.blocked.keys().cloned().collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::NodeDefinition;

    fn scheduler(ids: &[&str], edges: &[(&str, &str)]) -> Scheduler {
        let graph = DagGraph::from_parts(ids.iter().copied(), edges.iter().copied());
        let nodes = ids
            .iter()
            .map(|id| {
                let def = NodeDefinition {
                    id: id.to_string(),
                    kind: "static".to_string(),
                    display_name: Some(id.to_string()),
                    config: BTreeMap::new(),
                    inputs: vec![],
                    outputs: vec![],
                    frozen: false,
                };
                (id.to_string(), Node::from_definition(&def, id.to_uppercase()))
            })
            .collect();
        let members = ids.iter().map(|s| s.to_string()).collect();
        Scheduler::new("run", graph, nodes, members, Vec::new())
    }

    fn build(s: &mut Scheduler, id: &str, outcome: BuildOutcome) -> SchedulerStep {
        s.mark_building(id).unwrap();
        s.handle_completion(id, outcome)
    }

    #[test]
    fn chain_runs_in_order() {
        let mut s = scheduler(&["a", "b"], &[("a", "b")]);
        assert_eq!(s.start().newly_ready, vec!["a".to_string()]);
        assert_eq!(s.next_ready().as_deref(), Some("a"));
        assert_eq!(s.next_ready(), None);

        let step = build(&mut s, "a", BuildOutcome::Built);
        assert_eq!(step.newly_ready, vec!["b".to_string()]);
        assert!(!step.run_just_finished);

        assert_eq!(s.next_ready().as_deref(), Some("b"));
        let step = build(&mut s, "b", BuildOutcome::Built);
        assert!(step.run_just_finished);
    }

    #[test]
    fn failure_blocks_transitive_dependents_only() {
        let mut s = scheduler(&["a", "b", "c", "x"], &[("a", "b"), ("b", "c")]);
        s.start();
        s.next_ready();
        s.next_ready();

        let step = build(&mut s, "a", BuildOutcome::Errored);
        let mut blocked = step.newly_blocked.clone();
        blocked.sort();
        assert_eq!(blocked, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(s.blocked_by("c"), Some("a"));
        assert!(!step.run_just_finished);

        let step = build(&mut s, "x", BuildOutcome::Built);
        assert!(step.run_just_finished);
        assert_eq!(s.state_of("b"), Some(NodeState::Pending));
        assert_eq!(s.members_in(NodeState::Errored), vec!["a".to_string()]);
    }

    #[test]
    fn dynamic_dependency_defers_until_built() {
        let mut s = scheduler(&["a", "b"], &[]);
        s.start();
        assert_eq!(s.next_ready().as_deref(), Some("a"));

        // a references b, which has not been built yet.
        let check = s.check_dynamic("a", &["b".to_string()]);
        assert_eq!(check, DynamicCheck::Deferred(vec!["b".to_string()]));

        assert_eq!(s.next_ready().as_deref(), Some("b"));
        assert_eq!(s.check_dynamic("b", &[]), DynamicCheck::Ready);
        let step = build(&mut s, "b", BuildOutcome::Built);
        assert_eq!(step.newly_ready, vec!["a".to_string()]);

        assert_eq!(s.next_ready().as_deref(), Some("a"));
        assert_eq!(s.check_dynamic("a", &["b".to_string()]), DynamicCheck::Ready);
        assert!(build(&mut s, "a", BuildOutcome::Built).run_just_finished);
    }

    #[test]
    fn reference_to_errored_node_blocks() {
        let mut s = scheduler(&["a", "b"], &[]);
        s.start();
        s.next_ready();
        s.next_ready();
        build(&mut s, "a", BuildOutcome::Errored);

        let check = s.check_dynamic("b", &["a".to_string()]);
        assert_eq!(
            check,
            DynamicCheck::Blocked {
                upstream: "a".to_string()
            }
        );
        let step = s.mark_blocked("b", "a");
        assert_eq!(step.newly_blocked, vec!["b".to_string()]);
        assert!(step.run_just_finished);
    }

    #[test]
    fn reference_outside_run_is_reported() {
        let graph = DagGraph::from_parts(["a", "b"], []);
        let mut s = scheduler(&["a", "b"], &[]);
        s.members.remove("b");
        s.run = RunManager::new("run", &graph, &s.members, Vec::new());
        s.start();
        assert_eq!(
            s.check_dynamic("a", &["b".to_string()]),
            DynamicCheck::OutsideRun("b".to_string())
        );
    }

    #[test]
    fn dynamic_cycle_leaves_unresolved_nodes() {
        let mut s = scheduler(&["a", "b"], &[]);
        s.start();
        s.next_ready();
        s.next_ready();
        s.check_dynamic("a", &["b".to_string()]);
        s.check_dynamic("b", &["a".to_string()]);
        assert_eq!(s.next_ready(), None);
        assert_eq!(s.unresolved(), vec!["a".to_string(), "b".to_string()]);
        assert!(!s.is_finished());
    }
}
