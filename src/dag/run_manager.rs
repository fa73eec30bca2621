// src/dag/run_manager.rs

//! Live dependency maps and ready queue for one run.
//!
//! `predecessors[n]` is the set of nodes `n` still waits on and
//! `dependents[m]` the set of nodes still waiting on `m`. Every mutation
//! keeps the two maps exact inverses of each other.
//!
//! Observers see one `Before` and one `After` [`MutationEvent`] per
//! mutating operation. With no observer registered no event is built and
//! the step counter stays at zero.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::dag::graph::DagGraph;
use crate::types::{NodeId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    ExtendQueue,
    PopReady,
    AddDynamicDependency,
    Complete,
}

/// Notification around a scheduling-state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub run_id: RunId,
    /// Counter value for this operation; `Before` and `After` share it.
    pub step: u64,
    pub phase: MutationPhase,
    pub kind: MutationKind,
    pub node_ids: Vec<NodeId>,
}

pub type Observer = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

pub struct RunManager {
    run_id: RunId,
    predecessors: HashMap<NodeId, HashSet<NodeId>>,
    dependents: HashMap<NodeId, HashSet<NodeId>>,
    ready: VecDeque<NodeId>,
    observers: Vec<Observer>,
    step: u64,
}

impl fmt::Debug for RunManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunManager")
            .field("run_id", &self.run_id)
            .field("predecessors", &self.predecessors)
            .field("dependents", &self.dependents)
            .field("ready", &self.ready)
            .field("observers", &self.observers.len())
            .field("step", &self.step)
            .finish()
    }
}

impl RunManager {
    /// Seed the maps from the static graph, restricted to `members`.
    ///
    /// The ready queue starts empty; call [`initial_ready`](Self::initial_ready)
    /// and [`extend_queue`](Self::extend_queue) to start the run.
    pub fn new(
        run_id: impl Into<RunId>,
        graph: &DagGraph,
        members: &HashSet<NodeId>,
        observers: Vec<Observer>,
    ) -> Self {
        let mut predecessors: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        let mut dependents: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();

        for id in graph.nodes().filter(|id| members.contains(*id)) {
            predecessors.entry(id.to_string()).or_default();
            dependents.entry(id.to_string()).or_default();
        }

        for id in graph.nodes().filter(|id| members.contains(*id)) {
            for dep in graph.dependencies_of(id) {
                if !members.contains(dep) {
                    continue;
                }
                predecessors
                    .entry(id.to_string())
                    .or_default()
                    .insert(dep.clone());
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(id.to_string());
            }
        }

        Self {
            run_id: run_id.into(),
            predecessors,
            dependents,
            ready: VecDeque::new(),
            observers,
            step: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn register_observer(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    /// Number of observed operations so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Members with nothing left to wait on, in `graph`'s build order.
    pub fn initial_ready(&self, graph: &DagGraph) -> Vec<NodeId> {
        graph
            .build_order()
            .into_iter()
            .filter(|id| self.predecessors.get(id).is_some_and(|p| p.is_empty()))
            .collect()
    }

    /// Append ready ids as one observed operation.
    pub fn extend_queue(&mut self, ids: Vec<NodeId>) {
        if ids.is_empty() {
            return;
        }
        let step = self.begin(MutationKind::ExtendQueue, || ids.clone());
        self.ready.extend(ids);
        self.end(step, MutationKind::ExtendQueue, || self.ready.iter().cloned().collect());
    }

    pub fn pop_ready(&mut self) -> Option<NodeId> {
        if self.ready.is_empty() {
            return None;
        }
        let step = self.begin(MutationKind::PopReady, Vec::new);
        let id = self.ready.pop_front();
        self.end(step, MutationKind::PopReady, || id.iter().cloned().collect());
        id
    }

    /// Make `dependent` wait on `dependency`, updating both maps together.
    ///
    /// No cycle check is performed; a cycle introduced here leaves both
    /// nodes waiting forever and is caught by the run's liveness check.
    pub fn add_dynamic_dependency(&mut self, dependent: &str, dependency: &str) {
        let step = self.begin(MutationKind::AddDynamicDependency, || {
            vec![dependent.to_string(), dependency.to_string()]
        });

        self.predecessors
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.dependents
            .entry(dependency.to_string())
            .or_default()
            .insert(dependent.to_string());
        trace!(run_id = %self.run_id, dependent, dependency, "dynamic dependency added");

        self.end(step, MutationKind::AddDynamicDependency, || {
            vec![dependent.to_string(), dependency.to_string()]
        });
    }

    /// Record that `id` was built; returns dependents left with nothing to
    /// wait on. They are not enqueued here.
    pub fn complete(&mut self, id: &str) -> Vec<NodeId> {
        let step = self.begin(MutationKind::Complete, || vec![id.to_string()]);

        let waiting = self.dependents.get_mut(id).map(std::mem::take).unwrap_or_default();
        let mut unblocked: Vec<NodeId> = Vec::new();
        for dependent in waiting {
            if let Some(preds) = self.predecessors.get_mut(&dependent) {
                preds.remove(id);
                if preds.is_empty() {
                    unblocked.push(dependent);
                }
            }
        }
        unblocked.sort();

        self.end(step, MutationKind::Complete, || unblocked.clone());
        unblocked
    }

    pub fn predecessors_of(&self, id: &str) -> Option<&HashSet<NodeId>> {
        self.predecessors.get(id)
    }

    pub fn dependents_of(&self, id: &str) -> Option<&HashSet<NodeId>> {
        self.dependents.get(id)
    }

    pub fn is_waiting(&self, id: &str) -> bool {
        self.predecessors.get(id).is_some_and(|p| !p.is_empty())
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_queued(&self, id: &str) -> bool {
        self.ready.iter().any(|r| r == id)
    }

    /// Whether the two maps are exact inverses.
    pub fn is_consistent(&self) -> bool {
        let forward = self
            .predecessors
            .iter()
            .all(|(n, preds)| preds.iter().all(|p| self.dependents.get(p).is_some_and(|d| d.contains(n))));
        let backward = self
            .dependents
            .iter()
            .all(|(n, deps)| deps.iter().all(|d| self.predecessors.get(d).is_some_and(|p| p.contains(n))));
        forward && backward
    }

    fn begin(&mut self, kind: MutationKind, ids: impl FnOnce() -> Vec<NodeId>) -> u64 {
        if self.observers.is_empty() {
            return self.step;
        }
        self.step += 1;
        self.notify(self.step, MutationPhase::Before, kind, ids());
        self.step
    }

    fn end(&self, step: u64, kind: MutationKind, ids: impl FnOnce() -> Vec<NodeId>) {
        if self.observers.is_empty() {
            return;
        }
        self.notify(step, MutationPhase::After, kind, ids());
    }

    fn notify(&self, step: u64, phase: MutationPhase, kind: MutationKind, node_ids: Vec<NodeId>) {
        let event = MutationEvent {
            run_id: self.run_id.clone(),
            step,
            phase,
            kind,
            node_ids,
        };
        for observer in &self.observers {
            observer(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn chain() -> (DagGraph, HashSet<NodeId>) {
        let g = DagGraph::from_parts(["a", "b", "c"], [("a", "b"), ("b", "c")]);
        let members = g.nodes().map(|s| s.to_string()).collect();
        (g, members)
    }

    fn ids(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| format!("n{i}")).collect()
    }

    #[test]
    fn extend_queue_without_observers_never_counts() {
        let (g, members) = chain();
        let mut rm = RunManager::new("run", &g, &members, Vec::new());
        rm.extend_queue(ids(50));
        rm.add_dynamic_dependency("c", "a");
        rm.pop_ready();
        assert_eq!(rm.step(), 0);
        assert_eq!(rm.ready_len(), 49);
    }

    #[test]
    fn extend_queue_emits_one_pair_per_batch() {
        let (g, members) = chain();
        let events: Arc<Mutex<Vec<MutationEvent>>> = Arc::default();
        let sink = Arc::clone(&events);
        let observer: Observer = Arc::new(move |e: &MutationEvent| {
            sink.lock().unwrap().push(e.clone());
        });

        let mut rm = RunManager::new("run", &g, &members, vec![observer]);
        rm.extend_queue(ids(25));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, MutationPhase::Before);
        assert_eq!(events[1].phase, MutationPhase::After);
        assert_eq!(events[0].step, events[1].step);
        assert!(events.iter().all(|e| e.kind == MutationKind::ExtendQueue));
        assert_eq!(rm.step(), 1);
    }

    #[test]
    fn dynamic_dependency_updates_both_maps() {
        let (g, members) = chain();
        let mut rm = RunManager::new("run", &g, &members, Vec::new());
        rm.add_dynamic_dependency("a", "c");
        assert!(rm.predecessors_of("a").unwrap().contains("c"));
        assert!(rm.dependents_of("c").unwrap().contains("a"));
        assert!(rm.is_consistent());
    }

    #[test]
    fn complete_releases_dependents() {
        let (g, members) = chain();
        let mut rm = RunManager::new("run", &g, &members, Vec::new());
        assert_eq!(rm.initial_ready(&g), vec!["a".to_string()]);
        assert_eq!(rm.complete("a"), vec!["b".to_string()]);
        assert!(!rm.is_waiting("b"));
        assert!(rm.is_waiting("c"));
        assert!(rm.is_consistent());
    }

    #[test]
    fn members_outside_the_run_are_ignored() {
        let (g, _) = chain();
        let members: HashSet<NodeId> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        let rm = RunManager::new("run", &g, &members, Vec::new());
        assert_eq!(rm.initial_ready(&g), vec!["b".to_string()]);
        assert!(rm.predecessors_of("a").is_none());
    }
}
