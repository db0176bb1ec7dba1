// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet};

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::errors::{JobflowError, Result};
use crate::types::{DependencyType, TaskId};

/// Tasks of one workflow plus their typed dependency edges.
///
/// Edge direction is `source -> target`: the target waits for the source.
/// Storage is a petgraph [`DiGraphMap`]; the cycle check and the orderings
/// are done explicitly here so the graph can be validated after every single
/// mutation and rolled back.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraphMap<TaskId, DependencyType>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from task ids and `(source, target, type)` edges.
    ///
    /// Every edge goes through [`DependencyGraph::try_add_edge`], so the
    /// first invalid edge aborts construction.
    pub fn from_parts(
        tasks: impl IntoIterator<Item = TaskId>,
        edges: impl IntoIterator<Item = (TaskId, TaskId, DependencyType)>,
    ) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task);
        }
        for (source, target, kind) in edges {
            graph.try_add_edge(source, target, kind)?;
        }
        Ok(graph)
    }

    pub fn add_task(&mut self, task: TaskId) {
        self.graph.add_node(task);
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.graph.contains_node(task)
    }

    /// All task ids, ascending.
    pub fn tasks(&self) -> BTreeSet<TaskId> {
        self.graph.nodes().collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Edges as `(source, target, type)`, sorted.
    pub fn edges(&self) -> Vec<(TaskId, TaskId, DependencyType)> {
        let mut out: Vec<_> = self
            .graph
            .all_edges()
            .map(|(s, t, kind)| (s, t, *kind))
            .collect();
        out.sort_by_key(|(s, t, _)| (*s, *t));
        out
    }

    /// Insert an edge, keeping the graph acyclic.
    ///
    /// Self loops, unknown endpoints and duplicate pairs are rejected
    /// up front. Otherwise the edge is inserted, the cycle check re-run, and
    /// the insert undone if a cycle appeared. On any error the graph is
    /// exactly as before.
    pub fn try_add_edge(
        &mut self,
        source: TaskId,
        target: TaskId,
        kind: DependencyType,
    ) -> Result<()> {
        if source == target {
            return Err(JobflowError::InvalidDependency(format!(
                "{source} cannot depend on itself"
            )));
        }
        for endpoint in [source, target] {
            if !self.graph.contains_node(endpoint) {
                return Err(JobflowError::InvalidDependency(format!(
                    "{endpoint} is not part of this workflow"
                )));
            }
        }
        if self.graph.contains_edge(source, target) {
            return Err(JobflowError::InvalidDependency(format!(
                "dependency {source} -> {target} already exists"
            )));
        }

        self.graph.add_edge(source, target, kind);
        if self.has_cycle() {
            self.graph.remove_edge(source, target);
            return Err(JobflowError::CycleDetected(format!(
                "adding {source} -> {target} would create a cycle"
            )));
        }

        debug!(%source, %target, ?kind, "dependency added");
        Ok(())
    }

    /// Remove an edge; returns its type if it existed.
    pub fn remove_edge(&mut self, source: TaskId, target: TaskId) -> Option<DependencyType> {
        self.graph.remove_edge(source, target)
    }

    /// Depth-first search with a visited set and an on-stack set.
    ///
    /// An edge back to a node still on the stack is a cycle.
    pub fn has_cycle(&self) -> bool {
        let mut visited = BTreeSet::new();
        let mut on_stack = BTreeSet::new();

        self.graph
            .nodes()
            .any(|node| !visited.contains(&node) && self.dfs_finds_cycle(node, &mut visited, &mut on_stack))
    }

    // Explicit stack of (node, successors not yet explored); long chains
    // must not grow the call stack.
    fn dfs_finds_cycle(
        &self,
        start: TaskId,
        visited: &mut BTreeSet<TaskId>,
        on_stack: &mut BTreeSet<TaskId>,
    ) -> bool {
        let successors = |node: TaskId| -> Vec<TaskId> {
            self.graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect()
        };

        visited.insert(start);
        on_stack.insert(start);
        let mut stack = vec![(start, successors(start))];

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            match top.1.pop() {
                Some(next) if on_stack.contains(&next) => return true,
                Some(next) if !visited.contains(&next) => {
                    visited.insert(next);
                    on_stack.insert(next);
                    stack.push((next, successors(next)));
                }
                Some(_) => {}
                None => {
                    on_stack.remove(&node);
                    stack.pop();
                }
            }
        }
        false
    }

    /// Kahn's algorithm. Among tasks that are ready at the same time the
    /// smallest id comes first, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let mut in_degree = self.in_degrees();
        let mut ready: BTreeSet<TaskId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(task, _)| *task)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(task) = ready.pop_first() {
            order.push(task);
            for next in self.graph.neighbors_directed(task, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() < self.len() {
            return Err(JobflowError::CycleDetected(format!(
                "only {} of {} tasks could be ordered",
                order.len(),
                self.len()
            )));
        }
        Ok(order)
    }

    /// Kahn levels: wave `n` holds the tasks whose longest dependency chain
    /// has length `n`. These are the dispatch waves of a run in which every
    /// task succeeds.
    pub fn waves(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut in_degree = self.in_degrees();
        let mut current: Vec<TaskId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(task, _)| *task)
            .collect();

        let mut waves = Vec::new();
        let mut seen = 0;
        while !current.is_empty() {
            seen += current.len();
            let mut next_wave = BTreeSet::new();
            for task in &current {
                for next in self.graph.neighbors_directed(*task, Direction::Outgoing) {
                    if let Some(deg) = in_degree.get_mut(&next) {
                        *deg -= 1;
                        if *deg == 0 {
                            next_wave.insert(next);
                        }
                    }
                }
            }
            waves.push(std::mem::take(&mut current));
            current = next_wave.into_iter().collect();
        }

        if seen < self.len() {
            return Err(JobflowError::CycleDetected(
                "graph has tasks that never become ready".to_string(),
            ));
        }
        Ok(waves)
    }

    fn in_degrees(&self) -> BTreeMap<TaskId, usize> {
        self.graph
            .nodes()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect()
    }

    /// Whether every incoming edge of `task` is satisfied.
    ///
    /// `SuccessRequired` needs the source in `completed`;
    /// `CompletionRequired` accepts `completed` or `failed`.
    pub fn is_satisfied(
        &self,
        task: TaskId,
        completed: &BTreeSet<TaskId>,
        failed: &BTreeSet<TaskId>,
    ) -> bool {
        self.graph
            .neighbors_directed(task, Direction::Incoming)
            .all(|source| match self.graph.edge_weight(source, task) {
                Some(DependencyType::CompletionRequired) => {
                    completed.contains(&source) || failed.contains(&source)
                }
                _ => completed.contains(&source),
            })
    }

    /// Unfinished tasks whose dependencies are all satisfied.
    pub fn eligible_tasks(
        &self,
        completed: &BTreeSet<TaskId>,
        failed: &BTreeSet<TaskId>,
    ) -> BTreeSet<TaskId> {
        self.graph
            .nodes()
            .filter(|t| !completed.contains(t) && !failed.contains(t))
            .filter(|t| self.is_satisfied(*t, completed, failed))
            .collect()
    }

    /// Tasks with no incoming edges.
    pub fn roots(&self) -> BTreeSet<TaskId> {
        self.graph
            .nodes()
            .filter(|n| {
                self.graph
                    .neighbors_directed(*n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Direct predecessors of `task` with the edge type.
    pub fn dependencies_of(&self, task: TaskId) -> Vec<(TaskId, DependencyType)> {
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(task, Direction::Incoming)
            .filter_map(|source| self.graph.edge_weight(source, task).map(|k| (source, *k)))
            .collect();
        deps.sort_by_key(|(t, _)| *t);
        deps
    }

    /// Direct successors of `task` with the edge type.
    pub fn dependents_of(&self, task: TaskId) -> Vec<(TaskId, DependencyType)> {
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(task, Direction::Outgoing)
            .filter_map(|target| self.graph.edge_weight(task, target).map(|k| (target, *k)))
            .collect();
        deps.sort_by_key(|(t, _)| *t);
        deps
    }

    /// `task` plus everything reachable from it.
    pub fn downstream_closure(&self, task: TaskId) -> BTreeSet<TaskId> {
        let mut closure = BTreeSet::new();
        if !self.contains(task) {
            return closure;
        }

        let mut stack = vec![task];
        while let Some(node) = stack.pop() {
            if closure.insert(node) {
                stack.extend(self.graph.neighbors_directed(node, Direction::Outgoing));
            }
        }
        closure
    }

    /// Tasks that can never become eligible because a chain of
    /// `SuccessRequired` edges leads back to a task in `failed`.
    ///
    /// Tasks already in `completed` or `failed` are never reported.
    pub fn blocked_by_failure(
        &self,
        completed: &BTreeSet<TaskId>,
        failed: &BTreeSet<TaskId>,
    ) -> BTreeSet<TaskId> {
        let mut blocked = BTreeSet::new();
        let mut stack: Vec<TaskId> = failed.iter().copied().collect();

        while let Some(node) = stack.pop() {
            for (next, kind) in self.dependents_of(node) {
                if kind != DependencyType::SuccessRequired
                    || completed.contains(&next)
                    || failed.contains(&next)
                {
                    continue;
                }
                if blocked.insert(next) {
                    stack.push(next);
                }
            }
        }
        blocked
    }
}
