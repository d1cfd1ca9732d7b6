//! Dependency graph for a job's tasks.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (successors)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! The same graph answers every dependency question: initial
//! `outstanding_predecessors` at registration, direct successors on
//! completion and descendants for skip propagation.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::domain::{TaskDefinition, TaskEdge, TaskId};

/// Where the dependency edges of a job come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredecessorSource {
    /// The job has `task_edges` rows.
    Edges,
    /// No edge rows: follow `next_id` pointers, or creation order when no
    /// task carries one (`implicit`).
    LegacyChain { implicit: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle among tasks {0:?}")]
    Cycle(Vec<TaskId>),
}

/// Dependency graph for tracking task dependencies.
///
/// This graph maintains both forward and reverse edges for efficient lookups:
/// - `edges`: TaskId -> Set of TaskIds it depends on
/// - `reverse_edges`: TaskId -> TaskIds waiting for it, in insertion order
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Tasks in definition (creation) order.
    nodes: Vec<TaskId>,
    known: HashSet<TaskId>,

    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it
    reverse_edges: HashMap<TaskId, Vec<TaskId>>,

    source: PredecessorSource,
}

impl DependencyGraph {
    /// Create an empty edge-backed graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            known: HashSet::new(),
            edges: HashMap::new(),
            reverse_edges: HashMap::new(),
            source: PredecessorSource::Edges,
        }
    }

    /// Build the graph of one job.
    ///
    /// `tasks` must be in creation order. Edges pointing at tasks outside
    /// the job are ignored and duplicate edges count once.
    pub fn from_definitions(tasks: &[TaskDefinition], edges: &[TaskEdge]) -> Self {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task.id);
        }

        if !edges.is_empty() {
            for edge in edges {
                graph.add_dependency(edge.to_task_id, edge.from_task_id);
            }
            return graph;
        }

        let has_pointers = tasks.iter().any(|t| t.next_id.is_some());
        graph.source = PredecessorSource::LegacyChain {
            implicit: !has_pointers,
        };
        if has_pointers {
            for task in tasks {
                if let Some(next) = task.next_id {
                    graph.add_dependency(next, task.id);
                }
            }
        } else {
            for pair in tasks.windows(2) {
                graph.add_dependency(pair[1].id, pair[0].id);
            }
        }
        graph
    }

    pub fn source(&self) -> PredecessorSource {
        self.source
    }

    pub fn add_task(&mut self, task: TaskId) {
        if self.known.insert(task) {
            self.nodes.push(task);
        }
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A".
    /// Unknown endpoints and duplicates are ignored.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        if !self.known.contains(&task) || !self.known.contains(&depends_on) {
            return;
        }
        if self.edges.entry(task).or_default().insert(depends_on) {
            self.reverse_edges.entry(depends_on).or_default().push(task);
        }
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.known.contains(&task)
    }

    /// Number of direct predecessors: the initial `outstanding_predecessors`.
    pub fn indegree(&self, task: TaskId) -> u32 {
        self.edges
            .get(&task)
            .map(|deps| deps.len() as u32)
            .unwrap_or(0)
    }

    /// Get all dependencies of a task.
    pub fn dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct successors, in the order their edges were added.
    pub fn successors(&self, task: TaskId) -> &[TaskId] {
        self.reverse_edges
            .get(&task)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every task reachable from `task`, breadth-first, excluding `task`.
    pub fn descendants(&self, task: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::from([task]);
        let mut queue = VecDeque::from([task]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            for &next in self.successors(current) {
                if seen.insert(next) {
                    out.push(next);
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// Kahn's algorithm. Ties keep creation order.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        let mut remaining: HashMap<TaskId, u32> =
            self.nodes.iter().map(|&t| (t, self.indegree(t))).collect();
        let mut ready: VecDeque<TaskId> = self
            .nodes
            .iter()
            .copied()
            .filter(|t| remaining.get(t) == Some(&0))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(task) = ready.pop_front() {
            order.push(task);
            for &next in self.successors(task) {
                if let Some(count) = remaining.get_mut(&next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let placed: HashSet<TaskId> = order.into_iter().collect();
            let stuck = self
                .nodes
                .iter()
                .copied()
                .filter(|t| !placed.contains(t))
                .collect();
            Err(GraphError::Cycle(stuck))
        }
    }

    /// Tasks that can never become ready because they sit on (or behind) a cycle.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        self.topological_order().err().map(|GraphError::Cycle(tasks)| tasks)
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
