//! Task graph for dependency resolution.
//!
//! This module owns the task DAG and answers "what can run now". Ready
//! tasks are maintained incrementally: every task carries a counter of
//! unsatisfied dependencies, and completions decrement the counters of
//! their dependents instead of rescanning the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;

use crate::agent::AgentId;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// Ordering key for the ready-set.
///
/// Lower priority values dispatch first; ties fall back to creation time
/// (FIFO) and finally the id so keys are always distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: u32,
    created_at: DateTime<Utc>,
    id: TaskId,
}

impl ReadyKey {
    fn of(task: &Task) -> Self {
        Self {
            priority: task.priority,
            created_at: task.created_at,
            id: task.id,
        }
    }
}

/// Count of tasks per status, for observability snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub ready: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed_retryable: usize,
    pub blocked: usize,
    pub total: usize,
}

/// The task dependency graph.
///
/// Nodes are tasks; an edge `a -> b` means `a` must complete before `b`
/// can start. A `HashMap` keyed by `TaskId` maps into the graph's node
/// arena, an unsatisfied-dependency counter per task drives unblocking,
/// and an ordered ready-set serves dispatch without graph scans.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Per-task count of dependencies not yet completed.
    unsatisfied: HashMap<TaskId, usize>,
    /// Tasks whose dependencies are all satisfied, in dispatch order.
    ready: BTreeSet<ReadyKey>,
}

impl TaskGraph {
    /// Create a new empty TaskGraph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            unsatisfied: HashMap::new(),
            ready: BTreeSet::new(),
        }
    }

    /// Build a graph from tasks and dependency pairs.
    ///
    /// Each pair `(a, b)` declares that `a` must complete before `b`.
    /// Tasks submitted with status `Completed` count as satisfied
    /// dependencies; everything else (except `Blocked`) is normalized to
    /// `Pending` and promoted to `Ready` if it has no open dependencies.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` naming the offending cycle, or an internal
    /// consistency error if a pair references an unknown task. On any
    /// error no graph is returned; the caller keeps whatever it had.
    pub fn build(tasks: Vec<Task>, dependencies: &[(TaskId, TaskId)]) -> Result<Self> {
        let mut g = Self::new();

        for mut task in tasks {
            if g.task_index.contains_key(&task.id) {
                continue;
            }
            match task.status {
                TaskStatus::Completed | TaskStatus::Blocked { .. } => {}
                _ => task.status = TaskStatus::Pending,
            }
            let id = task.id;
            let index = g.graph.add_node(task);
            g.task_index.insert(id, index);
        }

        for (from, to) in dependencies {
            if from == to {
                let name = g
                    .get_task(from)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| from.short());
                return Err(Error::CycleDetected {
                    cycle: format!("{} -> {}", name, name),
                });
            }
            let from_index = *g.task_index.get(from).ok_or_else(|| {
                Error::internal(format!("dependency pair references unknown task {}", from))
            })?;
            let to_index = *g.task_index.get(to).ok_or_else(|| {
                Error::internal(format!("dependency pair references unknown task {}", to))
            })?;
            if g.graph.find_edge(from_index, to_index).is_none() {
                g.graph.add_edge(from_index, to_index, ());
            }
        }

        if let Some(cycle) = g.find_cycle() {
            return Err(Error::CycleDetected {
                cycle: g.describe_cycle(&cycle),
            });
        }

        g.recompute_ready();
        Ok(g)
    }

    /// Recompute every unsatisfied counter and rebuild the ready-set.
    ///
    /// Used at build time and after manual resets; steady-state updates
    /// are incremental.
    fn recompute_ready(&mut self) {
        self.unsatisfied.clear();
        self.ready.clear();

        let mut promote = Vec::new();
        for index in self.graph.node_indices() {
            let open_deps = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter(|dep| {
                    self.graph
                        .node_weight(*dep)
                        .map(|t| !matches!(t.status, TaskStatus::Completed))
                        .unwrap_or(false)
                })
                .count();

            if let Some(task) = self.graph.node_weight(index) {
                self.unsatisfied.insert(task.id, open_deps);
                if open_deps == 0 && matches!(task.status, TaskStatus::Pending) {
                    promote.push(index);
                }
            }
        }

        for index in promote {
            if let Some(task) = self.graph.node_weight_mut(index) {
                task.mark_ready();
                self.ready.insert(ReadyKey::of(task));
            }
        }
    }

    // ========== Queries ==========

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    /// Get all tasks in the graph.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// IDs of the tasks the given task depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbor_ids(id, Direction::Incoming)
    }

    /// IDs of the tasks that depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbor_ids(id, Direction::Outgoing)
    }

    fn neighbor_ids(&self, id: &TaskId, dir: Direction) -> Vec<TaskId> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph
                .neighbors_directed(index, dir)
                .filter_map(|n| self.graph.node_weight(n).map(|t| t.id))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Tasks ready to dispatch, ordered by priority then creation time.
    ///
    /// This is a snapshot of the incrementally maintained ready-set; no
    /// graph traversal happens here.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.ready.iter().map(|k| k.id).collect()
    }

    /// Check if every task is completed.
    pub fn all_complete(&self) -> bool {
        self.graph
            .node_weights()
            .all(|t| matches!(t.status, TaskStatus::Completed))
    }

    /// Check if the graph has reached a fixed point.
    ///
    /// Settled means nothing can make progress without outside
    /// intervention: no task is Ready, Dispatched, or awaiting requeue.
    /// Remaining Pending tasks are transitively blocked.
    pub fn is_settled(&self) -> bool {
        self.ready.is_empty()
            && !self.graph.node_weights().any(|t| {
                matches!(
                    t.status,
                    TaskStatus::Ready
                        | TaskStatus::Dispatched
                        | TaskStatus::FailedRetryable { .. }
                )
            })
    }

    /// Count of tasks per status.
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.graph.node_weights() {
            counts.total += 1;
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Dispatched => counts.dispatched += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::FailedRetryable { .. } => counts.failed_retryable += 1,
                TaskStatus::Blocked { .. } => counts.blocked += 1,
            }
        }
        counts
    }

    /// Map each waiting task to the dependencies still holding it back.
    pub fn waiting_on(&self) -> BTreeMap<TaskId, Vec<TaskId>> {
        let mut waiting = BTreeMap::new();
        for index in self.graph.node_indices() {
            let task = match self.graph.node_weight(index) {
                Some(t) if !t.is_terminal() => t,
                _ => continue,
            };
            let open: Vec<TaskId> = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| self.graph.node_weight(dep))
                .filter(|dep| !matches!(dep.status, TaskStatus::Completed))
                .map(|dep| dep.id)
                .collect();
            if !open.is_empty() {
                waiting.insert(task.id, open);
            }
        }
        waiting
    }

    /// Maximum dependency depth of a task (0 for no dependencies).
    ///
    /// Useful for deriving dispatch priorities: deep tasks sit on long
    /// chains and gate more downstream work.
    pub fn dependency_depth(&self, id: &TaskId) -> usize {
        fn depth(graph: &DiGraph<Task, ()>, index: NodeIndex) -> usize {
            graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|dep| 1 + depth(graph, dep))
                .max()
                .unwrap_or(0)
        }
        self.task_index
            .get(id)
            .map(|&index| depth(&self.graph, index))
            .unwrap_or(0)
    }

    /// Tasks in topological order (every task after its dependencies).
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            Error::CycleDetected {
                cycle: format!("cycle through task {}", name),
            }
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    // ========== State transitions ==========

    /// Transition a Ready task to Dispatched, recording its agent.
    ///
    /// Only the coordination loop calls this; a non-ready argument means
    /// the loop referenced state it never produced.
    pub fn mark_dispatched(&mut self, id: &TaskId, agent_id: AgentId) -> Result<()> {
        let index = self.index_of(id, "mark_dispatched")?;
        let task = self
            .graph
            .node_weight_mut(index)
            .ok_or_else(|| Error::internal(format!("mark_dispatched on unknown task {}", id)))?;
        if !task.is_ready() {
            return Err(Error::internal(format!(
                "mark_dispatched on task {} in state {}",
                id,
                task.status.as_str()
            )));
        }
        self.ready.remove(&ReadyKey::of(task));
        task.dispatch(agent_id);
        Ok(())
    }

    /// Mark a task completed and return its newly unblocked dependents.
    ///
    /// Idempotent: completing an already-completed task is a no-op that
    /// returns an empty list. Each direct dependent has its unsatisfied
    /// counter decremented; dependents reaching zero transition
    /// Pending -> Ready and are returned.
    pub fn mark_completed(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let index = self.index_of(id, "mark_completed")?;

        {
            let task = self
                .graph
                .node_weight_mut(index)
                .ok_or_else(|| Error::internal(format!("mark_completed on unknown task {}", id)))?;
            if matches!(task.status, TaskStatus::Completed) {
                return Ok(Vec::new());
            }
            self.ready.remove(&ReadyKey::of(task));
            task.complete();
        }

        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();

        let mut unblocked = Vec::new();
        for dep_index in dependents {
            let Some(dep) = self.graph.node_weight_mut(dep_index) else {
                continue;
            };
            let counter = self.unsatisfied.entry(dep.id).or_insert(0);
            *counter = counter.saturating_sub(1);
            if *counter == 0 && matches!(dep.status, TaskStatus::Pending) {
                dep.mark_ready();
                self.ready.insert(ReadyKey::of(dep));
                unblocked.push(dep.id);
            }
        }
        Ok(unblocked)
    }

    /// Record a retryable failure, consuming one retry.
    ///
    /// Returns the updated retry count. The task stays out of the
    /// ready-set until `requeue` is called.
    pub fn mark_retryable(&mut self, id: &TaskId, error: &str) -> Result<u32> {
        let index = self.index_of(id, "mark_retryable")?;
        let task = self
            .graph
            .node_weight_mut(index)
            .ok_or_else(|| Error::internal(format!("mark_retryable on unknown task {}", id)))?;
        self.ready.remove(&ReadyKey::of(task));
        task.fail_retryable(error);
        Ok(task.retry_count)
    }

    /// Re-enter a retryable task into the ready-set for the next tick.
    pub fn requeue(&mut self, id: &TaskId) -> Result<()> {
        let index = self.index_of(id, "requeue")?;
        let task = self
            .graph
            .node_weight_mut(index)
            .ok_or_else(|| Error::internal(format!("requeue on unknown task {}", id)))?;
        if !matches!(task.status, TaskStatus::FailedRetryable { .. }) {
            return Err(Error::internal(format!(
                "requeue on task {} in state {}",
                id,
                task.status.as_str()
            )));
        }
        task.mark_ready();
        self.ready.insert(ReadyKey::of(task));
        Ok(())
    }

    /// Block a task; its dependents stay Pending and unreachable.
    pub fn mark_failed(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        let index = self.index_of(id, "mark_failed")?;
        let task = self
            .graph
            .node_weight_mut(index)
            .ok_or_else(|| Error::internal(format!("mark_failed on unknown task {}", id)))?;
        self.ready.remove(&ReadyKey::of(task));
        task.block(reason);
        Ok(())
    }

    /// Manually reset a Blocked task after its blocker is resolved.
    ///
    /// The task returns to Pending with a fresh retry budget and is
    /// promoted to Ready immediately if its dependencies are already
    /// complete. Returns true if it became Ready.
    pub fn reset(&mut self, id: &TaskId) -> Result<bool> {
        let index = self.index_of(id, "reset")?;

        let open_deps = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .filter(|dep| {
                self.graph
                    .node_weight(*dep)
                    .map(|t| !matches!(t.status, TaskStatus::Completed))
                    .unwrap_or(false)
            })
            .count();

        let task = self
            .graph
            .node_weight_mut(index)
            .ok_or_else(|| Error::internal(format!("reset on unknown task {}", id)))?;
        if !matches!(task.status, TaskStatus::Blocked { .. }) {
            return Err(Error::internal(format!(
                "reset on task {} in state {}",
                id,
                task.status.as_str()
            )));
        }

        task.reset();
        self.unsatisfied.insert(task.id, open_deps);
        if open_deps == 0 {
            task.mark_ready();
            self.ready.insert(ReadyKey::of(task));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ========== Runtime mutation ==========

    /// Add a task at runtime.
    ///
    /// The task arrives with no dependencies, so it is Ready immediately
    /// unless submitted in a terminal state.
    pub fn add_task(&mut self, mut task: Task) -> Result<()> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::internal(format!(
                "add_task: task {} already in graph",
                task.id
            )));
        }
        match task.status {
            TaskStatus::Completed | TaskStatus::Blocked { .. } => {}
            _ => task.status = TaskStatus::Pending,
        }
        let id = task.id;
        let pending = matches!(task.status, TaskStatus::Pending);
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        self.unsatisfied.insert(id, 0);
        if pending {
            if let Some(task) = self.graph.node_weight_mut(index) {
                task.mark_ready();
                self.ready.insert(ReadyKey::of(task));
            }
        }
        Ok(())
    }

    /// Add a dependency: `from` must complete before `to`.
    ///
    /// The edge is validated against cycles and rolled back if one would
    /// form, leaving the graph in its last valid state. A `to` task that
    /// was Ready drops back to Pending when the new dependency is open.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        if from == to {
            let name = self
                .get_task(from)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| from.short());
            return Err(Error::CycleDetected {
                cycle: format!("{} -> {}", name, name),
            });
        }
        let from_index = self.index_of(from, "add_dependency")?;
        let to_index = self.index_of(to, "add_dependency")?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if let Some(cycle) = self.find_cycle() {
            self.graph.remove_edge(edge);
            return Err(Error::CycleDetected {
                cycle: self.describe_cycle(&cycle),
            });
        }

        let from_completed = self
            .graph
            .node_weight(from_index)
            .map(|t| matches!(t.status, TaskStatus::Completed))
            .unwrap_or(false);

        if !from_completed {
            if let Some(to_task) = self.graph.node_weight_mut(to_index) {
                *self.unsatisfied.entry(to_task.id).or_insert(0) += 1;
                if to_task.is_ready() {
                    self.ready.remove(&ReadyKey::of(to_task));
                    to_task.status = TaskStatus::Pending;
                }
            }
        }
        Ok(())
    }

    /// Remove a task from the graph.
    ///
    /// Dependents lose the edge: an incomplete removed dependency no
    /// longer counts against them, so they may become Ready.
    pub fn remove_task(&mut self, id: &TaskId) -> Result<Task> {
        let index = self.index_of(id, "remove_task")?;

        let was_completed = self
            .graph
            .node_weight(index)
            .map(|t| matches!(t.status, TaskStatus::Completed))
            .unwrap_or(false);
        let dependent_ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .filter_map(|n| self.graph.node_weight(n).map(|t| t.id))
            .collect();

        if let Some(task) = self.graph.node_weight(index) {
            self.ready.remove(&ReadyKey::of(task));
        }
        self.unsatisfied.remove(id);
        self.task_index.remove(id);

        let removed = self
            .graph
            .remove_node(index)
            .ok_or_else(|| Error::internal(format!("remove_task on unknown task {}", id)))?;

        // petgraph swap-removes: the node that was last now occupies the
        // freed index, so its mapping must be repaired.
        if let Some(moved) = self.graph.node_weight(index) {
            self.task_index.insert(moved.id, index);
        }

        if !was_completed {
            for dep_id in dependent_ids {
                let Some(&dep_index) = self.task_index.get(&dep_id) else {
                    continue;
                };
                let counter = self.unsatisfied.entry(dep_id).or_insert(0);
                *counter = counter.saturating_sub(1);
                if *counter == 0 {
                    if let Some(dep) = self.graph.node_weight_mut(dep_index) {
                        if matches!(dep.status, TaskStatus::Pending) {
                            dep.mark_ready();
                            self.ready.insert(ReadyKey::of(dep));
                        }
                    }
                }
            }
        }

        Ok(removed)
    }

    // ========== Internals ==========

    fn index_of(&self, id: &TaskId, op: &str) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::internal(format!("{} on unknown task {}", op, id)))
    }

    /// Detect a cycle with a three-color depth-first search.
    ///
    /// Returns the node ids along the cycle (ending with a repeat of the
    /// entry node) or None if the graph is acyclic.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        fn visit(
            graph: &DiGraph<Task, ()>,
            node: NodeIndex,
            color: &mut HashMap<NodeIndex, u8>,
            stack: &mut Vec<NodeIndex>,
        ) -> Option<Vec<NodeIndex>> {
            color.insert(node, GRAY);
            stack.push(node);

            for succ in graph.neighbors_directed(node, Direction::Outgoing) {
                match color.get(&succ).copied().unwrap_or(WHITE) {
                    WHITE => {
                        if let Some(cycle) = visit(graph, succ, color, stack) {
                            return Some(cycle);
                        }
                    }
                    GRAY => {
                        // Back edge: the cycle runs from succ to the stack top.
                        let start = stack.iter().position(|&n| n == succ).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(succ);
                        return Some(cycle);
                    }
                    _ => {}
                }
            }

            stack.pop();
            color.insert(node, BLACK);
            None
        }

        let mut color = HashMap::new();
        let mut stack = Vec::new();
        for node in self.graph.node_indices() {
            if color.get(&node).copied().unwrap_or(WHITE) == WHITE {
                if let Some(cycle) = visit(&self.graph, node, &mut color, &mut stack) {
                    return Some(
                        cycle
                            .into_iter()
                            .filter_map(|n| self.graph.node_weight(n).map(|t| t.id))
                            .collect(),
                    );
                }
            }
        }
        None
    }

    fn describe_cycle(&self, cycle: &[TaskId]) -> String {
        cycle
            .iter()
            .map(|id| {
                self.get_task(id)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| id.short())
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("ready", &self.ready.len())
            .finish()
    }
}
