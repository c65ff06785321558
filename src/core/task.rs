//! Task data model for the scheduling DAG.
//!
//! Tasks are the atomic units of work assigned to agents. Each task
//! tracks its capability requirement, status, retry budget, assignment,
//! and timing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentId, Capability};

/// Unique identifier for a task within a project.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// The machine is Pending -> Ready -> Dispatched -> {Completed |
/// FailedRetryable -> Ready | Blocked}. A blocked task leaves scheduling
/// until a human resolves its blocker and the task is reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// One or more dependencies are not yet completed.
    Pending,
    /// Dependencies satisfied, awaiting an agent.
    Ready,
    /// Agent assigned, execution in flight.
    Dispatched,
    /// Execution succeeded and passed quality-gate validation.
    Completed,
    /// Execution failed with retries remaining; re-enters Ready.
    FailedRetryable {
        /// Error message from the most recent attempt.
        error: String,
    },
    /// Retries exhausted or unrecoverable failure; awaiting human resolution.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Stable key used for persistence and status counts.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Completed => "completed",
            TaskStatus::FailedRetryable { .. } => "failed_retryable",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::FailedRetryable { error } => write!(f, "failed_retryable: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// A single task in the scheduling DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// The kind of worker agent this task requires.
    pub required_capability: Capability,
    /// Current scheduling status.
    pub status: TaskStatus,
    /// Dispatch ordinal: lower values dispatch first; ties are FIFO.
    pub priority: u32,
    /// Retryable failures consumed so far.
    pub retry_count: u32,
    /// ID of the agent currently or last assigned to this task.
    pub assigned_agent_id: Option<AgentId>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task with default priority.
    pub fn new(name: &str, description: &str, capability: Capability) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            required_capability: capability,
            status: TaskStatus::Pending,
            priority: 0,
            retry_count: 0,
            assigned_agent_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the dispatch priority (builder style).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Transition Pending -> Ready once dependencies are satisfied.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Transition Ready -> Dispatched, recording the assigned agent.
    pub fn dispatch(&mut self, agent_id: AgentId) {
        self.status = TaskStatus::Dispatched;
        self.assigned_agent_id = Some(agent_id);
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as successfully completed.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Record a retryable failure, consuming one retry.
    pub fn fail_retryable(&mut self, error: &str) {
        self.status = TaskStatus::FailedRetryable {
            error: error.to_string(),
        };
        self.retry_count += 1;
        self.assigned_agent_id = None;
    }

    /// Mark the task as blocked, removing it from scheduling.
    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        self.assigned_agent_id = None;
        self.completed_at = Some(Utc::now());
    }

    /// Manual reset after a human resolves the blocker.
    ///
    /// Returns the task to Pending with a fresh retry budget; the graph
    /// re-evaluates its dependencies to decide if it is Ready.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.assigned_agent_id = None;
        self.started_at = None;
        self.completed_at = None;
    }

    /// Check if the task is in a terminal state (Completed or Blocked).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Blocked { .. }
        )
    }

    /// Check if the task is awaiting dispatch.
    pub fn is_ready(&self) -> bool {
        matches!(self.status, TaskStatus::Ready)
    }
}
