//! Worker agent data model.
//!
//! Agents are reusable execution handles, each bound to one capability
//! type and working on at most one task at a time. The pool owns their
//! lifecycle; this module only defines the records and transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::TaskId;

/// Unique identifier for a worker agent.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Create a new unique agent identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Specialization of a worker agent.
///
/// Capabilities form a closed set: every task names the capability it
/// requires, and the pool only hands out agents of that capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Server-side implementation work.
    Backend,
    /// UI and client-side implementation work.
    Frontend,
    /// Test authoring and maintenance.
    Test,
    /// Code review and acceptance checks.
    Review,
}

impl Capability {
    /// All capability variants, in a stable order.
    pub const ALL: [Capability; 4] = [
        Capability::Backend,
        Capability::Frontend,
        Capability::Test,
        Capability::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Backend => "backend",
            Capability::Frontend => "frontend",
            Capability::Test => "test",
            Capability::Review => "review",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Agent status in its lifecycle.
///
/// The current task is carried inside `Busy`, so an agent can never be
/// marked busy without a task or hold a task while idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum AgentStatus {
    /// Available for acquisition.
    Idle,
    /// Executing a task.
    Busy {
        /// The task this agent is working on.
        task_id: TaskId,
    },
    /// Marked for destruction; no longer acquirable.
    Retiring,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy { task_id } => write!(f, "busy: {}", task_id.short()),
            AgentStatus::Retiring => write!(f, "retiring"),
        }
    }
}

/// A reusable worker agent handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAgent {
    /// Unique identifier for this agent.
    pub id: AgentId,
    /// The one capability this agent serves.
    pub capability: Capability,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Number of tasks this agent has completed successfully.
    pub tasks_completed: u64,
    /// When the agent was created.
    pub created_at: DateTime<Utc>,
    /// Last time the agent was assigned or released.
    pub last_active_at: DateTime<Utc>,
}

impl WorkerAgent {
    /// Create a new idle agent for the given capability.
    pub fn new(capability: Capability) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            capability,
            status: AgentStatus::Idle,
            tasks_completed: 0,
            created_at: now,
            last_active_at: now,
        }
    }

    /// The task currently held, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        match self.status {
            AgentStatus::Busy { task_id } => Some(task_id),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status, AgentStatus::Idle)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.status, AgentStatus::Busy { .. })
    }

    /// Assign a task, transitioning Idle -> Busy.
    pub fn assign(&mut self, task_id: TaskId) {
        self.status = AgentStatus::Busy { task_id };
        self.last_active_at = Utc::now();
    }

    /// Release the agent back to Idle.
    ///
    /// A successful release counts toward `tasks_completed`.
    pub fn release(&mut self, success: bool) {
        self.status = AgentStatus::Idle;
        if success {
            self.tasks_completed += 1;
        }
        self.last_active_at = Utc::now();
    }

    /// Mark the agent for destruction.
    pub fn begin_retirement(&mut self) {
        self.status = AgentStatus::Retiring;
    }

    /// How long the agent has been inactive as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_active_at
    }
}
