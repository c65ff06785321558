//! Persistence and escalation seams consumed by the scheduler.
//!
//! The engine never owns durable storage: tasks and dependencies come
//! from a `TaskStore`, status changes are written back through it, and
//! tasks that exhaust their retries surface to humans through a
//! `BlockerService`. In-memory implementations back the test suite and
//! small embedders.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::Result;

/// Durable task and dependency storage.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All tasks belonging to a project.
    async fn get_tasks(&self, project_id: &str) -> Result<Vec<Task>>;

    /// IDs of the tasks the given task depends on.
    async fn get_dependencies(&self, task_id: TaskId) -> Result<Vec<TaskId>>;

    /// Record a task's status change.
    async fn persist_status(&self, task_id: TaskId, status: &TaskStatus) -> Result<()>;
}

/// Lifecycle of a human-facing blocker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerStatus {
    /// Awaiting human resolution.
    Open,
    /// Resolved; the task may be reset.
    Resolved,
}

/// A human-facing record of a task that cannot proceed automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blocker {
    pub id: Uuid,
    pub task_id: TaskId,
    pub reason: String,
    pub details: String,
    pub status: BlockerStatus,
    pub created_at: DateTime<Utc>,
}

impl Blocker {
    pub fn new(task_id: TaskId, reason: &str, details: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            reason: reason.to_string(),
            details: details.to_string(),
            status: BlockerStatus::Open,
            created_at: Utc::now(),
        }
    }
}

/// Surfaces blocked tasks for human resolution.
#[async_trait]
pub trait BlockerService: Send + Sync {
    async fn create_blocker(&self, task_id: TaskId, reason: &str, details: &str) -> Result<()>;
}

/// In-memory task store.
///
/// Holds per-project task lists plus a dependency table, and records
/// every persisted status so tests can assert on the write stream.
#[derive(Default)]
pub struct MemoryTaskStore {
    projects: RwLock<HashMap<String, Vec<Task>>>,
    dependencies: RwLock<HashMap<TaskId, Vec<TaskId>>>,
    statuses: RwLock<HashMap<TaskId, TaskStatus>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project with tasks and `(task, depends_on)` pairs.
    pub async fn insert_project(
        &self,
        project_id: &str,
        tasks: Vec<Task>,
        dependencies: Vec<(TaskId, TaskId)>,
    ) {
        {
            let mut deps = self.dependencies.write().await;
            for (task_id, depends_on) in dependencies {
                deps.entry(task_id).or_default().push(depends_on);
            }
        }
        self.projects
            .write()
            .await
            .insert(project_id.to_string(), tasks);
    }

    /// The most recently persisted status for a task, if any.
    pub async fn persisted(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.statuses.read().await.get(&task_id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .projects
            .read()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_dependencies(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        Ok(self
            .dependencies
            .read()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist_status(&self, task_id: TaskId, status: &TaskStatus) -> Result<()> {
        self.statuses.write().await.insert(task_id, status.clone());
        Ok(())
    }
}

/// In-memory blocker service for tests and small embedders.
#[derive(Default)]
pub struct MemoryBlockerService {
    blockers: RwLock<Vec<Blocker>>,
}

impl MemoryBlockerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// All blockers recorded so far.
    pub async fn all(&self) -> Vec<Blocker> {
        self.blockers.read().await.clone()
    }

    /// Blockers recorded for one task.
    pub async fn for_task(&self, task_id: TaskId) -> Vec<Blocker> {
        self.blockers
            .read()
            .await
            .iter()
            .filter(|b| b.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Count of open blockers.
    pub async fn open_count(&self) -> usize {
        self.blockers
            .read()
            .await
            .iter()
            .filter(|b| b.status == BlockerStatus::Open)
            .count()
    }

    /// Mark every blocker for a task resolved, returning how many changed.
    pub async fn resolve_for_task(&self, task_id: TaskId) -> usize {
        let mut blockers = self.blockers.write().await;
        let mut resolved = 0;
        for blocker in blockers.iter_mut() {
            if blocker.task_id == task_id && blocker.status == BlockerStatus::Open {
                blocker.status = BlockerStatus::Resolved;
                resolved += 1;
            }
        }
        resolved
    }
}

#[async_trait]
impl BlockerService for MemoryBlockerService {
    async fn create_blocker(&self, task_id: TaskId, reason: &str, details: &str) -> Result<()> {
        self.blockers
            .write()
            .await
            .push(Blocker::new(task_id, reason, details));
        Ok(())
    }
}
