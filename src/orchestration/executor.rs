//! Worker execution and quality-gate seams.
//!
//! The engine treats code generation as opaque: a `WorkerExecutor` turns
//! a task into a `TaskResult`, and a `QualityGate` decides whether a
//! successful execution is actually acceptable. Both are async trait
//! objects so embedders can plug in anything from subprocess runners to
//! remote services.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::Capability;
use crate::core::task::Task;
use crate::error::{Error, Result};

/// Outcome class of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The attempt produced output and believes it succeeded.
    Completed,
    /// The attempt failed but may succeed if retried.
    Failed,
    /// Unrecoverable failure; retrying cannot help.
    Fatal,
}

/// Result of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: ExecutionStatus,
    pub output: String,
    pub error: Option<String>,
}

impl TaskResult {
    /// Build a successful result.
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            output: output.into(),
            error: None,
        }
    }

    /// Build a retryable failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Build an unrecoverable failure.
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Fatal,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Opaque task execution.
///
/// Implementations may retry internally before returning; the scheduler
/// only sees the final result of the attempt.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute_task(&self, task: &Task) -> Result<TaskResult>;
}

/// Verdict from quality-gate validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub passed: bool,
    pub failures: Vec<String>,
}

impl GateReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            failures: Vec::new(),
        }
    }

    pub fn fail(failures: Vec<String>) -> Self {
        Self {
            passed: false,
            failures,
        }
    }
}

/// Validation hook invoked before a task is marked Completed.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn validate(&self, task: &Task, output: &str) -> Result<GateReport>;
}

/// Quality gate that accepts everything.
///
/// The default for embedders that run their checks inside the executor.
pub struct ApproveAll;

#[async_trait]
impl QualityGate for ApproveAll {
    async fn validate(&self, _task: &Task, _output: &str) -> Result<GateReport> {
        Ok(GateReport::pass())
    }
}

/// Routes each task to the executor registered for its capability.
///
/// Capabilities are a closed set, so a fully populated router is
/// exhaustive; a task whose capability has no registered executor is a
/// retryable execution error, not a panic.
#[derive(Default)]
pub struct CapabilityRouter {
    routes: HashMap<Capability, Arc<dyn WorkerExecutor>>,
}

impl CapabilityRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a capability (builder style).
    pub fn route(mut self, capability: Capability, executor: Arc<dyn WorkerExecutor>) -> Self {
        self.routes.insert(capability, executor);
        self
    }

    /// Check whether a capability has a registered executor.
    pub fn handles(&self, capability: Capability) -> bool {
        self.routes.contains_key(&capability)
    }
}

#[async_trait]
impl WorkerExecutor for CapabilityRouter {
    async fn execute_task(&self, task: &Task) -> Result<TaskResult> {
        match self.routes.get(&task.required_capability) {
            Some(executor) => executor.execute_task(task).await,
            None => Err(Error::TaskExecution(format!(
                "no executor registered for capability {}",
                task.required_capability
            ))),
        }
    }
}
