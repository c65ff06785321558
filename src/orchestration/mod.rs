//! Orchestration layer for the scheduling engine.
//!
//! This module contains the components that turn a task graph into
//! executed work: the bounded agent pool, the executor and quality-gate
//! seams, and the coordination loop that ties them together.

pub mod executor;
pub mod pool;
pub mod scheduler;

pub use executor::{
    ApproveAll, CapabilityRouter, ExecutionStatus, GateReport, QualityGate, TaskResult,
    WorkerExecutor,
};
pub use pool::{AgentEvent, AgentPool, CapabilityCounts, PoolStatus};
pub use scheduler::{RunSummary, Scheduler, SchedulerControl, SchedulerEvent, StatusSnapshot};
