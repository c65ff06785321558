//! Multi-agent task scheduling and coordination engine.
//!
//! The engine decomposes into three layers, leaves first:
//!
//! - [`core`] owns the task model and the dependency graph, answering
//!   "what can run now" through an incrementally maintained ready-set.
//! - [`orchestration::pool`] bounds concurrency with a pool of reusable
//!   worker agents keyed by capability.
//! - [`orchestration::scheduler`] is the coordination loop: it matches
//!   ready tasks to agents, dispatches executions, and applies results
//!   arriving in any order from a single writer context.
//!
//! External collaborators (worker execution, quality gates, durable
//! storage, blocker escalation) plug in through the traits in
//! [`orchestration::executor`] and [`store`].

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod store;

pub use agent::{AgentId, AgentStatus, Capability, WorkerAgent};
pub use config::SchedulerConfig;
pub use crate::core::{Task, TaskCounts, TaskGraph, TaskId, TaskStatus};
pub use error::{Error, Result};
pub use orchestration::{
    AgentEvent, AgentPool, PoolStatus, RunSummary, Scheduler, SchedulerControl, SchedulerEvent,
    StatusSnapshot,
};
pub use store::{Blocker, BlockerService, BlockerStatus, TaskStore};
