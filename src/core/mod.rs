//! Core domain models for the scheduling engine.
//!
//! This module contains the fundamental data structures used throughout
//! the coordination engine: tasks and the dependency graph that decides
//! what can run.

pub mod dag;
pub mod task;

pub use dag::{TaskCounts, TaskGraph};
pub use task::{Task, TaskId, TaskStatus};
