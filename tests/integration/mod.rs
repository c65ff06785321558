//! Integration test suite for the scheduling engine.
//!
//! These tests exercise the full coordination loop from graph submission
//! to fixed point, including parallel dispatch, dependency ordering,
//! retry handling, and pause/resume/teardown semantics.
//!
//! # Test Categories
//!
//! - `scheduling`: parallelism, dependency ordering, pool bounds
//! - `recovery`: retries, blockers, pause/resume, shutdown
//!
//! # CI Compatibility
//!
//! All executors are scripted in-process; no network calls or external
//! worker processes are involved, making the suite safe for CI.

mod fixtures;

mod recovery;
