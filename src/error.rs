use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Dependency cycle detected: {cycle}")]
    CycleDetected { cycle: String },

    #[error("Agent pool exhausted (max: {max})")]
    PoolExhausted { max: usize },

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Task {id} is blocked: {reason}")]
    TaskBlocked { id: TaskId, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),
}

impl Error {
    /// Build an internal consistency error from anything displayable.
    ///
    /// These indicate a scheduler bug (an unknown task or agent id was
    /// referenced) and are logged at the highest severity rather than
    /// retried.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::InternalConsistency(msg.to_string())
    }

    /// Whether this error is expected to clear on a later tick.
    ///
    /// Only pool exhaustion qualifies: it is absorbed by the coordination
    /// loop and never surfaced to callers.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
