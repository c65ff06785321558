use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{flog_debug, Error, Result};

fn default_max_concurrency() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_task_timeout_secs() -> u64 {
    900
}

fn default_idle_agent_timeout_secs() -> u64 {
    300
}

fn default_event_buffer() -> usize {
    100
}

/// Tunables for a scheduler run.
///
/// Loaded from `~/.foreman/foreman.toml` when present; every field has a
/// default so a missing or partial file still yields a usable config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global cap on concurrently existing agents, shared across all
    /// capability types.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Retryable failures allowed per task before it is blocked.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-dispatch execution timeout; a stalled task consumes a retry.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Idle agents unused beyond this are retired.
    #[serde(default = "default_idle_agent_timeout_secs")]
    pub idle_agent_timeout_secs: u64,
    /// Capacity of the scheduler/pool event channels.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            task_timeout_secs: default_task_timeout_secs(),
            idle_agent_timeout_secs: default_idle_agent_timeout_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SchedulerConfig {
    pub fn app_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("foreman.toml"))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn idle_agent_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_agent_timeout_secs)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        flog_debug!("SchedulerConfig::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from an explicit path (used by tests and embedders).
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        flog_debug!(
            "Config loaded: max_concurrency={}, max_retries={}, task_timeout={}s",
            config.max_concurrency,
            config.max_retries,
            config.task_timeout_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let app_dir = Self::app_dir()?;
        if !app_dir.exists() {
            flog_debug!("Creating app directory: {}", app_dir.display());
            fs::create_dir_all(&app_dir)?;
        }
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save to an explicit path (used by tests and embedders).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
