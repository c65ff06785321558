//! Agent pool for multi-agent management.
//!
//! The `AgentPool` bounds concurrency and reuses worker agents. Agents
//! are created lazily on first acquisition, handed back on release, and
//! retired after sitting idle too long. Lifecycle changes are emitted on
//! a channel for observability; emission never affects control flow.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::agent::{AgentId, AgentStatus, Capability, WorkerAgent};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::{flog_debug, flog_trace};

/// Events emitted by the agent pool for lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A new agent was created.
    Created {
        /// The agent that was created.
        agent_id: AgentId,
        /// Its capability type.
        capability: Capability,
    },
    /// An idle agent was destroyed.
    Retired {
        /// The agent that was retired.
        agent_id: AgentId,
        /// Tasks it completed over its lifetime.
        tasks_completed: u64,
    },
}

/// Idle/busy tallies for one capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityCounts {
    pub idle: usize,
    pub busy: usize,
}

/// Snapshot of pool occupancy, for observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Counts per capability, keyed by capability name.
    pub capabilities: BTreeMap<String, CapabilityCounts>,
    pub idle: usize,
    pub busy: usize,
    pub total: usize,
    pub max_concurrency: usize,
}

/// Manages a bounded pool of reusable worker agents.
///
/// The cap is global: idle plus busy agents across every capability
/// never exceed `max_concurrency`. Only the coordination loop mutates
/// the pool, so transitions need no internal locking.
pub struct AgentPool {
    /// Agents indexed by their ID.
    agents: HashMap<AgentId, WorkerAgent>,
    /// Global cap on concurrently existing agents.
    max_concurrency: usize,
    /// Channel for emitting agent events.
    event_tx: mpsc::Sender<AgentEvent>,
}

impl AgentPool {
    /// Create a new agent pool with the given global capacity.
    pub fn new(max_concurrency: usize, event_tx: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            agents: HashMap::new(),
            max_concurrency,
            event_tx,
        }
    }

    /// Acquire an agent for a task.
    ///
    /// Reuses an idle agent of the matching capability when one exists;
    /// otherwise creates a new agent if the pool is below capacity.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` when every slot is taken. This is a transient
    /// condition: the caller stops dispatching for the tick and tries
    /// again after a release.
    pub fn acquire(&mut self, capability: Capability, task_id: TaskId) -> Result<AgentId> {
        if let Some(agent) = self
            .agents
            .values_mut()
            .find(|a| a.capability == capability && a.is_idle())
        {
            flog_trace!("Reusing idle agent {} for task {}", agent.id.short(), task_id.short());
            agent.assign(task_id);
            return Ok(agent.id);
        }

        if self.agents.len() >= self.max_concurrency {
            return Err(Error::PoolExhausted {
                max: self.max_concurrency,
            });
        }

        let mut agent = WorkerAgent::new(capability);
        let agent_id = agent.id;
        agent.assign(task_id);
        self.agents.insert(agent_id, agent);
        flog_debug!(
            "Created {} agent {} ({}/{} slots used)",
            capability,
            agent_id.short(),
            self.agents.len(),
            self.max_concurrency
        );
        self.emit(AgentEvent::Created {
            agent_id,
            capability,
        });
        Ok(agent_id)
    }

    /// Release an agent back to the idle set.
    ///
    /// A successful release counts toward the agent's completed tasks.
    ///
    /// # Errors
    ///
    /// An unknown agent id is an internal consistency violation: the
    /// loop only releases ids it acquired.
    pub fn release(&mut self, agent_id: AgentId, success: bool) -> Result<()> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| Error::internal(format!("release of unknown agent {}", agent_id)))?;
        agent.release(success);
        flog_trace!(
            "Released agent {} (success={}, completed={})",
            agent_id.short(),
            success,
            agent.tasks_completed
        );
        Ok(())
    }

    /// Destroy idle agents unused beyond `idle_timeout`.
    ///
    /// Returns the retired agent ids, emitting a retirement event per
    /// destroyed agent.
    pub fn retire_idle(&mut self, idle_timeout: Duration) -> Vec<AgentId> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::MAX);

        let stale: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| a.is_idle() && a.idle_for(now) > cutoff)
            .map(|a| a.id)
            .collect();

        for agent_id in &stale {
            if let Some(mut agent) = self.agents.remove(agent_id) {
                agent.begin_retirement();
                flog_debug!(
                    "Retired idle agent {} after {} completed tasks",
                    agent_id.short(),
                    agent.tasks_completed
                );
                self.emit(AgentEvent::Retired {
                    agent_id: *agent_id,
                    tasks_completed: agent.tasks_completed,
                });
            }
        }
        stale
    }

    /// Retire every agent, busy or not. Used at pool teardown.
    pub fn shutdown(&mut self) -> usize {
        let ids: Vec<AgentId> = self.agents.keys().copied().collect();
        let count = ids.len();
        for agent_id in ids {
            if let Some(mut agent) = self.agents.remove(&agent_id) {
                agent.begin_retirement();
                self.emit(AgentEvent::Retired {
                    agent_id,
                    tasks_completed: agent.tasks_completed,
                });
            }
        }
        count
    }

    /// Get an agent by ID.
    pub fn get(&self, agent_id: &AgentId) -> Option<&WorkerAgent> {
        self.agents.get(agent_id)
    }

    /// Idle/busy occupancy per capability plus totals.
    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            max_concurrency: self.max_concurrency,
            ..PoolStatus::default()
        };
        for capability in Capability::ALL {
            status
                .capabilities
                .insert(capability.as_str().to_string(), CapabilityCounts::default());
        }
        for agent in self.agents.values() {
            let counts = status
                .capabilities
                .entry(agent.capability.as_str().to_string())
                .or_default();
            match agent.status {
                AgentStatus::Idle => {
                    counts.idle += 1;
                    status.idle += 1;
                }
                AgentStatus::Busy { .. } => {
                    counts.busy += 1;
                    status.busy += 1;
                }
                AgentStatus::Retiring => {}
            }
            status.total += 1;
        }
        status
    }

    pub fn idle_count(&self) -> usize {
        self.agents.values().filter(|a| a.is_idle()).count()
    }

    pub fn busy_count(&self) -> usize {
        self.agents.values().filter(|a| a.is_busy()).count()
    }

    /// Total agents currently existing in the pool.
    pub fn total_count(&self) -> usize {
        self.agents.len()
    }

    /// Check if the pool can create another agent.
    pub fn has_capacity(&self) -> bool {
        self.agents.len() < self.max_concurrency
    }

    /// The global concurrency cap.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn emit(&self, event: AgentEvent) {
        // Observability only: a full or closed channel must not stall the pool.
        if self.event_tx.try_send(event).is_err() {
            flog_trace!("Agent event dropped: channel unavailable");
        }
    }
}
