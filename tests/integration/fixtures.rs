//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Assembling a scheduler with in-memory collaborators
//! - Scripted and gated executors for deterministic control
//! - Predefined task graphs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock, Semaphore};

use foreman::agent::Capability;
use foreman::config::SchedulerConfig;
use foreman::core::task::{Task, TaskId};
use foreman::error::Error;
use foreman::orchestration::executor::{ApproveAll, TaskResult, WorkerExecutor};
use foreman::orchestration::pool::{AgentEvent, AgentPool};
use foreman::orchestration::scheduler::{Scheduler, SchedulerEvent};
use foreman::store::{BlockerService, MemoryBlockerService, MemoryTaskStore, TaskStore};

/// A scheduler wired to in-memory collaborators, plus the pieces tests
/// need to observe and steer it.
pub struct Harness {
    pub scheduler: Scheduler,
    pub blockers: Arc<MemoryBlockerService>,
    pub store: Arc<MemoryTaskStore>,
    pub event_rx: mpsc::Receiver<SchedulerEvent>,
    pub agent_rx: mpsc::Receiver<AgentEvent>,
}

impl Harness {
    /// Build a harness around an executor with the given config.
    pub fn new(config: SchedulerConfig, executor: Arc<dyn WorkerExecutor>) -> Self {
        let (agent_tx, agent_rx) = mpsc::channel(config.event_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let pool = Arc::new(RwLock::new(AgentPool::new(config.max_concurrency, agent_tx)));
        let blockers = Arc::new(MemoryBlockerService::new());
        let store = Arc::new(MemoryTaskStore::new());

        let scheduler = Scheduler::new(
            config,
            pool,
            executor,
            Arc::new(ApproveAll),
            Arc::clone(&blockers) as Arc<dyn BlockerService>,
            Arc::clone(&store) as Arc<dyn TaskStore>,
            event_tx,
        );

        Self {
            scheduler,
            blockers,
            store,
            event_rx,
            agent_rx,
        }
    }
}

/// Config sized for fast tests.
pub fn quick_config(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        max_retries: 3,
        task_timeout_secs: 30,
        idle_agent_timeout_secs: 300,
        event_buffer: 200,
    }
}

/// A pending backend task.
pub fn backend_task(name: &str) -> Task {
    Task::new(name, &format!("{} description", name), Capability::Backend)
}

/// A pending task of the given capability.
pub fn task_with(name: &str, capability: Capability) -> Task {
    Task::new(name, &format!("{} description", name), capability)
}

/// A linear chain task-0 -> task-1 -> ... -> task-(n-1).
pub fn chain(n: usize) -> (Vec<Task>, Vec<(TaskId, TaskId)>) {
    let tasks: Vec<Task> = (0..n).map(|i| backend_task(&format!("task-{}", i))).collect();
    let deps = tasks
        .windows(2)
        .map(|pair| (pair[0].id, pair[1].id))
        .collect();
    (tasks, deps)
}

/// The diamond graph A, B(dep A), C(dep A), D(dep B and C).
pub fn diamond() -> (Vec<Task>, Vec<(TaskId, TaskId)>, [TaskId; 4]) {
    let a = backend_task("task-a");
    let b = backend_task("task-b");
    let c = backend_task("task-c");
    let d = backend_task("task-d");
    let ids = [a.id, b.id, c.id, d.id];
    let deps = vec![
        (ids[0], ids[1]),
        (ids[0], ids[2]),
        (ids[1], ids[3]),
        (ids[2], ids[3]),
    ];
    (vec![a, b, c, d], deps, ids)
}

/// Poll until a condition holds, failing the test after ~2 seconds.
pub async fn wait_for<F: FnMut() -> bool>(what: &str, mut cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Executor that succeeds after sleeping, tracking concurrency so tests
/// can assert on parallelism and the pool bound.
pub struct CountingExecutor {
    delay: Duration,
    active: Mutex<usize>,
    peak: Mutex<usize>,
    executed: Mutex<Vec<String>>,
}

impl CountingExecutor {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            active: Mutex::new(0),
            peak: Mutex::new(0),
            executed: Mutex::new(Vec::new()),
        })
    }

    /// Highest number of simultaneously running executions observed.
    pub fn peak(&self) -> usize {
        *self.peak.lock().unwrap()
    }

    /// Task names in the order execution began.
    pub fn executions(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerExecutor for CountingExecutor {
    async fn execute_task(&self, task: &Task) -> foreman::Result<TaskResult> {
        {
            let mut active = self.active.lock().unwrap();
            *active += 1;
            let mut peak = self.peak.lock().unwrap();
            if *active > *peak {
                *peak = *active;
            }
            self.executed.lock().unwrap().push(task.name.clone());
        }
        tokio::time::sleep(self.delay).await;
        *self.active.lock().unwrap() -= 1;
        Ok(TaskResult::completed(format!("{} done", task.name)))
    }
}

/// Executor that records when each task starts, then holds it until the
/// test releases a permit. Lets tests freeze the world mid-flight.
pub struct GatedExecutor {
    started: Mutex<Vec<String>>,
    gate: Semaphore,
}

impl GatedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        })
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    /// Allow `n` held executions to finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl WorkerExecutor for GatedExecutor {
    async fn execute_task(&self, task: &Task) -> foreman::Result<TaskResult> {
        self.started.lock().unwrap().push(task.name.clone());
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::TaskExecution("gate closed".to_string()))?;
        permit.forget();
        Ok(TaskResult::completed(format!("{} done", task.name)))
    }
}

/// Executor scripted per task name: fail the first N attempts of a
/// task, then succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    failures: Mutex<HashMap<String, u32>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(self, name: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), times);
        self
    }

    pub fn executions(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerExecutor for ScriptedExecutor {
    async fn execute_task(&self, task: &Task) -> foreman::Result<TaskResult> {
        self.executed.lock().unwrap().push(task.name.clone());

        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&task.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(TaskResult::failed("simulated failure"));
            }
        }
        Ok(TaskResult::completed(format!("{} done", task.name)))
    }
}

/// Executor that tags each execution, for capability-routing assertions.
pub struct TaggingExecutor {
    tag: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl TaggingExecutor {
    pub fn new(tag: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { tag, log })
    }
}

#[async_trait]
impl WorkerExecutor for TaggingExecutor {
    async fn execute_task(&self, task: &Task) -> foreman::Result<TaskResult> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.tag, task.name));
        Ok(TaskResult::completed(""))
    }
}
