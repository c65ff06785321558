//! The coordination loop.
//!
//! The `Scheduler` drives a project's task graph to completion: each
//! tick it drains the ready-set, acquires agents from the pool, and
//! spawns executions; completions arrive in arbitrary order and are
//! applied one at a time back on the loop, so the graph and pool have a
//! single writer and need no fine-grained locking. Failures consume
//! retries until the task is blocked and escalated to a human.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentId;
use crate::config::SchedulerConfig;
use crate::core::dag::{TaskCounts, TaskGraph};
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::executor::{ExecutionStatus, QualityGate, WorkerExecutor};
use crate::orchestration::pool::{AgentPool, PoolStatus};
use crate::store::{BlockerService, TaskStore};
use crate::{flog, flog_debug, flog_error, flog_warn};

/// How long a parked loop waits before re-checking the pause flag.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Events emitted by the scheduler for task lifecycle changes.
///
/// Emission is observability only: events are sent with `try_send` and
/// dropped if no one is listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SchedulerEvent {
    /// A task was matched with an agent and dispatched.
    TaskAssigned { task_id: TaskId, agent_id: AgentId },
    /// A task completed and passed quality-gate validation.
    TaskCompleted { task_id: TaskId },
    /// A task failed with retries remaining and re-entered the queue.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    /// A task exhausted its retries or failed unrecoverably.
    TaskBlocked { task_id: TaskId, reason: String },
    /// A task's dependencies completed (or its blocker was resolved).
    TaskUnblocked { task_id: TaskId },
    /// New dispatches stopped.
    Paused,
    /// Dispatching restarted.
    Resumed,
    /// The run reached a fixed point.
    AllTasksSettled,
}

/// Classified outcome of one dispatched execution.
#[derive(Debug)]
enum Verdict {
    Success,
    Retryable { error: String },
    Fatal { error: String },
}

/// What a dispatched future hands back to the loop.
#[derive(Debug)]
struct DispatchOutcome {
    task_id: TaskId,
    agent_id: AgentId,
    verdict: Verdict,
}

/// Tally of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_tasks: usize,
    pub completed: usize,
    pub blocked: usize,
    pub retries: u64,
}

/// Read-only view of scheduler state for external callers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub tasks: TaskCounts,
    pub pool: PoolStatus,
    pub paused: bool,
}

/// Cloneable control handle for API layers.
///
/// `run` holds the scheduler exclusively, so pause/resume/status arrive
/// through this handle instead. All reads are snapshots; nothing here
/// mutates the graph.
#[derive(Clone)]
pub struct SchedulerControl {
    graph: Arc<RwLock<TaskGraph>>,
    pool: Arc<RwLock<AgentPool>>,
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerControl {
    /// Stop new dispatches; in-flight work runs to completion.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            flog!("Scheduler paused");
            let _ = self.event_tx.try_send(SchedulerEvent::Paused);
        }
    }

    /// Restart dispatching.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            flog!("Scheduler resumed");
            let _ = self.event_tx.try_send(SchedulerEvent::Resumed);
            self.resume_notify.notify_waiters();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Tear down the run: in-flight dispatches are abandoned and their
    /// results discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.resume_notify.notify_waiters();
    }

    /// Snapshot of task and pool state.
    pub async fn get_status(&self) -> StatusSnapshot {
        let tasks = { self.graph.read().await.counts() };
        let pool = { self.pool.read().await.status() };
        StatusSnapshot {
            tasks,
            pool,
            paused: self.is_paused(),
        }
    }
}

/// The coordination loop for one project run.
///
/// Owns the task graph and agent pool exclusively; collaborators
/// (executor, quality gate, blocker service, task store) are consumed
/// through trait objects.
///
/// # Example
///
/// ```ignore
/// let (agent_tx, _agent_rx) = mpsc::channel(config.event_buffer);
/// let (event_tx, mut event_rx) = mpsc::channel(config.event_buffer);
/// let pool = Arc::new(RwLock::new(AgentPool::new(config.max_concurrency, agent_tx)));
///
/// let mut scheduler = Scheduler::new(
///     config, pool, executor, quality_gate, blockers, store, event_tx,
/// );
/// scheduler.submit_task_graph(tasks, dependencies).await?;
/// let summary = scheduler.run().await?;
/// ```
pub struct Scheduler {
    graph: Arc<RwLock<TaskGraph>>,
    pool: Arc<RwLock<AgentPool>>,
    executor: Arc<dyn WorkerExecutor>,
    quality_gate: Arc<dyn QualityGate>,
    blockers: Arc<dyn BlockerService>,
    store: Arc<dyn TaskStore>,
    event_tx: mpsc::Sender<SchedulerEvent>,
    config: SchedulerConfig,
    paused: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancel: CancellationToken,
    /// Retryable failures absorbed over the run.
    retries: u64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<RwLock<AgentPool>>,
        executor: Arc<dyn WorkerExecutor>,
        quality_gate: Arc<dyn QualityGate>,
        blockers: Arc<dyn BlockerService>,
        store: Arc<dyn TaskStore>,
        event_tx: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            graph: Arc::new(RwLock::new(TaskGraph::new())),
            pool,
            executor,
            quality_gate,
            blockers,
            store,
            event_tx,
            config,
            paused: Arc::new(AtomicBool::new(false)),
            resume_notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            retries: 0,
        }
    }

    /// Cloneable handle for pause/resume/shutdown/status while `run`
    /// borrows the scheduler.
    pub fn control(&self) -> SchedulerControl {
        SchedulerControl {
            graph: Arc::clone(&self.graph),
            pool: Arc::clone(&self.pool),
            paused: Arc::clone(&self.paused),
            resume_notify: Arc::clone(&self.resume_notify),
            cancel: self.cancel.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    /// Replace the task graph with a freshly built one.
    ///
    /// Each dependency pair `(a, b)` declares that `a` must complete
    /// before `b`. All-or-nothing: on any error (cycles included) the
    /// previous graph is left untouched.
    pub async fn submit_task_graph(
        &self,
        tasks: Vec<Task>,
        dependencies: Vec<(TaskId, TaskId)>,
    ) -> Result<()> {
        let task_count = tasks.len();
        let built = TaskGraph::build(tasks, &dependencies)?;
        *self.graph.write().await = built;
        flog!(
            "Task graph submitted: {} tasks, {} dependencies",
            task_count,
            dependencies.len()
        );
        Ok(())
    }

    /// Pull a project's tasks and dependencies from the task store and
    /// submit them. Returns the number of tasks loaded.
    pub async fn load_project(&self, project_id: &str) -> Result<usize> {
        let tasks = self.store.get_tasks(project_id).await?;
        let mut dependencies = Vec::new();
        for task in &tasks {
            for dep in self.store.get_dependencies(task.id).await? {
                dependencies.push((dep, task.id));
            }
        }
        let count = tasks.len();
        self.submit_task_graph(tasks, dependencies).await?;
        Ok(count)
    }

    /// Stop new dispatches; in-flight work runs to completion.
    pub fn pause(&self) {
        self.control().pause();
    }

    /// Restart dispatching.
    pub fn resume(&self) {
        self.control().resume();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Tear down the run, abandoning in-flight dispatches.
    pub fn shutdown(&self) {
        self.control().shutdown();
    }

    /// Snapshot of task and pool state.
    pub async fn get_status(&self) -> StatusSnapshot {
        self.control().get_status().await
    }

    /// Manually reset a Blocked task after its blocker was resolved.
    ///
    /// Returns true if the task became Ready immediately.
    pub async fn reset_task(&self, task_id: TaskId) -> Result<bool> {
        let became_ready = { self.graph.write().await.reset(&task_id)? };
        self.persist(task_id).await;
        if became_ready {
            self.emit(SchedulerEvent::TaskUnblocked { task_id });
        }
        flog!("Task {} reset (ready={})", task_id.short(), became_ready);
        Ok(became_ready)
    }

    /// Drive the graph to a fixed point.
    ///
    /// Returns when every task is Completed or the remainder is blocked
    /// behind failures, or when the run is shut down.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let total_tasks = { self.graph.read().await.task_count() };
        flog!("Scheduler run started: {} tasks", total_tasks);

        let mut in_flight: JoinSet<DispatchOutcome> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                flog!(
                    "Scheduler shut down; abandoning {} in-flight dispatches",
                    in_flight.len()
                );
                // Abandoned results are dropped here, never applied.
                in_flight.shutdown().await;
                break;
            }

            if !self.paused.load(Ordering::SeqCst) {
                self.dispatch_ready(&mut in_flight).await?;
            }

            {
                let mut pool = self.pool.write().await;
                pool.retire_idle(self.config.idle_agent_timeout());
            }

            if in_flight.is_empty() {
                let settled = { self.graph.read().await.is_settled() };
                if settled {
                    self.emit(SchedulerEvent::AllTasksSettled);
                    break;
                }
                if self.paused.load(Ordering::SeqCst) {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = self.resume_notify.notified() => {}
                        _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
                    }
                    continue;
                }
                flog_warn!("Scheduler stalled: tasks remain but none can dispatch; stopping");
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Handled at the top of the loop.
                }
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => self.apply_outcome(outcome).await?,
                        Some(Err(join_err)) => {
                            // The dispatch future itself died. The task
                            // stays Dispatched and its agent stays Busy:
                            // frozen rather than guessed at.
                            flog_error!("Dispatched execution panicked: {}", join_err);
                        }
                        None => {}
                    }
                }
            }
        }

        let counts = { self.graph.read().await.counts() };
        let summary = RunSummary {
            total_tasks,
            completed: counts.completed,
            blocked: counts.blocked,
            retries: self.retries,
        };
        flog!(
            "Scheduler run finished: {}/{} completed, {} blocked, {} retries",
            summary.completed,
            summary.total_tasks,
            summary.blocked,
            summary.retries
        );
        Ok(summary)
    }

    /// Dispatch ready tasks until the pool runs out of capacity.
    async fn dispatch_ready(&self, in_flight: &mut JoinSet<DispatchOutcome>) -> Result<usize> {
        let ready = { self.graph.read().await.ready_tasks() };
        let mut dispatched = 0;

        for task_id in ready {
            if self.cancel.is_cancelled() || self.paused.load(Ordering::SeqCst) {
                break;
            }

            let task = {
                let graph = self.graph.read().await;
                match graph.get_task(&task_id) {
                    Some(task) => task.clone(),
                    None => continue,
                }
            };

            let agent_id = {
                let mut pool = self.pool.write().await;
                match pool.acquire(task.required_capability, task_id) {
                    Ok(agent_id) => agent_id,
                    Err(err) if err.is_transient() => {
                        // Remaining ready tasks wait for the next tick.
                        flog_debug!("Pool exhausted; {} deferred", task_id.short());
                        break;
                    }
                    Err(err) => return Err(err),
                }
            };

            let marked = { self.graph.write().await.mark_dispatched(&task_id, agent_id) };
            if let Err(err) = marked {
                flog_error!("{}", err);
                let released = { self.pool.write().await.release(agent_id, false) };
                if let Err(err) = released {
                    flog_error!("{}", err);
                }
                continue;
            }

            self.persist(task_id).await;
            self.emit(SchedulerEvent::TaskAssigned { task_id, agent_id });
            flog_debug!(
                "Dispatched task {} ({}) to agent {}",
                task_id.short(),
                task.name,
                agent_id.short()
            );

            let executor = Arc::clone(&self.executor);
            let gate = Arc::clone(&self.quality_gate);
            let timeout = self.config.task_timeout();
            in_flight.spawn(async move {
                let verdict = execute_with_gate(executor, gate, task, timeout).await;
                DispatchOutcome {
                    task_id,
                    agent_id,
                    verdict,
                }
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Apply a completed dispatch to the graph and pool.
    ///
    /// Runs on the loop, one outcome at a time, in whatever order
    /// completions arrive.
    async fn apply_outcome(&mut self, outcome: DispatchOutcome) -> Result<()> {
        let DispatchOutcome {
            task_id,
            agent_id,
            verdict,
        } = outcome;

        match verdict {
            Verdict::Success => {
                let unblocked = {
                    let mut graph = self.graph.write().await;
                    match graph.mark_completed(&task_id) {
                        Ok(unblocked) => unblocked,
                        Err(err @ Error::InternalConsistency(_)) => {
                            flog_error!("{}", err);
                            self.release_agent(agent_id, false).await;
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                };
                self.release_agent(agent_id, true).await;
                self.persist(task_id).await;
                self.emit(SchedulerEvent::TaskCompleted { task_id });
                flog_debug!("Task {} completed", task_id.short());

                for dep_id in unblocked {
                    self.persist(dep_id).await;
                    self.emit(SchedulerEvent::TaskUnblocked { task_id: dep_id });
                }
            }
            Verdict::Fatal { error } => {
                self.release_agent(agent_id, false).await;
                self.block_task(task_id, &format!("unrecoverable failure: {}", error))
                    .await;
            }
            Verdict::Retryable { error } => {
                self.release_agent(agent_id, false).await;
                self.retries += 1;

                let retry_count = {
                    let mut graph = self.graph.write().await;
                    match graph.mark_retryable(&task_id, &error) {
                        Ok(count) => count,
                        Err(err @ Error::InternalConsistency(_)) => {
                            flog_error!("{}", err);
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                };

                if retry_count >= self.config.max_retries {
                    self.block_task(
                        task_id,
                        &format!(
                            "retries exhausted after {} attempts: {}",
                            retry_count, error
                        ),
                    )
                    .await;
                } else {
                    let requeued = { self.graph.write().await.requeue(&task_id) };
                    if let Err(err) = requeued {
                        flog_error!("{}", err);
                        return Ok(());
                    }
                    self.persist(task_id).await;
                    self.emit(SchedulerEvent::TaskRetrying {
                        task_id,
                        attempt: retry_count,
                        error: error.clone(),
                    });
                    flog_debug!(
                        "Task {} failed (attempt {}): {}; requeued",
                        task_id.short(),
                        retry_count,
                        error
                    );
                }
            }
        }
        Ok(())
    }

    /// Block a task and escalate it to the blocker service.
    async fn block_task(&self, task_id: TaskId, reason: &str) {
        let failed = {
            let mut graph = self.graph.write().await;
            graph.mark_failed(&task_id, reason)
        };
        if let Err(err) = failed {
            flog_error!("{}", err);
            return;
        }

        self.persist(task_id).await;

        let details = {
            let graph = self.graph.read().await;
            graph
                .get_task(&task_id)
                .map(|t| format!("{}: {}", t.name, t.description))
                .unwrap_or_default()
        };
        if let Err(err) = self.blockers.create_blocker(task_id, reason, &details).await {
            flog_warn!(
                "Failed to create blocker for task {}: {}",
                task_id.short(),
                err
            );
        }

        self.emit(SchedulerEvent::TaskBlocked {
            task_id,
            reason: reason.to_string(),
        });
        flog!("Task {} blocked: {}", task_id.short(), reason);
    }

    async fn release_agent(&self, agent_id: AgentId, success: bool) {
        let released = { self.pool.write().await.release(agent_id, success) };
        if let Err(err) = released {
            // Unknown agent id means the loop is confused; log loudly
            // and do not guess.
            flog_error!("{}", err);
        }
    }

    /// Write a task's current status through to the store.
    ///
    /// Persistence is a collaborator, not a gatekeeper: failures are
    /// logged and absorbed.
    async fn persist(&self, task_id: TaskId) {
        let status = {
            let graph = self.graph.read().await;
            graph.get_task(&task_id).map(|t| t.status.clone())
        };
        if let Some(status) = status {
            if let Err(err) = self.store.persist_status(task_id, &status).await {
                flog_warn!(
                    "Failed to persist status for task {}: {}",
                    task_id.short(),
                    err
                );
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if self.event_tx.try_send(event).is_err() {
            flog_debug!("Scheduler event dropped: channel unavailable");
        }
    }
}

/// Run one execution attempt and classify the result.
///
/// The quality gate runs here, inside the dispatched future, so a slow
/// gate never stalls the loop; the classified verdict is applied back on
/// the loop afterwards.
async fn execute_with_gate(
    executor: Arc<dyn WorkerExecutor>,
    gate: Arc<dyn QualityGate>,
    task: Task,
    timeout: Duration,
) -> Verdict {
    let result = match tokio::time::timeout(timeout, executor.execute_task(&task)).await {
        Err(_) => {
            return Verdict::Retryable {
                error: format!("execution timed out after {:?}", timeout),
            }
        }
        Ok(Err(err)) => {
            return Verdict::Retryable {
                error: err.to_string(),
            }
        }
        Ok(Ok(result)) => result,
    };

    match result.status {
        ExecutionStatus::Fatal => Verdict::Fatal {
            error: result
                .error
                .unwrap_or_else(|| "executor reported an unrecoverable failure".to_string()),
        },
        ExecutionStatus::Failed => Verdict::Retryable {
            error: result
                .error
                .unwrap_or_else(|| "execution failed".to_string()),
        },
        ExecutionStatus::Completed => match gate.validate(&task, &result.output).await {
            Ok(report) if report.passed => Verdict::Success,
            Ok(report) => Verdict::Retryable {
                error: format!("quality gate failed: {}", report.failures.join("; ")),
            },
            Err(err) => Verdict::Retryable {
                error: format!("quality gate error: {}", err),
            },
        },
    }
}
