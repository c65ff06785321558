//! Failure recovery, pause/resume, and teardown tests.
//!
//! These tests verify that transient failures are retried and absorbed,
//! exhausted tasks escalate to blockers without poisoning the rest of
//! the graph, pausing stops dispatch without losing in-flight work, and
//! shutdown discards abandoned results.

use std::sync::Arc;
use std::time::Duration;

use foreman::core::task::TaskStatus;
use foreman::orchestration::executor::WorkerExecutor;
use foreman::orchestration::pool::AgentEvent;
use foreman::orchestration::scheduler::SchedulerEvent;

use crate::fixtures::{
    backend_task, quick_config, wait_for, CountingExecutor, GatedExecutor, Harness,
    ScriptedExecutor,
};

/// Test: A flaky task retries and still completes
/// Given a task that fails twice before succeeding
/// When the scheduler runs with max_retries 3
/// Then the run completes with 2 retries absorbed
#[tokio::test]
async fn test_flaky_task_retries_to_completion() {
    let executor = Arc::new(ScriptedExecutor::new().fail_times("task-a", 2));
    let mut harness = Harness::new(quick_config(2), Arc::clone(&executor) as Arc<dyn WorkerExecutor>);

    harness
        .scheduler
        .submit_task_graph(vec![backend_task("task-a")], vec![])
        .await
        .unwrap();

    let summary = harness.scheduler.run().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.blocked, 0);
    assert_eq!(summary.retries, 2);
    assert_eq!(executor.executions().len(), 3);
    assert_eq!(harness.blockers.open_count().await, 0);
}

/// Test: Retry exhaustion escalates to a blocker
/// Given a task that always fails and has one dependent
/// When retries run out
/// Then the task blocks, a blocker is created, and the dependent never runs
#[tokio::test]
async fn test_exhausted_task_blocks_and_escalates() {
    let executor = Arc::new(ScriptedExecutor::new().fail_times("task-a", 99));
    let mut harness = Harness::new(quick_config(2), Arc::clone(&executor) as Arc<dyn WorkerExecutor>);

    let a = backend_task("task-a");
    let b = backend_task("task-b");
    let (id_a, id_b) = (a.id, b.id);
    harness
        .scheduler
        .submit_task_graph(vec![a, b], vec![(id_a, id_b)])
        .await
        .unwrap();

    let summary = harness.scheduler.run().await.unwrap();

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.retries, 3);

    // Only the failing task executed.
    assert!(executor.executions().iter().all(|n| n == "task-a"));

    // The blocker carries the failing task and a reason.
    let blockers = harness.blockers.for_task(id_a).await;
    assert_eq!(blockers.len(), 1);
    assert!(blockers[0].reason.contains("retries exhausted"));

    // The dependent stays Pending and was persisted that way at submit.
    let status = harness.scheduler.get_status().await;
    assert_eq!(status.tasks.pending, 1);
    assert_eq!(status.tasks.blocked, 1);
    assert!(harness.blockers.for_task(id_b).await.is_empty());
}

/// Test: A failure does not poison independent siblings
#[tokio::test]
async fn test_independent_tasks_survive_a_failure() {
    let executor = Arc::new(ScriptedExecutor::new().fail_times("doomed", 99));
    let mut harness = Harness::new(quick_config(3), Arc::clone(&executor) as Arc<dyn WorkerExecutor>);

    let tasks = vec![
        backend_task("doomed"),
        backend_task("fine-1"),
        backend_task("fine-2"),
    ];
    harness
        .scheduler
        .submit_task_graph(tasks, vec![])
        .await
        .unwrap();

    let summary = harness.scheduler.run().await.unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.blocked, 1);
}

/// Test: Pause stops new dispatches but in-flight work completes
/// Given one running task and one queued behind a single agent slot
/// When the scheduler is paused and the running task finishes
/// Then its result is applied but nothing new dispatches until resume
#[tokio::test]
async fn test_pause_stops_dispatch_resume_continues() {
    let executor = GatedExecutor::new();
    let harness = Harness::new(quick_config(1), Arc::clone(&executor) as Arc<dyn WorkerExecutor>);

    let tasks = vec![backend_task("task-a"), backend_task("task-b")];
    harness
        .scheduler
        .submit_task_graph(tasks, vec![])
        .await
        .unwrap();

    let control = harness.scheduler.control();
    let mut scheduler = harness.scheduler;
    let run = tokio::spawn(async move { scheduler.run().await });

    let exec = Arc::clone(&executor);
    wait_for("first dispatch", move || exec.started_count() == 1).await;

    control.pause();

    // Let the in-flight task finish while paused: its result is applied.
    executor.release(1);
    let mut applied = false;
    for _ in 0..200 {
        if control.get_status().await.tasks.completed == 1 {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(applied, "in-flight result was not applied while paused");

    // No new dispatch while paused.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(executor.started_count(), 1);
    let status = control.get_status().await;
    assert_eq!(status.tasks.completed, 1);
    assert_eq!(status.tasks.ready, 1);
    assert!(status.paused);

    // Resume: the queued task dispatches and the run finishes.
    control.resume();
    let exec = Arc::clone(&executor);
    wait_for("second dispatch", move || exec.started_count() == 2).await;
    executor.release(1);

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.completed, 2);
}

/// Test: Shutdown abandons in-flight dispatches
/// Given a task held in flight
/// When the run is shut down
/// Then the run exits without applying the abandoned result
#[tokio::test]
async fn test_shutdown_discards_inflight_results() {
    let executor = GatedExecutor::new();
    let harness = Harness::new(quick_config(2), Arc::clone(&executor) as Arc<dyn WorkerExecutor>);

    let a = backend_task("task-a");
    let id_a = a.id;
    harness
        .scheduler
        .submit_task_graph(vec![a], vec![])
        .await
        .unwrap();

    let control = harness.scheduler.control();
    let store = Arc::clone(&harness.store);
    let mut scheduler = harness.scheduler;
    let run = tokio::spawn(async move { scheduler.run().await });

    let exec = Arc::clone(&executor);
    wait_for("dispatch", move || exec.started_count() == 1).await;

    control.shutdown();
    let summary = run.await.unwrap().unwrap();

    // Nothing completed; the abandoned dispatch was never applied.
    assert_eq!(summary.completed, 0);
    let status = control.get_status().await;
    assert_eq!(status.tasks.completed, 0);
    assert_eq!(status.tasks.dispatched, 1);
    assert_eq!(store.persisted(id_a).await, Some(TaskStatus::Dispatched));

    // Releasing after teardown must not resurrect the result.
    executor.release(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(control.get_status().await.tasks.completed, 0);
}

/// Test: Idle agents are retired once past the idle timeout
#[tokio::test]
async fn test_idle_agents_retire_after_timeout() {
    let executor = CountingExecutor::new(Duration::from_millis(1));
    let mut config = quick_config(2);
    config.idle_agent_timeout_secs = 0;
    let mut harness = Harness::new(config, Arc::clone(&executor) as Arc<dyn WorkerExecutor>);

    let a = backend_task("task-a");
    let b = backend_task("task-b");
    let (id_a, id_b) = (a.id, b.id);
    harness
        .scheduler
        .submit_task_graph(vec![a, b], vec![(id_a, id_b)])
        .await
        .unwrap();

    let summary = harness.scheduler.run().await.unwrap();
    assert_eq!(summary.completed, 2);

    let mut retired = 0;
    while let Ok(event) = harness.agent_rx.try_recv() {
        if matches!(event, AgentEvent::Retired { .. }) {
            retired += 1;
        }
    }
    assert!(retired >= 1, "Idle agent should have been retired");
}

/// Test: The run emits a settled event at its fixed point
#[tokio::test]
async fn test_settled_event_emitted_at_fixed_point() {
    let executor = CountingExecutor::new(Duration::from_millis(1));
    let mut harness = Harness::new(quick_config(2), Arc::clone(&executor) as Arc<dyn WorkerExecutor>);

    harness
        .scheduler
        .submit_task_graph(vec![backend_task("task-a")], vec![])
        .await
        .unwrap();

    harness.scheduler.run().await.unwrap();

    let mut settled = false;
    while let Ok(event) = harness.event_rx.try_recv() {
        if matches!(event, SchedulerEvent::AllTasksSettled) {
            settled = true;
        }
    }
    assert!(settled);
}
