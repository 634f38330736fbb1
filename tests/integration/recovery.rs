//! Retry policy, spawn failures and zombie recovery.

use chrono::{Duration, Utc};
use std::path::PathBuf;

use kiln::core::{Phase, ResultStatus, Task, TaskStatus, WorkspaceType};
use kiln::orchestration::SchedulerEvent;

use crate::fixtures::{settle, Harness, Outcome};

fn fail() -> Outcome {
    Outcome::Report(ResultStatus::Failed)
}

/// Test: Retry bound
/// Given a task whose apply always fails
/// When three attempts fail
/// Then it is failed with retry_count 2 and out of the queue
#[tokio::test]
async fn test_retry_bound() {
    let mut h = Harness::new();
    h.launcher.script("a", Phase::Apply, &[fail(), fail(), fail()]);
    h.submit(Task::new("a", "Always fails"));

    h.tick().await;
    let a = h.task("a");
    assert_eq!(a.status, TaskStatus::Queued);
    assert_eq!(a.retry_count, 1);
    assert_eq!(a.current_phase, Phase::Plan);
    assert!(a.assignee.is_none() && a.worktree.is_none() && a.started_at.is_none());
    assert_eq!(h.queue(), vec!["a"]);

    h.tick().await;
    assert_eq!(h.task("a").retry_count, 2);

    let s = h.tick().await;
    assert_eq!(s.failed, 1);
    let a = h.task("a");
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.retry_count, 2);
    assert!(a.failed_at.is_some());
    assert!(a
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("scripted failed")));
    assert!(h.queue().is_empty());

    // nothing more happens
    assert!(h.tick().await.is_idle());
    assert_eq!(h.launcher.launches().len(), 3);
}

/// Test: Retry then success
/// Given a test phase that fails once
/// When the task is retried
/// Then it starts again from apply and completes
#[tokio::test]
async fn test_failed_test_phase_restarts_at_apply() {
    let mut h = Harness::new();
    h.launcher.script("a", Phase::Test, &[fail()]);
    h.submit(Task::new("a", "Flaky tests"));

    for _ in 0..4 {
        h.tick().await;
    }
    let a = h.task("a");
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.retry_count, 1);
    assert_eq!(
        h.launcher.launch_log(),
        vec![
            ("a".to_string(), Phase::Apply),
            ("a".to_string(), Phase::Test),
            ("a".to_string(), Phase::Apply),
            ("a".to_string(), Phase::Test),
        ]
    );
}

/// Test: Blocked results
/// Given a worker that keeps reporting blocked
/// When retries run out
/// Then the task ends blocked, not failed
#[tokio::test]
async fn test_exhausted_blocked_task_is_blocked() {
    let mut h = Harness::new();
    let blocked = Outcome::Report(ResultStatus::Blocked);
    h.launcher.script("a", Phase::Apply, &[blocked, blocked, blocked]);
    h.submit(Task::new("a", "Needs credentials"));

    for _ in 0..3 {
        h.tick().await;
    }
    let a = h.task("a");
    assert_eq!(a.status, TaskStatus::Blocked);
    assert_eq!(a.retry_count, 2);
    let events = h.drain_events();
    assert!(matches!(events.last(), Some(SchedulerEvent::TaskBlocked { .. })));
}

/// Test: Exit without a result record
/// Given a worker that exits 0 but writes nothing
/// When the monitor observes it
/// Then it counts as a phase failure
#[tokio::test]
async fn test_exit_without_record_is_failure() {
    let mut h = Harness::new();
    h.launcher.script("a", Phase::Apply, &[Outcome::ExitOnly(0)]);
    h.submit(Task::new("a", "Silent worker"));

    let s = h.tick().await;
    assert_eq!(s.retried, 1);
    let a = h.task("a");
    assert_eq!(a.retry_count, 1);
    assert!(a
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("without a result record")));
}

/// Test: Spawn failure requeue
/// Given a launch that fails
/// When dispatch tries the task
/// Then it is queued again with no retry consumed
#[tokio::test]
async fn test_spawn_failure_requeues() {
    let mut h = Harness::new();
    h.launcher.script("a", Phase::Apply, &[Outcome::SpawnError]);
    h.submit(Task::new("a", "Unlucky"));

    let s = h.tick().await;
    assert_eq!(s.requeued, 1);
    assert_eq!(s.dispatched, 0);
    let a = h.task("a");
    assert_eq!(a.status, TaskStatus::Queued);
    assert_eq!(a.retry_count, 0);
    assert!(a.assignee.is_none());
    assert!(a.worktree.is_none());
    assert_eq!(h.queue(), vec!["a"]);
    assert_eq!(h.scheduler.pool().active_count(), 0);

    let s = h.tick().await;
    assert_eq!(s.dispatched, 1);
}

/// Test: Zombie liveness
/// Given an in_progress task started 10 minutes ago with no worker
/// When one tick runs with a 5 minute threshold
/// Then it is queued again with its assignment cleared
#[tokio::test]
async fn test_zombie_task_requeued() {
    let mut h = Harness::new();
    let mut task = Task::new("z", "Orphaned");
    task.assign("backend", PathBuf::from("/gone"), None, WorkspaceType::Fresh);
    task.start(Phase::Apply);
    task.started_at = Some(Utc::now() - Duration::minutes(10));
    h.store.save(&mut task).unwrap();

    let mut recent = Task::new("r", "Recently started elsewhere");
    recent.assign("backend", PathBuf::from("/ws"), None, WorkspaceType::Fresh);
    recent.start(Phase::Apply);
    recent.started_at = Some(Utc::now() - Duration::minutes(1));
    h.store.save(&mut recent).unwrap();

    let s = h.tick().await;
    assert_eq!(s.recovered, 1);
    let z = h.task("z");
    assert_eq!(z.status, TaskStatus::Queued);
    assert!(z.assignee.is_none());
    assert!(z.worktree.is_none());
    assert!(z.started_at.is_none());
    assert_eq!(z.retry_count, 0);
    assert_eq!(h.queue(), vec!["z"]);
    assert_eq!(h.task("r").status, TaskStatus::InProgress);
}

/// Test: Tracked workers are not zombies
/// Given a long-running worker the scheduler tracks
/// When its start time is old
/// Then zombie recovery leaves it alone
#[tokio::test]
async fn test_tracked_worker_not_recovered() {
    let mut h = Harness::new();
    h.launcher.script("a", Phase::Apply, &[Outcome::Hang]);
    h.submit(Task::new("a", "Slow"));
    h.tick().await;

    let mut a = h.task("a");
    a.started_at = Some(Utc::now() - Duration::hours(1));
    h.store.save(&mut a).unwrap();

    let s = h.tick().await;
    assert_eq!(s.recovered, 0);
    assert_eq!(h.task("a").status, TaskStatus::InProgress);
}

/// Test: Aborted worker
/// Given a running worker
/// When an administrator aborts it
/// Then the next monitor pass treats it as a phase failure
#[tokio::test]
async fn test_abort_worker_counts_as_failure() {
    let mut h = Harness::new();
    h.launcher.script("a", Phase::Apply, &[Outcome::Hang]);
    h.submit(Task::new("a", "Runaway"));
    h.tick().await;

    assert!(h.scheduler.abort_worker("a"));
    assert!(!h.scheduler.abort_worker("nobody"));
    settle().await;

    let s = h.tick().await;
    assert_eq!(s.retried, 1);
    let a = h.task("a");
    assert_eq!(a.retry_count, 1);
    assert!(a
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("aborted")));
}

/// Test: Broken dependency
/// Given a dependency that failed
/// When the dependent task is scanned
/// Then it becomes blocked and leaves the queue
#[tokio::test]
async fn test_failed_dependency_blocks_dependent() {
    let mut h = Harness::new();
    let mut dep = Task::new("dep", "Broken upstream");
    dep.fail("gave up");
    h.store.save(&mut dep).unwrap();
    h.submit(Task::new("down", "Downstream").with_depends_on(&["dep"]));

    let s = h.tick().await;
    assert_eq!(s.blocked, 1);
    let down = h.task("down");
    assert_eq!(down.status, TaskStatus::Blocked);
    assert_eq!(down.failure_reason.as_deref(), Some("dependency dep is failed"));
    assert!(h.queue().is_empty());
    assert!(h.launcher.launches().is_empty());
}

/// Test: Unknown dependency
/// Given a dependency id with no task
/// When the scheduler ticks
/// Then the task keeps waiting
#[tokio::test]
async fn test_unknown_dependency_waits() {
    let mut h = Harness::new();
    h.submit(Task::new("down", "Downstream").with_depends_on(&["not-yet"]));
    h.tick().await;
    assert_eq!(h.task("down").status, TaskStatus::Queued);
    assert_eq!(h.queue(), vec!["down"]);
}
