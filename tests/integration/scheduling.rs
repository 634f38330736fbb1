//! Dispatch ordering, dependency gating and concurrency caps.

use std::time::Duration;

use kiln::core::{Phase, ResultStatus, Task, TaskStatus};
use kiln::orchestration::SchedulerEvent;

use crate::fixtures::{settle, Harness, Outcome};

fn backend(id: &str) -> Task {
    Task::new(id, &format!("Task {id}")).with_tags(&["backend"])
}

/// Test: A/B dependency scenario
/// Given B depends on A, both backend
/// When the scheduler ticks
/// Then A runs apply and test, completes, and only then is B dispatched
#[tokio::test]
async fn test_dependent_task_waits_for_completion() {
    let mut h = Harness::new();
    h.submit(backend("a"));
    h.submit(backend("b").with_depends_on(&["a"]));

    // Tick 1: A dispatched; its apply succeeds and test starts at once.
    let s = h.tick().await;
    assert_eq!(s.dispatched, 1);
    assert_eq!(s.phases_started, 1);
    let a = h.task("a");
    assert_eq!(a.status, TaskStatus::InProgress);
    assert_eq!(a.current_phase, Phase::Test);
    assert_eq!(h.task("b").status, TaskStatus::Queued);
    assert_eq!(h.queue(), vec!["b"]);

    // Tick 2: A's test result is observed.
    let s = h.tick().await;
    assert_eq!(s.completed, 1);
    assert_eq!(s.dispatched, 0);
    let a = h.task("a");
    assert_eq!(a.status, TaskStatus::Completed);
    assert!(a.completed_at.is_some());
    assert_eq!(h.task("b").status, TaskStatus::Queued);

    // Tick 3: B is released.
    let s = h.tick().await;
    assert_eq!(s.dispatched, 1);
    assert_eq!(h.task("b").status, TaskStatus::InProgress);
    assert!(h.queue().is_empty());

    assert_eq!(
        h.launcher.launch_log(),
        vec![
            ("a".to_string(), Phase::Apply),
            ("a".to_string(), Phase::Test),
            ("b".to_string(), Phase::Apply),
            ("b".to_string(), Phase::Test),
        ]
    );
}

/// Test: Capacity scenario
/// Given backend cap 1 and two backend tasks
/// When the first is still running
/// Then the second stays queued until the first leaves the pool
#[tokio::test]
async fn test_role_cap_holds_second_task() {
    let mut h = Harness::with_caps(&[("backend", 1), ("frontend", 2)]);
    h.launcher.script("x", Phase::Apply, &[Outcome::Hang]);
    h.submit(backend("x"));
    h.submit(backend("y"));

    h.tick().await;
    h.tick().await;
    assert_eq!(h.scheduler.pool().active_for("backend"), 1);
    assert_eq!(h.task("x").status, TaskStatus::InProgress);
    assert_eq!(h.task("y").status, TaskStatus::Queued);

    h.launcher.release("x", ResultStatus::Success);
    settle().await;

    // x moves on to test inside the same slot
    let s = h.tick().await;
    assert_eq!(s.dispatched, 0);
    assert_eq!(s.phases_started, 1);
    assert_eq!(h.task("y").status, TaskStatus::Queued);

    let s = h.tick().await;
    assert_eq!(s.completed, 1);
    assert_eq!(h.task("y").status, TaskStatus::Queued);

    let s = h.tick().await;
    assert_eq!(s.dispatched, 1);
    assert_eq!(h.task("y").status, TaskStatus::InProgress);
}

/// Test: Concurrency caps
/// Given more ready tasks than capacity
/// When one tick dispatches
/// Then per-role and global caps hold
#[tokio::test]
async fn test_caps_never_exceeded() {
    let mut h = Harness::with_caps(&[("backend", 2), ("frontend", 1)]);
    for i in 0..5 {
        let id = format!("be-{i}");
        h.launcher.script(&id, Phase::Apply, &[Outcome::Hang]);
        h.submit(backend(&id));
    }
    for i in 0..3 {
        let id = format!("fe-{i}");
        h.launcher.script(&id, Phase::Apply, &[Outcome::Hang]);
        h.submit(Task::new(&id, "frontend work").with_tags(&["ui", "frontend"]));
    }

    for _ in 0..3 {
        h.tick().await;
        let pool = h.scheduler.pool();
        assert_eq!(pool.active_for("backend"), 2);
        assert_eq!(pool.active_for("frontend"), 1);
        assert!(pool.active_count() <= pool.global_cap());
    }
    assert_eq!(h.launcher.launches().len(), 3);
    assert_eq!(h.queue().len(), 5);

    let in_progress = h
        .store
        .list_all()
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count();
    assert_eq!(in_progress, 3);
}

/// Test: Untagged tasks use the default role
#[tokio::test]
async fn test_untagged_task_runs_as_default_role() {
    let mut h = Harness::new();
    h.submit(Task::new("plain", "No tags"));
    h.tick().await;

    let task = h.task("plain");
    assert_eq!(task.assignee.as_deref(), Some("backend"));
    let worktree = task.worktree.clone().expect("workspace recorded");
    assert!(worktree.ends_with("backend/plain"));
    assert!(worktree.join("README.md").exists());
    assert!(task.assignment_consistent());
}

/// Test: Lifecycle events
/// Given one task that succeeds
/// When it runs to completion
/// Then started, phase and completed events arrive in order
#[tokio::test]
async fn test_events_follow_lifecycle() {
    let mut h = Harness::new();
    h.submit(backend("a"));
    h.tick().await;
    h.tick().await;

    let events = h.drain_events();
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], SchedulerEvent::TaskStarted { task_id, role, .. } if task_id == "a" && role == "backend"));
    assert!(matches!(&events[1], SchedulerEvent::PhaseStarted { phase: Phase::Test, .. }));
    assert_eq!(
        events[2],
        SchedulerEvent::TaskCompleted {
            task_id: "a".to_string()
        }
    );
}

/// Test: Queue hygiene
/// Given queue entries for a missing task and a completed task
/// When dispatch scans the queue
/// Then both entries are dropped
#[tokio::test]
async fn test_stale_queue_entries_dropped() {
    let mut h = Harness::new();
    let mut done = backend("done");
    done.complete();
    h.store.save(&mut done).unwrap();
    h.store
        .save_queue(&["ghost".to_string(), "done".to_string()])
        .unwrap();

    let s = h.tick().await;
    assert!(s.is_idle());
    assert!(h.queue().is_empty());
}

/// Test: Workspace exclusivity
/// Given two queued ids that slug to the same workspace
/// When both are ready with capacity to spare
/// Then only one runs, and the other starts once the first is done
#[tokio::test]
async fn test_slug_twins_never_share_a_workspace() {
    let mut h = Harness::new();
    h.launcher.script("feat_a", Phase::Apply, &[Outcome::Hang]);
    h.launcher.script("feat-a", Phase::Apply, &[Outcome::Hang]);
    h.place(backend("feat_a"));
    h.place(backend("feat-a"));

    h.tick().await;
    let first = h.task("feat_a");
    assert_eq!(first.status, TaskStatus::InProgress);
    assert_eq!(h.task("feat-a").status, TaskStatus::Queued);
    assert_eq!(h.queue(), vec!["feat-a"]);
    assert_eq!(h.scheduler.pool().active_count(), 1);

    h.launcher.release("feat_a", ResultStatus::Success);
    settle().await;
    // test phase starts, then completes; the twin waits throughout
    h.tick().await;
    assert_eq!(h.task("feat-a").status, TaskStatus::Queued);
    h.tick().await;
    assert_eq!(h.task("feat_a").status, TaskStatus::Completed);
    assert_eq!(h.task("feat-a").status, TaskStatus::Queued);

    let s = h.tick().await;
    assert_eq!(s.dispatched, 1);
    let twin = h.task("feat-a");
    assert_eq!(twin.status, TaskStatus::InProgress);
    assert_eq!(twin.worktree, first.worktree);
}

/// Test: Single run waits for its workers
/// Given a worker that finishes after the first tick
/// When the scheduler runs once
/// Then it returns only after apply and test are done
#[tokio::test]
async fn test_run_once_waits_for_workers() {
    let mut h = Harness::new();
    h.launcher.script("a", Phase::Apply, &[Outcome::Hang]);
    h.submit(backend("a"));
    h.submit(backend("b").with_depends_on(&["a"]));

    let launcher = h.launcher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        launcher.release("a", ResultStatus::Success);
    });

    let s = h.scheduler.run_once(Duration::from_secs(10)).await.unwrap();
    assert_eq!(s.dispatched, 1);
    assert_eq!(s.phases_started, 1);
    assert_eq!(s.completed, 1);
    assert_eq!(h.task("a").status, TaskStatus::Completed);
    assert_eq!(h.scheduler.pool().active_count(), 0);
    // nothing new is dispatched after the first tick
    assert_eq!(h.task("b").status, TaskStatus::Queued);
}

/// Test: Single run limit
/// Given a worker that never finishes
/// When the scheduler runs once with a short limit
/// Then it returns with the worker still tracked
#[tokio::test]
async fn test_run_once_stops_at_limit() {
    let mut h = Harness::new();
    h.launcher.script("a", Phase::Apply, &[Outcome::Hang]);
    h.submit(backend("a"));

    let s = h.scheduler.run_once(Duration::from_millis(50)).await.unwrap();
    assert_eq!(s.dispatched, 1);
    assert_eq!(s.completed, 0);
    assert_eq!(h.scheduler.pool().active_count(), 1);
    assert_eq!(h.task("a").status, TaskStatus::InProgress);
}
