//! Workspace provisioning against a real repository, and store durability.

use std::fs;

use git2::Repository;
use tempfile::TempDir;

use kiln::core::{Phase, ResultStatus, Task, TaskStatus, WorkspaceMode, WorkspaceType};
use kiln::state::atomic::{temp_path_for, write_atomic_with, write_temp};
use kiln::workspace::WorkspaceProvisioner;
use kiln::TaskStore;

use crate::fixtures::{settle, Harness, Outcome, TestRepo};

fn head_branch(path: &std::path::Path) -> String {
    let repo = Repository::open(path).unwrap();
    let head = repo.head().unwrap();
    head.shorthand().unwrap().to_string()
}

/// Test: Repo workspace idempotence
/// Given a provisioned worktree with work in it
/// When the same task is provisioned again
/// Then the same path comes back with the work intact
#[test]
fn test_repo_workspace_is_reused() {
    let repo = TestRepo::new();
    let root = TempDir::new().unwrap();
    let provisioner = WorkspaceProvisioner::new(root.path(), &repo.path);

    let first = provisioner
        .provision("backend", "Add Login", WorkspaceMode::Repo)
        .unwrap();
    assert_eq!(first.workspace_type, WorkspaceType::GitWorktree);
    assert_eq!(first.branch.as_deref(), Some("agent/backend/add-login"));
    assert_eq!(head_branch(&first.path), "agent/backend/add-login");
    fs::write(first.path.join("login.rs"), "pub fn login() {}\n").unwrap();

    let second = provisioner
        .provision("backend", "Add Login", WorkspaceMode::Repo)
        .unwrap();
    assert_eq!(second.path, first.path);
    assert!(second.path.join("login.rs").exists());
    assert!(second.path.join("README.md").exists());
}

/// Test: Repo workspace over an existing branch
/// Given the task branch already exists
/// When the workspace is provisioned
/// Then the worktree checks out that branch
#[test]
fn test_repo_workspace_attaches_existing_branch() {
    let repo = TestRepo::new();
    repo.create_branch("agent/infra/t-9");
    let root = TempDir::new().unwrap();
    let provisioner = WorkspaceProvisioner::new(root.path(), &repo.path);

    let ws = provisioner.provision("infra", "t-9", WorkspaceMode::Repo).unwrap();
    assert_eq!(head_branch(&ws.path), "agent/infra/t-9");

    // A second provision after the directory vanished still works.
    fs::remove_dir_all(&ws.path).unwrap();
    let again = provisioner.provision("infra", "t-9", WorkspaceMode::Repo).unwrap();
    assert_eq!(head_branch(&again.path), "agent/infra/t-9");
}

/// Test: Retry keeps accumulated work
/// Given a repo-mode task whose first apply fails after writing a file
/// When the scheduler retries it
/// Then it runs again in the same worktree and branch with the file intact
#[tokio::test]
async fn test_retry_reuses_worktree() {
    let repo = TestRepo::new();
    let mut h = Harness::repo(&repo);
    h.launcher.script("login", Phase::Apply, &[Outcome::Hang]);
    h.submit(Task::new("login", "Add login"));

    h.tick().await;
    let first = h.task("login");
    assert_eq!(first.workspace_type, Some(WorkspaceType::GitWorktree));
    assert_eq!(first.branch.as_deref(), Some("agent/backend/login"));
    let worktree = first.worktree.clone().unwrap();
    fs::write(worktree.join("login.rs"), "pub fn login() {}\n").unwrap();

    h.launcher.release("login", ResultStatus::Failed);
    settle().await;
    let s = h.tick().await;
    assert_eq!(s.retried, 1);
    assert!(h.task("login").worktree.is_none());

    let s = h.tick().await;
    assert_eq!(s.dispatched, 1);
    let retried = h.task("login");
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.worktree.as_deref(), Some(worktree.as_path()));
    assert_eq!(retried.branch.as_deref(), Some("agent/backend/login"));
    assert!(worktree.join("login.rs").exists());
    assert_eq!(head_branch(&worktree), "agent/backend/login");
}

/// Test: Changed files in repo mode
/// Given a baseline taken before work
/// When files are added and edited
/// Then the diff reports them as created and modified
#[test]
fn test_repo_changes_against_baseline() {
    let repo = TestRepo::new();
    let root = TempDir::new().unwrap();
    let provisioner = WorkspaceProvisioner::new(root.path(), &repo.path);
    let ws = provisioner.provision("backend", "t-1", WorkspaceMode::Repo).unwrap();

    let baseline = WorkspaceProvisioner::baseline(&ws.path, WorkspaceMode::Repo);
    assert!(baseline.is_some());
    fs::write(ws.path.join("README.md"), "# Changed\n").unwrap();
    fs::write(ws.path.join("new.rs"), "fn main() {}\n").unwrap();

    let changes =
        WorkspaceProvisioner::changed_files(&ws.path, WorkspaceMode::Repo, baseline.as_deref()).unwrap();
    assert_eq!(changes.created, vec!["new.rs"]);
    assert_eq!(changes.modified, vec!["README.md"]);
}

/// Test: Atomic persistence
/// Given a saved task
/// When a later write dies before its rename
/// Then readers still see the previous complete record
#[test]
fn test_interrupted_write_leaves_previous_record() {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(dir.path()).unwrap();
    let mut task = Task::new("a", "Durable");
    store.create(&mut task).unwrap();

    let target = dir.path().join("tasks").join("a.json");
    write_temp(&temp_path_for(&target), b"{\"id\":\"a\",\"status\":\"compl").unwrap();

    let loaded = store.load("a").unwrap();
    assert_eq!(loaded.status, TaskStatus::Queued);
    assert_eq!(store.list_all().unwrap().len(), 1);
    assert_eq!(store.load_queue().unwrap(), vec!["a"]);
}

/// Test: Rename fallback
/// Given a rename that keeps failing
/// When a record is written
/// Then the content still lands through the direct write
#[test]
fn test_rename_failure_falls_back_to_direct_write() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("record.json");
    fs::write(&target, b"old").unwrap();

    write_atomic_with(&target, b"new", |_, _| {
        Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"))
    })
    .unwrap();
    assert_eq!(fs::read(&target).unwrap(), b"new");
}
