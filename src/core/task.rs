//! Task data model.
//!
//! A task is the durable unit of work. Its status is mutated only by the
//! scheduler; workers read a snapshot and report through result records.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::{Error, Result};

/// Maximum length of a slug used in paths and branch names.
pub const SLUG_MAX_LEN: usize = 50;

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// A sub-stage of executing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Plan,
    Apply,
    Test,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Apply => "apply",
            Phase::Test => "test",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plan" => Ok(Phase::Plan),
            "apply" => Ok(Phase::Apply),
            "test" => Ok(Phase::Test),
            other => Err(Error::Validation(format!("unknown phase '{other}'"))),
        }
    }
}

/// How a workspace is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    /// Empty scratch directory, destroyed and recreated on every provision.
    Fresh,
    /// Git worktree on a dedicated branch, reused across retries.
    #[default]
    Repo,
}

impl WorkspaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceMode::Fresh => "fresh",
            WorkspaceMode::Repo => "repo",
        }
    }

    pub fn workspace_type(&self) -> WorkspaceType {
        match self {
            WorkspaceMode::Fresh => WorkspaceType::Fresh,
            WorkspaceMode::Repo => WorkspaceType::GitWorktree,
        }
    }
}

impl std::fmt::Display for WorkspaceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkspaceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fresh" => Ok(WorkspaceMode::Fresh),
            "repo" => Ok(WorkspaceMode::Repo),
            other => Err(Error::Validation(format!("unknown workspace mode '{other}'"))),
        }
    }
}

/// Persisted kind of a provisioned workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceType {
    GitWorktree,
    Fresh,
}

/// A single durable task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Earlier tasks whose latest results are summarized into the instruction.
    #[serde(default)]
    pub context_from: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Informational; dispatch always starts at `apply`.
    #[serde(default)]
    pub current_phase: Phase,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_type: Option<WorkspaceType>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a queued task with the given id and title.
    pub fn new(id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            context_from: Vec::new(),
            tags: Vec::new(),
            status: TaskStatus::Queued,
            current_phase: Phase::Plan,
            depends_on: Vec::new(),
            assignee: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            worktree: None,
            branch: None,
            workspace_type: None,
            retry_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Record a provisioned workspace and the role that owns the task.
    pub fn assign(
        &mut self,
        role: &str,
        worktree: PathBuf,
        branch: Option<String>,
        workspace_type: WorkspaceType,
    ) {
        self.status = TaskStatus::Assigned;
        self.assignee = Some(role.to_string());
        self.assigned_at = Some(Utc::now());
        self.worktree = Some(worktree);
        self.branch = branch;
        self.workspace_type = Some(workspace_type);
    }

    /// Mark an assigned task as running the given phase.
    pub fn start(&mut self, phase: Phase) {
        self.status = TaskStatus::InProgress;
        self.current_phase = phase;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.failure_reason = None;
    }

    pub fn fail(&mut self, reason: &str) {
        self.status = TaskStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.failure_reason = Some(reason.to_string());
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked;
        self.failed_at = Some(Utc::now());
        self.failure_reason = Some(reason.to_string());
    }

    /// Drop all assignment and workspace fields together.
    pub fn clear_assignment(&mut self) {
        self.assignee = None;
        self.assigned_at = None;
        self.started_at = None;
        self.worktree = None;
        self.branch = None;
        self.workspace_type = None;
    }

    /// Return to the queue without consuming a retry.
    pub fn requeue(&mut self) {
        self.clear_assignment();
        self.status = TaskStatus::Queued;
        self.completed_at = None;
        self.failed_at = None;
    }

    /// Return to the queue after a phase failure, consuming one retry.
    ///
    /// `current_phase` goes back to `plan` for compatibility with existing
    /// readers even though the next dispatch runs `apply`.
    pub fn retry(&mut self, reason: &str) {
        self.retry_count += 1;
        self.requeue();
        self.current_phase = Phase::Plan;
        self.failure_reason = Some(reason.to_string());
    }

    /// True when the assignment fields are all present or all absent.
    pub fn assignment_consistent(&self) -> bool {
        let present = [
            self.assignee.is_some(),
            self.assigned_at.is_some(),
            self.started_at.is_some(),
            self.worktree.is_some(),
        ];
        present.iter().all(|p| *p) || present.iter().all(|p| !*p)
    }
}

/// Reject ids that cannot be used as a file name.
pub fn validate_task_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.starts_with('_')
        || id.contains("__")
        || id.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if bad {
        return Err(Error::InvalidTaskId(id.to_string()));
    }
    Ok(())
}

fn non_alnum() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static regex"))
}

/// Filesystem- and branch-safe form of arbitrary text.
pub fn slug(text: &str) -> String {
    let lower = text.to_lowercase();
    let replaced = non_alnum().replace_all(&lower, "-");
    let trimmed = replaced.trim_matches('-');
    let mut out: String = trimmed.chars().take(SLUG_MAX_LEN).collect();
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("task");
    }
    out
}
