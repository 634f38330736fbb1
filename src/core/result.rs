//! Immutable per-run result records written by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::task::{Phase, TaskStatus};

/// Outcome reported by a worker for one phase run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
    Blocked,
}

impl ResultStatus {
    /// Process exit code a worker uses for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            ResultStatus::Success => 0,
            ResultStatus::Failed => 1,
            ResultStatus::Blocked => 2,
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Success => "success",
            ResultStatus::Failed => "failed",
            ResultStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Files touched during a run, relative to the workspace root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanges {
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty()
    }

    pub fn total(&self) -> usize {
        self.created.len() + self.modified.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: String,
    pub run_id: String,
    pub role: String,
    pub phase: Phase,
    pub workspace_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub status: ResultStatus,
    #[serde(default)]
    pub notes: String,
    /// Status the worker suggests; the scheduler decides.
    pub next_state: TaskStatus,
    #[serde(default)]
    pub files: FileChanges,
    /// Whether the tool emitted an explicit completion message.
    pub tool_completed: bool,
    pub exit_code: Option<i32>,
    pub output_line_count: usize,
}

impl ResultRecord {
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Suggested task status after a run with the given outcome.
    pub fn suggested_next(phase: Phase, status: ResultStatus) -> TaskStatus {
        match (status, phase) {
            (ResultStatus::Success, Phase::Test) => TaskStatus::Completed,
            (ResultStatus::Success, _) => TaskStatus::InProgress,
            (ResultStatus::Blocked, _) => TaskStatus::Blocked,
            (ResultStatus::Failed, _) => TaskStatus::Queued,
        }
    }
}

/// Generate a unique run identifier, sortable by creation time.
pub fn new_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &short[..8])
}
