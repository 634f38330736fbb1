//! One-shot phase execution inside a provisioned workspace.
//!
//! A worker reads its task, runs the code-generation tool once, diffs the
//! workspace and writes exactly one result record. It never saves the task
//! and never touches the queue; the scheduler owns both.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{FileChanges, Phase, ResultRecord, ResultStatus, Task, WorkspaceMode};
use crate::error::Result;
use crate::log;
use crate::orchestration::claude::{ClaudeHeadless, ToolRun};
use crate::orchestration::prompt::{build_instruction, ContextSummary};
use crate::state::TaskStore;
use crate::util;
use crate::workspace::WorkspaceProvisioner;

const NOTES_LIMIT: usize = 2000;

/// Arguments of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRequest {
    pub task_id: String,
    pub role: String,
    pub phase: Phase,
    pub workspace: PathBuf,
    pub run_id: String,
    pub mode: WorkspaceMode,
}

pub struct PhaseRunner {
    store: TaskStore,
    /// `None` when the tool could not be located.
    tool: Option<ClaudeHeadless>,
    workspace_root: PathBuf,
}

impl PhaseRunner {
    pub fn new(store: TaskStore, tool: Option<ClaudeHeadless>, workspace_root: &Path) -> Self {
        Self {
            store,
            tool,
            workspace_root: workspace_root.to_path_buf(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let store = TaskStore::open(&config.store_dir())?;
        let tool = match config.tool_binary() {
            Ok(binary) => Some(
                ClaudeHeadless::with_binary(binary)
                    .with_timeout(config.phase_timeout())
                    .with_args(config.tool_args.clone()),
            ),
            Err(e) => {
                warn!(error = %e, "code-generation tool unavailable");
                None
            }
        };
        Ok(Self::new(store, tool, &config.workspace_root()))
    }

    /// Run the phase and persist its result record.
    pub async fn run(&self, req: &PhaseRequest) -> Result<ResultRecord> {
        let task = self.store.load(&req.task_id)?;
        info!(task_id = %req.task_id, phase = %req.phase, run_id = %req.run_id, "worker started");
        let record = self.execute(&task, req).await?;
        self.store.write_result(&record)?;
        info!(task_id = %req.task_id, status = %record.status, files = record.files.total(), "worker finished");
        Ok(record)
    }

    async fn execute(&self, task: &Task, req: &PhaseRequest) -> Result<ResultRecord> {
        if !req.workspace.is_dir() {
            let notes = format!("workspace {} does not exist", req.workspace.display());
            return Ok(blocked(req, notes));
        }
        let Some(tool) = &self.tool else {
            return Ok(blocked(req, "code-generation tool not found".to_string()));
        };
        if log::is_debug() {
            self.check_isolation(&req.workspace);
        }

        let context = self.context_for(task);
        let instruction = build_instruction(task, &req.role, req.phase, &req.workspace, &context);

        let (ws, mode) = (req.workspace.clone(), req.mode);
        let baseline = util::blocking(move || Ok(WorkspaceProvisioner::baseline(&ws, mode))).await?;

        let run = match tool.execute(&instruction, &req.workspace).await {
            Ok(run) => run,
            Err(e) => return Ok(blocked(req, format!("could not start tool: {e}"))),
        };

        let ws = req.workspace.clone();
        let files = match util::blocking(move || {
            WorkspaceProvisioner::changed_files(&ws, mode, baseline.as_deref())
        })
        .await
        {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "could not compute file changes");
                FileChanges::default()
            }
        };
        Ok(reconcile(req, &run, files))
    }

    /// Latest results of the tasks named in `context_from`.
    fn context_for(&self, task: &Task) -> Vec<ContextSummary> {
        let mut context = Vec::new();
        for id in &task.context_from {
            match self.load_context(id) {
                Ok(Some(summary)) => context.push(summary),
                Ok(None) => debug!(context = %id, "no context available"),
                Err(e) => warn!(context = %id, error = %e, "could not load context"),
            }
        }
        context
    }

    fn load_context(&self, task_id: &str) -> Result<Option<ContextSummary>> {
        let Some(source) = self.store.get(task_id)? else {
            return Ok(None);
        };
        Ok(self
            .store
            .latest_result(task_id)?
            .map(|result| ContextSummary {
                task_id: source.id,
                title: source.title,
                result,
            }))
    }

    /// Warn if the workspace is not under the configured root.
    fn check_isolation(&self, workspace: &Path) {
        let (Ok(ws), Ok(root)) = (workspace.canonicalize(), self.workspace_root.canonicalize()) else {
            warn!(workspace = %workspace.display(), "isolation check skipped: path not resolvable");
            return;
        };
        if ws.starts_with(&root) {
            debug!(workspace = %ws.display(), "isolation check passed");
        } else {
            warn!(
                workspace = %ws.display(),
                root = %root.display(),
                "workspace lies outside the workspace root"
            );
        }
    }
}

fn record(
    req: &PhaseRequest,
    status: ResultStatus,
    notes: String,
    files: FileChanges,
    tool_completed: bool,
    exit_code: Option<i32>,
    output_line_count: usize,
) -> ResultRecord {
    ResultRecord {
        task_id: req.task_id.clone(),
        run_id: req.run_id.clone(),
        role: req.role.clone(),
        phase: req.phase,
        workspace_path: req.workspace.clone(),
        timestamp: Utc::now(),
        status,
        notes: util::truncate_chars(&notes, NOTES_LIMIT),
        next_state: ResultRecord::suggested_next(req.phase, status),
        files,
        tool_completed,
        exit_code,
        output_line_count,
    }
}

fn blocked(req: &PhaseRequest, notes: String) -> ResultRecord {
    warn!(task_id = %req.task_id, %notes, "phase blocked");
    record(req, ResultStatus::Blocked, notes, FileChanges::default(), false, None, 0)
}

/// Decide the outcome of a tool run.
///
/// An explicit completion message settles it. Without one, a clean exit
/// counts as success only if the workspace changed.
pub fn reconcile(req: &PhaseRequest, run: &ToolRun, files: FileChanges) -> ResultRecord {
    let summary = &run.summary;
    let (status, outcome) = if run.timed_out {
        (ResultStatus::Failed, "tool timed out".to_string())
    } else if run.exit_code != Some(0) {
        let code = run
            .exit_code
            .map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
        (ResultStatus::Failed, format!("tool exited with {code}"))
    } else if summary.result_seen && summary.result_is_error {
        (ResultStatus::Failed, "tool reported an error".to_string())
    } else if summary.result_seen {
        (ResultStatus::Success, String::new())
    } else if !files.is_empty() {
        (
            ResultStatus::Success,
            format!("no completion message; {} files changed", files.total()),
        )
    } else {
        (
            ResultStatus::Failed,
            "no completion message and no files changed".to_string(),
        )
    };

    let mut notes = Vec::new();
    if !outcome.is_empty() {
        notes.push(outcome);
    }
    if let Some(text) = summary.final_text() {
        notes.push(text.trim().to_string());
    }
    if status != ResultStatus::Success && !run.stderr_tail.is_empty() {
        notes.push(format!("stderr: {}", run.stderr_tail));
    }

    record(
        req,
        status,
        notes.join("\n"),
        files,
        summary.result_seen,
        run.exit_code,
        summary.line_count,
    )
}
