//! Workspace provisioning for worker runs.
//!
//! Every task gets `<root>/<role>/<slug(task_id)>`. In repo mode that
//! directory is a git worktree on `agent/<role>/<slug>` and survives retries;
//! in fresh mode it is wiped and recreated each time.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::{slug, FileChanges, WorkspaceMode, WorkspaceType};
use crate::git::GitOps;
use crate::{Error, Result};

/// A workspace ready for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedWorkspace {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub workspace_type: WorkspaceType,
}

#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    root: PathBuf,
    repo_path: PathBuf,
}

impl WorkspaceProvisioner {
    pub fn new(root: &Path, repo_path: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            repo_path: repo_path.to_path_buf(),
        }
    }

    /// Canonical workspace location for a task.
    pub fn workspace_path(&self, role: &str, task_id: &str) -> PathBuf {
        self.root.join(slug(role)).join(slug(task_id))
    }

    pub fn branch_name(role: &str, task_id: &str) -> String {
        format!("agent/{}/{}", slug(role), slug(task_id))
    }

    fn worktree_name(role: &str, task_id: &str) -> String {
        format!("{}-{}", slug(role), slug(task_id))
    }

    /// Create or reuse the workspace for `(role, task_id)`.
    pub fn provision(
        &self,
        role: &str,
        task_id: &str,
        mode: WorkspaceMode,
    ) -> Result<ProvisionedWorkspace> {
        debug!(role, task_id, %mode, "provision");
        match mode {
            WorkspaceMode::Fresh => self.provision_fresh(role, task_id),
            WorkspaceMode::Repo => self
                .provision_repo(role, task_id)
                .map_err(|e| match e {
                    Error::Provision(_) => e,
                    other => Error::Provision(other.to_string()),
                }),
        }
    }

    fn provision_fresh(&self, role: &str, task_id: &str) -> Result<ProvisionedWorkspace> {
        let path = self.workspace_path(role, task_id);
        if path.exists() {
            debug!(path = %path.display(), "removing previous scratch workspace");
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        write_scaffold(&path, role, task_id)?;
        info!(role, task_id, path = %path.display(), "fresh workspace ready");
        Ok(ProvisionedWorkspace {
            path: absolute(&path)?,
            branch: None,
            workspace_type: WorkspaceType::Fresh,
        })
    }

    fn provision_repo(&self, role: &str, task_id: &str) -> Result<ProvisionedWorkspace> {
        let path = self.workspace_path(role, task_id);
        let branch = Self::branch_name(role, task_id);

        // The worktree's `.git` file marks a workspace worth keeping.
        if path.join(".git").exists() {
            debug!(path = %path.display(), "reusing existing worktree");
            return Ok(ProvisionedWorkspace {
                path: absolute(&path)?,
                branch: Some(branch),
                workspace_type: WorkspaceType::GitWorktree,
            });
        }

        let git = GitOps::new(&self.repo_path)
            .map_err(|e| Error::Provision(format!("{} is not a git repository: {e}", self.repo_path.display())))?;
        let name = Self::worktree_name(role, task_id);

        if path.exists() {
            warn!(path = %path.display(), "workspace directory without worktree marker, removing");
            fs::remove_dir_all(&path)?;
        }
        git.prune_stale_worktree(&name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if git.branch_exists(&branch)? {
            debug!(branch, "attaching worktree to existing branch");
            git.create_worktree_from_branch(&name, &branch, &path)?;
        } else {
            git.create_worktree(&name, &branch, &path)?;
        }
        info!(role, task_id, branch, path = %path.display(), "worktree ready");
        Ok(ProvisionedWorkspace {
            path: absolute(&path)?,
            branch: Some(branch),
            workspace_type: WorkspaceType::GitWorktree,
        })
    }

    /// Baseline commit to diff against after a repo-mode run.
    pub fn baseline(path: &Path, mode: WorkspaceMode) -> Option<String> {
        match mode {
            WorkspaceMode::Fresh => None,
            WorkspaceMode::Repo => match GitOps::head_commit(path) {
                Ok(commit) => Some(commit),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not read baseline commit");
                    None
                }
            },
        }
    }

    /// Files created or modified in a workspace during a run.
    ///
    /// Repo mode diffs against `baseline` and reports nothing without one,
    /// since a checkout listing says nothing about the run. Fresh mode
    /// reports every file present as created.
    pub fn changed_files(
        path: &Path,
        mode: WorkspaceMode,
        baseline: Option<&str>,
    ) -> Result<FileChanges> {
        match (mode, baseline) {
            (WorkspaceMode::Repo, Some(base)) => GitOps::changes_since(path, base),
            (WorkspaceMode::Repo, None) => {
                warn!(path = %path.display(), "no baseline commit, file changes unknown");
                Ok(FileChanges::default())
            }
            (WorkspaceMode::Fresh, _) => {
                let mut created = Vec::new();
                collect_files(path, path, &mut created)?;
                created.sort();
                Ok(FileChanges {
                    created,
                    modified: Vec::new(),
                })
            }
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(fs::canonicalize(path)?)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name() == ".git" {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

fn ignore_patterns(role: &str) -> &'static str {
    match role {
        "backend" => "target/\n__pycache__/\n*.pyc\n.env\n",
        "frontend" => "node_modules/\ndist/\nbuild/\n.env\n",
        "infra" => ".terraform/\n*.tfstate\n*.tfstate.backup\n.env\n",
        _ => ".env\n",
    }
}

fn write_scaffold(path: &Path, role: &str, task_id: &str) -> Result<()> {
    let readme = format!(
        "# {task_id}\n\nScratch workspace for the {role} worker.\n\
         Everything for this task lives in this directory.\n"
    );
    fs::write(path.join("README.md"), readme)?;
    fs::write(path.join(".gitignore"), ignore_patterns(role))?;
    Ok(())
}
