use std::path::{Path, PathBuf};

use git2::{Delta, DiffOptions, ErrorCode, Repository, WorktreePruneOptions};
use tracing::{debug, warn};

use crate::core::FileChanges;
use crate::Result;

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, git2::BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create `branch` from HEAD and check it out in a new worktree.
    pub fn create_worktree(&self, name: &str, branch: &str, worktree_path: &Path) -> Result<()> {
        debug!(
            branch,
            path = %worktree_path.display(),
            "GitOps::create_worktree"
        );
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        debug!(branch, commit = %commit.id(), "creating branch");
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Attach a new worktree to an existing branch.
    pub fn create_worktree_from_branch(
        &self,
        name: &str,
        branch: &str,
        worktree_path: &Path,
    ) -> Result<()> {
        debug!(
            branch,
            path = %worktree_path.display(),
            "GitOps::create_worktree_from_branch"
        );
        let repo = self.repo()?;
        let reference = repo
            .find_branch(branch, git2::BranchType::Local)?
            .into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Prune a registered worktree whose directory is gone.
    ///
    /// Leaves live worktrees alone. Returns true if something was pruned.
    pub fn prune_stale_worktree(&self, name: &str) -> Result<bool> {
        let repo = self.repo()?;
        let worktree = match repo.find_worktree(name) {
            Ok(wt) => wt,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if worktree.path().join(".git").exists() {
            return Ok(false);
        }
        debug!(name, "pruning stale worktree reference");
        let _ = worktree.unlock();
        if let Err(e) = worktree.prune(Some(
            WorktreePruneOptions::new()
                .valid(true)
                .working_tree(true)
                .locked(true),
        )) {
            warn!(name, error = %e, "worktree prune failed");
            // The admin dir must go, or git still believes the branch is checked out.
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                std::fs::remove_dir_all(&admin_dir)?;
            }
        }
        Ok(true)
    }

    /// Full id of the commit HEAD points at in `worktree_path`.
    pub fn head_commit(worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Files that differ between `baseline` and the working directory.
    ///
    /// Covers commits made since the baseline, staged and unstaged edits,
    /// and untracked files. Added and untracked paths count as created.
    pub fn changes_since(worktree_path: &Path, baseline: &str) -> Result<FileChanges> {
        let repo = Repository::open(worktree_path)?;
        let oid = git2::Oid::from_str(baseline)?;
        let tree = repo.find_commit(oid)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;

        let mut changes = FileChanges::default();
        for delta in diff.deltas() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().replace('\\', "/"));
            let Some(path) = path else {
                continue;
            };
            match delta.status() {
                Delta::Added | Delta::Untracked => changes.created.push(path),
                Delta::Unmodified | Delta::Ignored => {}
                _ => changes.modified.push(path),
            }
        }
        changes.created.sort();
        changes.created.dedup();
        changes.modified.sort();
        changes.modified.dedup();
        Ok(changes)
    }
}
