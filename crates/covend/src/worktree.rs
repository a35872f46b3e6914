//! Worktree provider interface and the git implementation.
//!
//! The engine consumes worktrees through this narrow seam: create an
//! isolated working copy for a task, probe and perform the merge back to
//! the base branch, abort, and clean up.

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::git::{self, GitError, MergeResult};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("worktree missing: {0}")]
    Missing(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Outcome of a merge or merge probe.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflicts: Vec<String>,
}

impl From<MergeResult> for MergeOutcome {
    fn from(r: MergeResult) -> Self {
        Self {
            success: r.success,
            conflicts: r.conflicts,
        }
    }
}

/// Isolated working copies, one per task, owned by a workflow for its
/// lifetime.
pub trait WorktreeProvider: Send + Sync {
    /// Create (or re-attach) the worktree for a task; returns its path.
    fn create(&self, task_id: &str, base_branch: &str) -> Result<PathBuf>;

    /// Probe whether the worktree's branch merges cleanly, without mutating
    /// any working tree.
    fn check(&self, path: &Path, base_branch: &str) -> Result<MergeOutcome>;

    /// Merge the worktree's branch onto the base branch and commit.
    fn merge(&self, path: &Path, base_branch: &str, message: &str) -> Result<MergeOutcome>;

    /// Discard uncommitted work in the worktree.
    fn abort(&self, path: &Path) -> Result<()>;

    /// Remove the worktree and its branch.
    fn cleanup(&self, path: &Path) -> Result<()>;
}

/// Git-CLI backed provider. Worktrees live under
/// `<workspace>/.coven/worktrees/<task-id>` on `coven/<task-id>` branches.
#[derive(Debug)]
pub struct GitWorktrees {
    workspace_root: PathBuf,
}

impl GitWorktrees {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }

    fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.workspace_root
            .join(".coven/worktrees")
            .join(sanitize(task_id))
    }

    fn branch_name(task_id: &str) -> String {
        format!("coven/{}", sanitize(task_id))
    }

    /// Recover the branch name from a worktree path.
    fn branch_for_path(path: &Path) -> String {
        let task_id = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        Self::branch_name(task_id)
    }
}

impl WorktreeProvider for GitWorktrees {
    fn create(&self, task_id: &str, base_branch: &str) -> Result<PathBuf> {
        let path = self.worktree_path(task_id);
        if path.exists() {
            // Re-acquisition on resume; the worktree must still be valid.
            return Ok(path);
        }
        git::create_worktree(
            &self.workspace_root,
            &path,
            &Self::branch_name(task_id),
            base_branch,
        )?;
        Ok(path)
    }

    fn check(&self, path: &Path, base_branch: &str) -> Result<MergeOutcome> {
        if !path.exists() {
            return Err(WorktreeError::Missing(path.display().to_string()));
        }
        let branch = Self::branch_for_path(path);
        Ok(git::merge_check(&self.workspace_root, base_branch, &branch)?.into())
    }

    fn merge(&self, path: &Path, base_branch: &str, message: &str) -> Result<MergeOutcome> {
        if !path.exists() {
            return Err(WorktreeError::Missing(path.display().to_string()));
        }
        // Land whatever the workflow left uncommitted before merging.
        git::commit_all(path, message)?;
        let branch = Self::branch_for_path(path);
        Ok(git::merge_squash(&self.workspace_root, base_branch, &branch, message)?.into())
    }

    fn abort(&self, path: &Path) -> Result<()> {
        if path.exists() {
            git::discard_changes(path)?;
        }
        Ok(())
    }

    fn cleanup(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let branch = Self::branch_for_path(path);
        git::remove_worktree(&self.workspace_root, path, &branch)?;
        Ok(())
    }
}

/// Filesystem- and ref-safe task id.
fn sanitize(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
