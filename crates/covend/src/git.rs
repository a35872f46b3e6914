//! Git operations for worktree lifecycle and merges.
//!
//! All operations shell out to the git CLI; the daemon never links a git
//! library. Worktrees live under `.coven/worktrees/<task-id>` on branches
//! named `coven/<task-id>`.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run git in `dir`, returning trimmed stdout on success.
fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Whether the directory is inside a git working tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Detect the default branch: remote HEAD, then `main`, then `master`.
pub fn detect_default_branch(workspace_root: &Path) -> Result<String> {
    if let Ok(full_ref) = run_git(workspace_root, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }
    for candidate in ["main", "master"] {
        let verify = format!("refs/heads/{candidate}");
        if run_git(workspace_root, &["rev-parse", "--verify", &verify]).is_ok() {
            return Ok(candidate.to_string());
        }
    }
    Ok("main".to_string())
}

/// Current branch name of a working tree.
pub fn current_branch(dir: &Path) -> Result<String> {
    run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// Create a worktree at `path` on `branch`, branching from `base` if needed.
pub fn create_worktree(
    workspace_root: &Path,
    path: &Path,
    branch: &str,
    base: &str,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let path_str = path.to_string_lossy();
    let result = run_git(
        workspace_root,
        &["worktree", "add", "-b", branch, &path_str, base],
    );
    match result {
        Ok(_) => Ok(()),
        Err(GitError::CommandFailed(msg)) if msg.contains("already exists") => {
            // Branch survives from an earlier attempt; reattach it.
            run_git(workspace_root, &["worktree", "add", &path_str, branch]).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// Remove a worktree and delete its branch.
pub fn remove_worktree(workspace_root: &Path, path: &Path, branch: &str) -> Result<()> {
    let path_str = path.to_string_lossy();
    run_git(
        workspace_root,
        &["worktree", "remove", "--force", &path_str],
    )?;
    // The branch may already be gone; that is not an error worth surfacing.
    let _ = run_git(workspace_root, &["branch", "-D", branch]);
    Ok(())
}

/// Stage and commit everything in a working tree. Returns false when there
/// was nothing to commit.
pub fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    run_git(dir, &["add", "-A"])?;
    let status = run_git(dir, &["status", "--porcelain"])?;
    if status.is_empty() {
        return Ok(false);
    }
    run_git(dir, &["commit", "-m", message])?;
    Ok(true)
}

/// Outcome of a merge attempt or probe.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub success: bool,
    pub conflicts: Vec<String>,
}

/// Probe whether `branch` merges cleanly onto `base` without touching any
/// working tree. Uses `merge-tree`, which exits non-zero on conflicts and
/// lists the conflicted paths.
pub fn merge_check(workspace_root: &Path, base: &str, branch: &str) -> Result<MergeResult> {
    let output = Command::new("git")
        .args(["merge-tree", "--write-tree", "--name-only", base, branch])
        .current_dir(workspace_root)
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        return Ok(MergeResult {
            success: true,
            conflicts: Vec::new(),
        });
    }
    // First line is the tree oid; the rest are conflicted file names.
    let conflicts = stdout
        .lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .collect();
    Ok(MergeResult {
        success: false,
        conflicts,
    })
}

/// Squash-merge `branch` onto `base` in the main working tree and commit.
///
/// On conflict the merge state is rolled back and the conflicting paths are
/// returned.
pub fn merge_squash(
    workspace_root: &Path,
    base: &str,
    branch: &str,
    message: &str,
) -> Result<MergeResult> {
    if current_branch(workspace_root)? != base {
        run_git(workspace_root, &["checkout", base])?;
    }

    let merge = Command::new("git")
        .args(["merge", "--squash", branch])
        .current_dir(workspace_root)
        .output()?;
    if !merge.status.success() {
        let conflicts = list_conflicts(workspace_root)?;
        run_git(workspace_root, &["reset", "--merge"])?;
        return Ok(MergeResult {
            success: false,
            conflicts,
        });
    }

    // A squash of an empty branch stages nothing; commit only when needed.
    let staged = run_git(workspace_root, &["status", "--porcelain"])?;
    if !staged.is_empty() {
        run_git(workspace_root, &["commit", "-m", message])?;
    }
    Ok(MergeResult {
        success: true,
        conflicts: Vec::new(),
    })
}

/// Paths with unresolved merge conflicts.
pub fn list_conflicts(dir: &Path) -> Result<Vec<String>> {
    let output = run_git(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(output
        .lines()
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect())
}

/// Discard all local changes in a working tree.
pub fn discard_changes(dir: &Path) -> Result<()> {
    run_git(dir, &["reset", "--hard"])?;
    run_git(dir, &["clean", "-fd"])?;
    Ok(())
}
