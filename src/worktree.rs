//! Git worktree management for isolated per-epic working directories.
//!
//! Generalized from the single-purpose per-worker worktrees this module used
//! to create (one per task-claiming worker) into one isolated checkout per
//! epic, owned exclusively by that epic's engine for its lifetime.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::process::Command;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorktreeError {
    #[error("worktree for epic {0} already exists")]
    AlreadyExists(String),
    #[error("no worktree managed here for epic {0}")]
    NotManaged(String),
}

#[derive(Debug, Clone)]
pub struct Worktree {
    pub epic_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct WorktreeManager {
    trunk_dir: PathBuf,
    worktree_base: PathBuf,
    /// Epics this instance has created, so `remove` can tell "already
    /// removed" from "never managed" once the directory and branch are both
    /// gone. Cleared of an epic id once that epic is removed.
    managed: Mutex<HashSet<String>>,
}

impl WorktreeManager {
    pub fn new(trunk_dir: PathBuf, worktree_base: PathBuf) -> Self {
        Self {
            trunk_dir,
            worktree_base,
            managed: Mutex::new(HashSet::new()),
        }
    }

    fn branch_name(epic_id: &str) -> String {
        format!("ticker/{epic_id}")
    }

    fn path_for(&self, epic_id: &str) -> PathBuf {
        self.worktree_base.join(epic_id)
    }

    /// Creates `.worktrees/<epicId>/` on branch `ticker/<epicId>`, branching
    /// from current trunk HEAD if the branch doesn't already exist.
    pub async fn create(&self, epic_id: &str) -> Result<Worktree> {
        let path = self.path_for(epic_id);
        if path.exists() {
            return Err(WorktreeError::AlreadyExists(epic_id.to_string()).into());
        }

        self.ensure_worktrees_ignored().await?;

        tokio::fs::create_dir_all(&self.worktree_base)
            .await
            .context("failed to create worktree base directory")?;

        let branch = Self::branch_name(epic_id);
        let branch_exists = self.branch_exists(&branch).await?;

        let mut args = vec!["worktree", "add"];
        if !branch_exists {
            args.push("-b");
            args.push(&branch);
        } else {
            args.push(&branch);
        }
        let path_str = path.to_str().context("worktree path is not valid UTF-8")?;
        args.push(path_str);

        let output = Command::new("git")
            .args(&args)
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to run git worktree add")?;

        if !output.status.success() {
            anyhow::bail!(
                "failed to create worktree: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        tracing::info!(epic = %epic_id, path = %path.display(), "created worktree");
        self.managed.lock().unwrap().insert(epic_id.to_string());

        Ok(Worktree {
            epic_id: epic_id.to_string(),
            path,
            branch,
            created_at: chrono::Utc::now(),
        })
    }

    pub async fn get(&self, epic_id: &str) -> Option<Worktree> {
        let path = self.path_for(epic_id);
        if !path.exists() {
            return None;
        }
        Some(Worktree {
            epic_id: epic_id.to_string(),
            path,
            branch: Self::branch_name(epic_id),
            created_at: chrono::Utc::now(),
        })
    }

    /// All handles whose branch starts with `ticker/`.
    pub async fn list(&self) -> Result<Vec<Worktree>> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to list worktrees")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut worktrees = Vec::new();
        let mut current_path: Option<PathBuf> = None;

        for line in stdout.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                if let Some(branch) = branch_ref.strip_prefix("refs/heads/") {
                    if branch.starts_with("ticker/") {
                        if let Some(path) = current_path.take() {
                            let epic_id = branch.trim_start_matches("ticker/").to_string();
                            worktrees.push(Worktree {
                                epic_id,
                                path,
                                branch: branch.to_string(),
                                created_at: chrono::Utc::now(),
                            });
                        }
                    }
                }
            }
        }

        Ok(worktrees)
    }

    /// Force-removes the worktree directory and deletes its branch. Idempotent
    /// when already gone — including a repeat call after a prior `remove`
    /// already cleared the directory and branch — but fails loudly if this
    /// epic was never managed here at all.
    pub async fn remove(&self, epic_id: &str) -> Result<()> {
        let path = self.path_for(epic_id);
        let branch = Self::branch_name(epic_id);

        if !path.exists() && !self.branch_exists(&branch).await? {
            // Nothing left on disk. If this instance created it earlier,
            // that's a harmless repeat removal; otherwise it was never ours.
            if self.managed.lock().unwrap().remove(epic_id) {
                tracing::info!(epic = %epic_id, "worktree already removed, nothing to do");
                return Ok(());
            }
            return Err(WorktreeError::NotManaged(epic_id.to_string()).into());
        }

        if path.exists() {
            let output = Command::new("git")
                .args(["worktree", "remove", "--force"])
                .arg(&path)
                .current_dir(&self.trunk_dir)
                .output()
                .await
                .context("failed to remove git worktree")?;

            if !output.status.success() {
                tracing::warn!(
                    epic = %epic_id,
                    "failed to remove worktree: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        }

        if self.branch_exists(&branch).await? {
            let output = Command::new("git")
                .args(["branch", "-D", &branch])
                .current_dir(&self.trunk_dir)
                .output()
                .await
                .context("failed to delete branch")?;

            if !output.status.success() {
                tracing::warn!(
                    epic = %epic_id,
                    "failed to delete branch {}: {}",
                    branch,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        }

        self.managed.lock().unwrap().remove(epic_id);
        tracing::info!(epic = %epic_id, "removed worktree");
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", branch])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to check branch existence")?;
        Ok(output.status.success())
    }

    /// Ensures `.worktrees/` is ignored by the version-control system.
    async fn ensure_worktrees_ignored(&self) -> Result<()> {
        let gitignore = self.trunk_dir.join(".gitignore");
        let existing = tokio::fs::read_to_string(&gitignore).await.unwrap_or_default();
        if existing.lines().any(|l| l.trim() == ".worktrees/") {
            return Ok(());
        }

        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(".worktrees/\n");

        tokio::fs::write(&gitignore, contents)
            .await
            .context("failed to update .gitignore")?;
        Ok(())
    }

    /// True if the trunk's working tree has uncommitted changes.
    pub async fn trunk_is_dirty(&self) -> Result<bool> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to check trunk status")?;
        Ok(!output.stdout.is_empty())
    }

    /// True iff every dirty path in the trunk is under the engine's own
    /// metadata directories.
    pub async fn trunk_only_metadata_dirty(&self) -> Result<bool> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to check trunk status")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(false);
        }

        Ok(stdout.lines().all(|line| {
            if line.len() < 4 {
                return false;
            }
            let path = line[3..].trim();
            path.starts_with(".tick/") || path.starts_with(".ticker/")
        }))
    }

    /// Auto-commits engine-metadata-only changes on the trunk. Used as a
    /// precondition before launching a parallel run.
    pub async fn auto_commit_metadata(&self) -> Result<()> {
        let output = Command::new("git")
            .args(["add", ".tick", ".ticker"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to stage metadata")?;
        if !output.status.success() {
            tracing::warn!(
                "failed to stage engine metadata: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let output = Command::new("git")
            .args(["commit", "-m", "ticker: checkpoint engine metadata"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to commit metadata")?;

        if !output.status.success() {
            tracing::warn!(
                "failed to commit engine metadata: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_git(dir: &std::path::Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success());
    }

    fn init_repo(dir: &std::path::Path) {
        run_git(dir, &["init", "-q"]);
        run_git(dir, &["config", "user.email", "test@example.com"]);
        run_git(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-q", "-m", "init"]);
    }

    #[tokio::test]
    async fn create_then_get_then_remove() {
        let trunk = tempfile::tempdir().unwrap();
        init_repo(trunk.path());

        let manager = WorktreeManager::new(
            trunk.path().to_path_buf(),
            trunk.path().join(".worktrees"),
        );

        let wt = manager.create("epic-1").await.unwrap();
        assert_eq!(wt.branch, "ticker/epic-1");
        assert!(wt.path.exists());

        assert!(manager.get("epic-1").await.is_some());

        manager.remove("epic-1").await.unwrap();
        assert!(manager.get("epic-1").await.is_none());
    }

    #[tokio::test]
    async fn create_twice_fails_with_already_exists() {
        let trunk = tempfile::tempdir().unwrap();
        init_repo(trunk.path());

        let manager = WorktreeManager::new(
            trunk.path().to_path_buf(),
            trunk.path().join(".worktrees"),
        );

        manager.create("epic-1").await.unwrap();
        let err = manager.create("epic-1").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn remove_unmanaged_epic_fails_loudly() {
        let trunk = tempfile::tempdir().unwrap();
        init_repo(trunk.path());

        let manager = WorktreeManager::new(
            trunk.path().to_path_buf(),
            trunk.path().join(".worktrees"),
        );

        let err = manager.remove("never-created").await.unwrap_err();
        assert!(err.to_string().contains("no worktree managed"));
    }

    #[tokio::test]
    async fn remove_is_idempotent_when_already_gone() {
        let trunk = tempfile::tempdir().unwrap();
        init_repo(trunk.path());

        let manager = WorktreeManager::new(
            trunk.path().to_path_buf(),
            trunk.path().join(".worktrees"),
        );

        manager.create("epic-1").await.unwrap();
        manager.remove("epic-1").await.unwrap();
        // Directory and branch are both gone now, but this manager created
        // epic-1 itself, so a repeat remove is a no-op, not an error.
        manager.remove("epic-1").await.unwrap();
    }

    #[tokio::test]
    async fn create_adds_worktrees_to_gitignore() {
        let trunk = tempfile::tempdir().unwrap();
        init_repo(trunk.path());

        let manager = WorktreeManager::new(
            trunk.path().to_path_buf(),
            trunk.path().join(".worktrees"),
        );
        manager.create("epic-1").await.unwrap();

        let gitignore = std::fs::read_to_string(trunk.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".worktrees/"));
    }
}
