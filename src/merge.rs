//! Serializes merges of worktree branches back to the trunk.

use crate::worktree::Worktree;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged { commit: String },
    Conflict { files: Vec<String> },
}

pub struct MergeResult {
    pub outcome: MergeOutcome,
    pub error: Option<String>,
}

/// Wraps the trunk repository with an exclusive merge lock. At most one merge
/// proceeds at a time across the whole process.
pub struct MergeCoordinator {
    trunk_dir: PathBuf,
    lock: Mutex<()>,
}

impl MergeCoordinator {
    pub fn new(trunk_dir: PathBuf) -> Self {
        Self {
            trunk_dir,
            lock: Mutex::new(()),
        }
    }

    pub async fn main_branch(&self) -> Result<String> {
        let output = Command::new("git")
            .args(["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .current_dir(&self.trunk_dir)
            .output()
            .await;

        if let Ok(output) = output {
            if output.status.success() {
                let name = String::from_utf8_lossy(&output.stdout);
                if let Some(branch) = name.trim().strip_prefix("origin/") {
                    return Ok(branch.to_string());
                }
            }
        }

        // Fall back to the current branch.
        let output = Command::new("git")
            .args(["branch", "--show-current"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to detect current branch")?;

        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if name.is_empty() {
            anyhow::bail!("could not detect trunk branch name");
        }
        Ok(name)
    }

    /// Checks out the trunk, attempts to fast-forward or merge-commit the
    /// worktree branch in. Conflicts abort the in-progress merge and are
    /// reported without corrupting the trunk or blocking the next attempt.
    pub async fn merge(&self, worktree: &Worktree) -> Result<MergeResult> {
        let _guard = self.lock.lock().await;

        let trunk = self.main_branch().await?;

        let checkout = Command::new("git")
            .args(["checkout", &trunk])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to checkout trunk")?;
        if !checkout.status.success() {
            return Ok(MergeResult {
                outcome: MergeOutcome::Conflict { files: vec![] },
                error: Some(String::from_utf8_lossy(&checkout.stderr).to_string()),
            });
        }

        let merge = Command::new("git")
            .args(["merge", "--no-edit", &worktree.branch])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to run git merge")?;

        if merge.status.success() {
            let commit = self.current_commit().await?;
            tracing::info!(epic = %worktree.epic_id, commit = %commit, "merged worktree branch");
            return Ok(MergeResult {
                outcome: MergeOutcome::Merged { commit },
                error: None,
            });
        }

        let conflicted_files = self.conflicted_files().await.unwrap_or_default();
        self.abort_merge().await?;

        tracing::warn!(
            epic = %worktree.epic_id,
            files = ?conflicted_files,
            "merge conflict, worktree preserved"
        );

        Ok(MergeResult {
            outcome: MergeOutcome::Conflict {
                files: conflicted_files,
            },
            error: Some(String::from_utf8_lossy(&merge.stderr).to_string()),
        })
    }

    /// Callable externally for cleanup after a conflicting merge attempt.
    pub async fn abort_merge(&self) -> Result<()> {
        let output = Command::new("git")
            .args(["merge", "--abort"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to abort merge")?;

        if !output.status.success() {
            tracing::warn!(
                "git merge --abort reported an error (may be a no-op): {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    async fn conflicted_files(&self) -> Result<Vec<String>> {
        let output = Command::new("git")
            .args(["diff", "--name-only", "--diff-filter=U"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to list conflicted files")?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    async fn current_commit(&self) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.trunk_dir)
            .output()
            .await
            .context("failed to read HEAD commit")?;

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn run_git(dir: &Path, args: &[&str]) -> std::process::Output {
        std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
    }

    fn init_repo(dir: &Path) {
        run_git(dir, &["init", "-q", "-b", "main"]);
        run_git(dir, &["config", "user.email", "test@example.com"]);
        run_git(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-q", "-m", "init"]);
    }

    fn make_worktree_branch(trunk: &Path, branch: &str, file: &str, content: &str) {
        run_git(trunk, &["branch", branch]);
        run_git(trunk, &["checkout", branch]);
        std::fs::write(trunk.join(file), content).unwrap();
        run_git(trunk, &["add", "."]);
        run_git(trunk, &["commit", "-q", "-m", format!("update {file}")]);
        run_git(trunk, &["checkout", "main"]);
    }

    #[tokio::test]
    async fn clean_merge_succeeds() {
        let trunk = tempfile::tempdir().unwrap();
        init_repo(trunk.path());
        make_worktree_branch(trunk.path(), "ticker/e1", "feature.txt", "feature 1");

        let coordinator = MergeCoordinator::new(trunk.path().to_path_buf());
        let worktree = Worktree {
            epic_id: "e1".to_string(),
            path: trunk.path().to_path_buf(),
            branch: "ticker/e1".to_string(),
            created_at: chrono::Utc::now(),
        };

        let result = coordinator.merge(&worktree).await.unwrap();
        assert!(matches!(result.outcome, MergeOutcome::Merged { .. }));
        assert!(trunk.path().join("feature.txt").exists());
    }

    #[tokio::test]
    async fn conflicting_merge_reports_files_and_preserves_trunk() {
        let trunk = tempfile::tempdir().unwrap();
        init_repo(trunk.path());

        // Both branches touch README.md differently.
        make_worktree_branch(trunk.path(), "ticker/e1", "README.md", "branch change");
        std::fs::write(trunk.path().join("README.md"), "trunk change").unwrap();
        run_git(trunk.path(), &["add", "."]);
        run_git(trunk.path(), &["commit", "-q", "-m", "trunk update"]);

        let coordinator = MergeCoordinator::new(trunk.path().to_path_buf());
        let worktree = Worktree {
            epic_id: "e1".to_string(),
            path: trunk.path().to_path_buf(),
            branch: "ticker/e1".to_string(),
            created_at: chrono::Utc::now(),
        };

        let result = coordinator.merge(&worktree).await.unwrap();
        match result.outcome {
            MergeOutcome::Conflict { files } => assert!(files.contains(&"README.md".to_string())),
            MergeOutcome::Merged { .. } => panic!("expected conflict"),
        }

        // Trunk working tree must be left clean after the aborted merge.
        let status = run_git(trunk.path(), &["status", "--porcelain"]);
        assert!(String::from_utf8_lossy(&status.stdout).trim().is_empty());
    }
}
