//! Post-task verification. The engine composes multiple verifiers by AND.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub passed: bool,
    pub summary: String,
    pub duration: Duration,
    pub error: Option<String>,
}

#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;
    async fn verify(&self, task_id: &str, agent_output: &str) -> VerifyResult;
}

/// Excludes dirty paths under the engine's own metadata directories before
/// judging whether the working tree is clean.
const METADATA_PREFIXES: &[&str] = &[".tick/", ".ticker/"];

pub struct GitCleanVerifier {
    dir: PathBuf,
}

impl GitCleanVerifier {
    /// Synchronous constructor for callers (e.g. the CLI's per-epic verifier
    /// factory) that already know `dir` is a worktree and can't await here.
    pub fn new_unchecked(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns `None` (construction-time absence) if git tooling is missing
    /// or `dir` is not a repository — never a per-call failure.
    pub async fn new(dir: impl Into<PathBuf>) -> Option<Self> {
        let dir = dir.into();
        let output = Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(&dir)
            .output()
            .await
            .ok()?;

        if output.status.success() {
            Some(Self { dir })
        } else {
            None
        }
    }
}

#[async_trait]
impl Verifier for GitCleanVerifier {
    fn name(&self) -> &str {
        "git-clean"
    }

    async fn verify(&self, _task_id: &str, _agent_output: &str) -> VerifyResult {
        let start = Instant::now();

        let output = match Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.dir)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                return VerifyResult {
                    passed: false,
                    summary: "failed to run git status".to_string(),
                    duration: start.elapsed(),
                    error: Some(e.to_string()),
                }
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let dirty_paths: Vec<&str> = stdout
            .lines()
            .filter_map(parse_porcelain_path)
            .filter(|path| !is_under_metadata_prefix(path))
            .collect();

        let passed = dirty_paths.is_empty();
        let summary = if passed {
            "working tree clean".to_string()
        } else {
            format!("dirty paths: {}", dirty_paths.join(", "))
        };

        VerifyResult {
            passed,
            summary,
            duration: start.elapsed(),
            error: None,
        }
    }
}

/// Parses a `git status --porcelain` line of the form `XY path` into `path`.
fn parse_porcelain_path(line: &str) -> Option<&str> {
    if line.len() < 4 {
        return None;
    }
    Some(line[3..].trim())
}

fn is_under_metadata_prefix(path: &str) -> bool {
    METADATA_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Runs every verifier and ANDs the results.
pub async fn verify_all(verifiers: &[Box<dyn Verifier>], task_id: &str, agent_output: &str) -> VerifyResult {
    let start = Instant::now();
    let mut summaries = Vec::new();
    let mut passed = true;
    let mut error = None;

    for verifier in verifiers {
        let result = verifier.verify(task_id, agent_output).await;
        summaries.push(format!("{}: {}", verifier.name(), result.summary));
        if !result.passed {
            passed = false;
        }
        if result.error.is_some() {
            error = result.error;
        }
    }

    VerifyResult {
        passed,
        summary: summaries.join(" | "),
        duration: start.elapsed(),
        error,
    }
}

pub fn dir_is_git_repo(dir: &Path) -> bool {
    dir.join(".git").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success());
    }

    fn init_repo(dir: &Path) {
        run_git(dir, &["init", "-q"]);
        run_git(dir, &["config", "user.email", "test@example.com"]);
        run_git(dir, &["config", "user.name", "Test"]);
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_git(dir, &["add", "."]);
        run_git(dir, &["commit", "-q", "-m", "init"]);
    }

    #[tokio::test]
    async fn clean_tree_passes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let verifier = GitCleanVerifier::new(dir.path()).await.unwrap();
        let result = verifier.verify("t1", "").await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn dirty_tree_fails() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("new.txt"), "x").unwrap();

        let verifier = GitCleanVerifier::new(dir.path()).await.unwrap();
        let result = verifier.verify("t1", "").await;
        assert!(!result.passed);
        assert!(result.summary.contains("new.txt"));
    }

    #[tokio::test]
    async fn metadata_prefix_dirt_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::create_dir(dir.path().join(".ticker")).unwrap();
        std::fs::write(dir.path().join(".ticker/state.json"), "{}").unwrap();

        let verifier = GitCleanVerifier::new(dir.path()).await.unwrap();
        let result = verifier.verify("t1", "").await;
        assert!(result.passed, "expected clean, got: {}", result.summary);
    }

    #[tokio::test]
    async fn non_repository_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitCleanVerifier::new(dir.path()).await.is_none());
    }
}
