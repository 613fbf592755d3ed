//! Configuration file parsing and management

use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use anyhow::Result;

use crate::agent::AgentSupervisorConfig;
use crate::budget::BudgetLimits;
use crate::engine::EngineConfig;

/// Global configuration loaded from `.ticker.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Max iterations per epic.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Max cost in dollars shared across the whole run. 0 = disabled, per
    /// `BudgetTracker`'s "zero limits mean disabled" rule.
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,

    #[serde(default)]
    pub max_input_tokens: u64,

    #[serde(default)]
    pub max_output_tokens: u64,

    /// Save a checkpoint every N iterations.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// Per-agent-invocation timeout in seconds.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Max retries on the same task before declaring the epic stuck.
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,

    #[serde(default)]
    pub skip_verify: bool,

    #[serde(default = "default_use_worktree")]
    pub use_worktree: bool,

    #[serde(default)]
    pub watch: bool,

    /// Watch-mode poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub watch_timeout_secs: Option<u64>,

    /// Re-read a selected task after this delay, so human edits land before
    /// the engine commits to it.
    #[serde(default)]
    pub debounce_ms: Option<u64>,

    /// Number of epics run concurrently by the parallel runner.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: Option<PathBuf>,

    /// The coding-agent executable to spawn per iteration.
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,

    /// Database URL for the orchestration-run bookkeeping table.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_cost: default_max_cost(),
            max_input_tokens: 0,
            max_output_tokens: 0,
            checkpoint_interval: default_checkpoint_interval(),
            agent_timeout_secs: default_agent_timeout_secs(),
            max_task_retries: default_max_task_retries(),
            skip_verify: false,
            use_worktree: default_use_worktree(),
            watch: false,
            poll_interval_ms: default_poll_interval_ms(),
            watch_timeout_secs: None,
            debounce_ms: None,
            concurrency: default_concurrency(),
            worktree_dir: default_worktree_dir(),
            agent_binary: default_agent_binary(),
            database: default_database(),
        }
    }
}

/// Resolved runtime configuration for one invocation of the binary.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub engine_defaults: EngineConfig,
    pub budget_limits: BudgetLimits,
    pub agent: AgentSupervisorConfig,
    pub concurrency: usize,
    pub project_dir: PathBuf,
    pub worktree_dir: PathBuf,
    pub database: String,
}

impl From<Config> for RuntimeConfig {
    fn from(config: Config) -> Self {
        let engine_defaults = EngineConfig {
            epic_id: String::new(),
            max_iterations: config.max_iterations,
            max_cost: config.max_cost,
            checkpoint_interval: config.checkpoint_interval,
            agent_timeout: Duration::from_secs(config.agent_timeout_secs),
            max_task_retries: config.max_task_retries,
            skip_verify: config.skip_verify,
            use_worktree: config.use_worktree,
            working_dir: PathBuf::from("."),
            resume_from_checkpoint: None,
            watch: config.watch,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            watch_timeout: config.watch_timeout_secs.map(Duration::from_secs),
            debounce: config.debounce_ms.map(Duration::from_millis),
        };

        let budget_limits = BudgetLimits {
            // The shared tracker caps tokens/cost/elapsed; the iteration cap
            // is per-epic and lives on EngineConfig instead.
            max_iterations: 0,
            max_input_tokens: config.max_input_tokens,
            max_output_tokens: config.max_output_tokens,
            max_cost: config.max_cost,
            max_elapsed: None,
        };

        Self {
            engine_defaults,
            budget_limits,
            agent: AgentSupervisorConfig {
                binary: config.agent_binary,
                extra_args: default_agent_args(),
            },
            concurrency: config.concurrency,
            project_dir: PathBuf::from("."),
            worktree_dir: config.worktree_dir.unwrap_or_else(|| PathBuf::from(".worktrees")),
            database: config.database,
        }
    }
}

impl RuntimeConfig {
    pub fn with_project_dir(mut self, dir: PathBuf) -> Self {
        self.project_dir = dir;
        self
    }
}

/// Load configuration from `.ticker.toml` in the project directory.
pub fn load_config(project_dir: &PathBuf) -> Result<Config> {
    let config_path = project_dir.join(".ticker.toml");

    if !config_path.exists() {
        tracing::debug!("no .ticker.toml found, using defaults");
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(&config_path)?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse .ticker.toml: {}", e))?;

    tracing::debug!("loaded config from {}", config_path.display());
    Ok(config)
}

#[derive(Debug, Deserialize)]
struct OnDiskVerificationConfig {
    verification: Option<VerificationToggle>,
}

#[derive(Debug, Deserialize)]
struct VerificationToggle {
    enabled: bool,
}

/// Reads the per-working-dir `.ticker/config.json` kill switch described in
/// the on-disk interface: `{"verification": {"enabled": false}}` disables
/// verification for this working dir; an absent file, an absent
/// `verification` key, or a parse error all mean "stay enabled".
pub async fn verification_enabled(working_dir: &PathBuf) -> bool {
    let path = working_dir.join(".ticker").join("config.json");

    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(_) => return true,
    };

    match serde_json::from_str::<OnDiskVerificationConfig>(&contents) {
        Ok(cfg) => cfg.verification.map(|v| v.enabled).unwrap_or(true),
        Err(e) => {
            tracing::warn!("failed to parse {}: {}", path.display(), e);
            true
        }
    }
}

fn default_max_iterations() -> u32 {
    50
}
fn default_max_cost() -> f64 {
    0.0
}
fn default_checkpoint_interval() -> u32 {
    5
}
fn default_agent_timeout_secs() -> u64 {
    30 * 60
}
fn default_max_task_retries() -> u32 {
    3
}
fn default_use_worktree() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_concurrency() -> usize {
    4
}
fn default_worktree_dir() -> Option<PathBuf> {
    None
}
fn default_agent_binary() -> String {
    "claude".to_string()
}
fn default_database() -> String {
    "sqlite://.ticker.db".to_string()
}
fn default_agent_args() -> Vec<String> {
    vec![
        "code".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--non-interactive".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.max_cost, 0.0);
        assert_eq!(config.max_task_retries, 3);
        assert!(config.use_worktree);
    }

    #[test]
    fn test_runtime_config_from_config() {
        let config = Config::default();
        let runtime: RuntimeConfig = config.into();
        assert_eq!(runtime.engine_defaults.max_iterations, 50);
        assert_eq!(runtime.engine_defaults.agent_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn zero_max_cost_means_disabled_everywhere_it_flows() {
        let config = Config::default();
        let runtime: RuntimeConfig = config.into();
        assert_eq!(runtime.budget_limits.max_cost, 0.0);
        assert_eq!(runtime.engine_defaults.max_cost, 0.0);
    }

    #[tokio::test]
    async fn verification_enabled_defaults_true_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verification_enabled(&dir.path().to_path_buf()).await);
    }

    #[tokio::test]
    async fn verification_enabled_reads_disabled_flag() {
        let dir = tempfile::tempdir().unwrap();
        let ticker_dir = dir.path().join(".ticker");
        std::fs::create_dir_all(&ticker_dir).unwrap();
        std::fs::write(
            ticker_dir.join("config.json"),
            r#"{"verification": {"enabled": false}}"#,
        )
        .unwrap();

        assert!(!verification_enabled(&dir.path().to_path_buf()).await);
    }

    #[tokio::test]
    async fn verification_enabled_true_when_verification_key_absent() {
        let dir = tempfile::tempdir().unwrap();
        let ticker_dir = dir.path().join(".ticker");
        std::fs::create_dir_all(&ticker_dir).unwrap();
        std::fs::write(ticker_dir.join("config.json"), r#"{}"#).unwrap();

        assert!(verification_enabled(&dir.path().to_path_buf()).await);
    }
}
