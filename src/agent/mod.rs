//! Spawns and supervises the external coding-agent subprocess, parsing its
//! structured event stream into a live, lockable state with immutable
//! snapshots for consumers.

use crate::types::{AgentRunRecord, ToolCallRecord};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Starting,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ActiveTool {
    pub name: String,
    pub id: String,
    pub started_at: Instant,
}

/// Immutable point-in-time copy of the subprocess's parsed state.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub output_text: String,
    pub thinking_text: String,
    pub active_tool: Option<ActiveTool>,
    pub closed_tools: Vec<ToolCallRecord>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub cost: f64,
    pub model: String,
    pub status: AgentStatus,
    pub error: Option<String>,
}

impl AgentSnapshot {
    fn starting() -> Self {
        Self {
            output_text: String::new(),
            thinking_text: String::new(),
            active_tool: None,
            closed_tools: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            cache_tokens: 0,
            cost: 0.0,
            model: String::new(),
            status: AgentStatus::Starting,
            error: None,
        }
    }
}

/// Result of one completed (non-error) agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub snapshot: AgentSnapshot,
    pub record: AgentRunRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent binary '{binary}' not found or failed to launch: {source}")]
    LaunchFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent timed out after {timeout:?}")]
    Timeout {
        partial: Box<AgentOutcome>,
        timeout: Duration,
    },
    #[error("agent exited with status {status}: {stderr}")]
    NonZeroExit {
        partial: Box<AgentOutcome>,
        status: String,
        stderr: String,
    },
}

/// One line of the agent's stdout event stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentEvent {
    TextDelta { text: String },
    ThinkingDelta { text: String },
    ToolStart { name: String, id: String },
    ToolEnd { id: String, #[serde(default)] error: bool },
    Metrics {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default)]
        cache_tokens: u64,
        #[serde(default)]
        cost: f64,
        #[serde(default)]
        model: Option<String>,
    },
}

struct Shared {
    snapshot: AgentSnapshot,
    tool_starts: HashMap<String, Instant>,
}

fn apply_event(shared: &mut Shared, event: AgentEvent) {
    match event {
        AgentEvent::TextDelta { text } => shared.snapshot.output_text.push_str(&text),
        AgentEvent::ThinkingDelta { text } => shared.snapshot.thinking_text.push_str(&text),
        AgentEvent::ToolStart { name, id } => {
            shared.tool_starts.insert(id.clone(), Instant::now());
            shared.snapshot.active_tool = Some(ActiveTool {
                name,
                id,
                started_at: Instant::now(),
            });
        }
        AgentEvent::ToolEnd { id, error } => {
            let duration = shared
                .tool_starts
                .remove(&id)
                .map(|start| start.elapsed())
                .unwrap_or_default();
            let name = shared
                .snapshot
                .active_tool
                .as_ref()
                .filter(|t| t.id == id)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| id.clone());
            shared.snapshot.closed_tools.push(ToolCallRecord {
                name,
                id: id.clone(),
                duration,
                error,
            });
            if shared.snapshot.active_tool.as_ref().is_some_and(|t| t.id == id) {
                shared.snapshot.active_tool = None;
            }
        }
        AgentEvent::Metrics {
            input_tokens,
            output_tokens,
            cache_tokens,
            cost,
            model,
        } => {
            shared.snapshot.input_tokens = input_tokens;
            shared.snapshot.output_tokens = output_tokens;
            shared.snapshot.cache_tokens = cache_tokens;
            shared.snapshot.cost = cost;
            if let Some(model) = model {
                shared.snapshot.model = model;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentSupervisorConfig {
    pub binary: String,
    pub extra_args: Vec<String>,
}

impl Default for AgentSupervisorConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: vec![
                "code".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--non-interactive".to_string(),
            ],
        }
    }
}

/// Spawns one agent subprocess per invocation and drives it to completion or
/// timeout. Not reused across iterations — every call is a fresh subprocess.
pub struct AgentSupervisor {
    config: AgentSupervisorConfig,
}

impl AgentSupervisor {
    pub fn new(config: AgentSupervisorConfig) -> Self {
        Self { config }
    }

    /// Runs the agent on `prompt` inside `working_dir`, force-terminating the
    /// subprocess if it runs past `timeout`. `on_update`, if given, is invoked
    /// with an immutable snapshot copy after each parsed event.
    pub async fn run(
        &self,
        prompt: &str,
        working_dir: &Path,
        timeout: Duration,
        on_update: Option<Arc<dyn Fn(AgentSnapshot) + Send + Sync>>,
    ) -> Result<AgentOutcome, AgentError> {
        let session_id = Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();

        let mut child = Command::new(&self.config.binary)
            .args(&self.config.extra_args)
            .arg(prompt)
            .current_dir(working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|source| AgentError::LaunchFailed {
                binary: self.config.binary.clone(),
                source,
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let shared = Arc::new(Mutex::new(Shared {
            snapshot: AgentSnapshot::starting(),
            tool_starts: HashMap::new(),
        }));

        {
            let mut guard = shared.lock().await;
            guard.snapshot.status = AgentStatus::Running;
        }

        let stdout_shared = Arc::clone(&shared);
        let stdout_callback = on_update.clone();
        let stdout_task = tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let event = match serde_json::from_str::<AgentEvent>(&line) {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                let snapshot = {
                    let mut guard = stdout_shared.lock().await;
                    apply_event(&mut guard, event);
                    guard.snapshot.clone()
                };
                if let Some(cb) = &stdout_callback {
                    cb(snapshot);
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(timeout) => None,
        };

        match exit {
            None => {
                let _ = child.kill().await;
                stdout_task.abort();
                let stderr_text = stderr_task.await.unwrap_or_default();
                let mut guard = shared.lock().await;
                guard.snapshot.status = AgentStatus::Failed;
                guard.snapshot.error = Some(format!("timed out after {timeout:?}"));
                let snapshot = guard.snapshot.clone();
                drop(guard);

                let record = build_record(
                    &session_id,
                    started_at,
                    &snapshot,
                    false,
                    &stderr_text,
                );
                return Err(AgentError::Timeout {
                    partial: Box::new(AgentOutcome { snapshot, record }),
                    timeout,
                });
            }
            Some(Ok(status)) => {
                let _ = stdout_task.await;
                let stderr_text = stderr_task.await.unwrap_or_default();

                let mut guard = shared.lock().await;
                guard.snapshot.status = if status.success() {
                    AgentStatus::Succeeded
                } else {
                    AgentStatus::Failed
                };
                if !status.success() {
                    guard.snapshot.error = Some(format!("exit status: {status}"));
                }
                let snapshot = guard.snapshot.clone();
                drop(guard);

                let record = build_record(
                    &session_id,
                    started_at,
                    &snapshot,
                    status.success(),
                    &stderr_text,
                );

                if status.success() {
                    Ok(AgentOutcome { snapshot, record })
                } else {
                    Err(AgentError::NonZeroExit {
                        partial: Box::new(AgentOutcome { snapshot, record }),
                        status: status.to_string(),
                        stderr: stderr_text,
                    })
                }
            }
            Some(Err(e)) => {
                stdout_task.abort();
                let stderr_text = stderr_task.await.unwrap_or_default();
                let mut guard = shared.lock().await;
                guard.snapshot.status = AgentStatus::Failed;
                guard.snapshot.error = Some(e.to_string());
                let snapshot = guard.snapshot.clone();
                drop(guard);

                let record = build_record(&session_id, started_at, &snapshot, false, &stderr_text);
                Err(AgentError::NonZeroExit {
                    partial: Box::new(AgentOutcome { snapshot, record }),
                    status: "unknown".to_string(),
                    stderr: stderr_text,
                })
            }
        }
    }
}

fn build_record(
    session_id: &str,
    started_at: chrono::DateTime<chrono::Utc>,
    snapshot: &AgentSnapshot,
    success: bool,
    stderr_text: &str,
) -> AgentRunRecord {
    let _ = stderr_text; // captured for diagnostics by the caller, not stored in the record
    AgentRunRecord {
        session_id: session_id.to_string(),
        model: snapshot.model.clone(),
        started_at,
        ended_at: Some(chrono::Utc::now()),
        output_text: snapshot.output_text.clone(),
        thinking_text: snapshot.thinking_text.clone(),
        tool_calls: snapshot.closed_tools.clone(),
        input_tokens: snapshot.input_tokens,
        output_tokens: snapshot.output_tokens,
        cache_tokens: snapshot.cache_tokens,
        cost: snapshot.cost,
        success,
        turn_count: snapshot.closed_tools.len() as u32 + 1,
    }
}

/// Truncates to the last `max_chars` characters and normalizes whitespace,
/// as required by the engine's timeout/error diagnostic notes.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let char_count = normalized.chars().count();
    if char_count <= max_chars {
        normalized
    } else {
        normalized
            .chars()
            .skip(char_count - max_chars)
            .collect::<String>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_failure_identifies_missing_binary() {
        let supervisor = AgentSupervisor::new(AgentSupervisorConfig {
            binary: "this-binary-does-not-exist-anywhere".to_string(),
            extra_args: vec![],
        });
        let dir = tempfile::tempdir().unwrap();
        let err = supervisor
            .run("prompt", dir.path(), Duration::from_secs(5), None)
            .await
            .unwrap_err();
        match err {
            AgentError::LaunchFailed { binary, .. } => {
                assert_eq!(binary, "this-binary-does-not-exist-anywhere");
            }
            other => panic!("expected LaunchFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_run_parses_stream_and_builds_record() {
        // Use `cat` to echo a canned event stream back on stdout.
        let dir = tempfile::tempdir().unwrap();
        let stream_file = dir.path().join("events.jsonl");
        std::fs::write(
            &stream_file,
            concat!(
                r#"{"type":"text_delta","text":"hello "}"#, "\n",
                r#"{"type":"tool_start","name":"edit","id":"t1"}"#, "\n",
                r#"{"type":"tool_end","id":"t1","error":false}"#, "\n",
                r#"{"type":"metrics","input_tokens":10,"output_tokens":20,"cache_tokens":0,"cost":0.05,"model":"test-model"}"#, "\n",
                r#"{"type":"text_delta","text":"world"}"#, "\n",
            ),
        )
        .unwrap();

        let supervisor = AgentSupervisor::new(AgentSupervisorConfig {
            binary: "cat".to_string(),
            extra_args: vec![stream_file.to_str().unwrap().to_string()],
        });

        let outcome = supervisor
            .run("unused", dir.path(), Duration::from_secs(5), None)
            .await
            .unwrap();

        assert_eq!(outcome.snapshot.output_text, "hello world");
        assert_eq!(outcome.snapshot.closed_tools.len(), 1);
        assert_eq!(outcome.snapshot.input_tokens, 10);
        assert_eq!(outcome.record.model, "test-model");
        assert!(outcome.record.success);
    }

    #[tokio::test]
    async fn timeout_returns_partial_snapshot_with_distinguished_error() {
        let supervisor = AgentSupervisor::new(AgentSupervisorConfig {
            binary: "sleep".to_string(),
            extra_args: vec!["5".to_string()],
        });
        let dir = tempfile::tempdir().unwrap();

        let err = supervisor
            .run("unused", dir.path(), Duration::from_millis(100), None)
            .await
            .unwrap_err();

        match err {
            AgentError::Timeout { partial, .. } => {
                assert_eq!(partial.snapshot.status, AgentStatus::Failed);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn truncate_tail_keeps_only_last_n_chars_and_normalizes_whitespace() {
        let text = "a  b\nc   d\n\ne f g h i j";
        let truncated = truncate_tail(text, 5);
        assert_eq!(truncated.chars().count(), 5);
        assert!(!truncated.contains('\n'));
    }
}
