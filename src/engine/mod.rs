//! The per-epic iteration loop: choose task, build prompt, run the agent,
//! verify, react to signals, checkpoint, handle watch/idle.
//!
//! Generalized from the teacher's `Drover::run` event loop in
//! `drover/mod.rs` — same `tokio::select!`-on-events-or-timer shape, same
//! `Instant`-based stall bookkeeping as `spawn_stall_detector`, same
//! best-effort "update the tracker, log on failure, keep going" error
//! policy seen in `close_task`/`create_beads_task`. Where the teacher drives
//! all ready tasks across the whole project with a `WorkerPool`, this drives
//! one epic, one task at a time, leaving the pool-of-many-epics concern to
//! `ParallelRunner`.

use crate::agent::{truncate_tail, AgentError, AgentSnapshot, AgentSupervisor};
use crate::budget::BudgetTracker;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::prompt::build_prompt;
use crate::signal::{parse_signal, Signal, SignalKind};
use crate::store::TaskStore;
use crate::types::{AgentRunRecord, AwaitingTag, Task, TaskStatus};
use crate::verify::{verify_all, VerifyResult, Verifier};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    AllTasksCompleted,
    NoTasksFound,
    /// Open/in-progress tasks remain but none are ready (awaiting a human).
    NoReadyTasks,
    StuckOnTask { task_id: String, iterations: u32 },
    IterationCapReached,
    BudgetExceeded(String),
    WatchTimeout,
    Cancelled,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::AllTasksCompleted => write!(f, "all tasks completed"),
            ExitReason::NoTasksFound => write!(f, "no tasks found"),
            ExitReason::NoReadyTasks => write!(f, "no ready tasks (awaiting human)"),
            ExitReason::StuckOnTask { task_id, iterations } => {
                write!(f, "stuck on task {task_id} after {iterations} iterations")
            }
            ExitReason::IterationCapReached => write!(f, "iteration cap reached"),
            ExitReason::BudgetExceeded(reason) => write!(f, "{reason}"),
            ExitReason::WatchTimeout => write!(f, "watch timeout"),
            ExitReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineResult {
    pub epic_id: String,
    pub exit_reason: ExitReason,
    pub completed_task_ids: Vec<String>,
    pub iterations_run: u32,
    /// The most recent human-gated tag set via a signal, if any. Lets the
    /// embedder distinguish an eject from a plain blocked handoff when
    /// mapping `NoReadyTasks`/`WatchTimeout` to a process exit code.
    pub last_awaiting: Option<AwaitingTag>,
}

/// One-way observer hooks. Implementors must never call back into the engine
/// synchronously — a separate cancel/pause channel carries control signals
/// the other direction.
pub trait EngineObserver: Send + Sync {
    fn on_iteration_start(&self, _epic_id: &str, _iteration: u32) {}
    fn on_iteration_end(&self, _epic_id: &str, _iteration: u32) {}
    fn on_agent_snapshot(&self, _epic_id: &str, _snapshot: &AgentSnapshot) {}
    fn on_signal(&self, _epic_id: &str, _signal: &Signal) {}
    fn on_verification_start(&self, _epic_id: &str, _task_id: &str) {}
    fn on_verification_end(&self, _epic_id: &str, _result: &VerifyResult) {}
    fn on_idle(&self, _epic_id: &str) {}
}

pub struct NullObserver;
impl EngineObserver for NullObserver {}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub epic_id: String,
    pub max_iterations: u32,
    pub max_cost: f64,
    pub checkpoint_interval: u32,
    pub agent_timeout: Duration,
    pub max_task_retries: u32,
    pub skip_verify: bool,
    pub use_worktree: bool,
    pub working_dir: PathBuf,
    pub resume_from_checkpoint: Option<String>,
    pub watch: bool,
    pub poll_interval: Duration,
    pub watch_timeout: Option<Duration>,
    pub debounce: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epic_id: String::new(),
            max_iterations: 50,
            max_cost: 0.0,
            checkpoint_interval: 5,
            agent_timeout: Duration::from_secs(30 * 60),
            max_task_retries: 3,
            skip_verify: false,
            use_worktree: false,
            working_dir: PathBuf::from("."),
            resume_from_checkpoint: None,
            watch: false,
            poll_interval: Duration::from_secs(5),
            watch_timeout: None,
            debounce: None,
        }
    }
}

struct SingleIterationOutcome {
    task_id: String,
    is_timeout: bool,
    error: Option<String>,
    signal: Option<Signal>,
    snapshot: Option<AgentSnapshot>,
    record: Option<AgentRunRecord>,
}

pub struct IterationEngine {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    budget: BudgetTracker,
    checkpoints: CheckpointStore,
    verifiers: Vec<Box<dyn Verifier>>,
    supervisor: AgentSupervisor,
    observer: Arc<dyn EngineObserver>,
    cancel: watch::Receiver<bool>,
    pause: watch::Receiver<bool>,
}

impl IterationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        budget: BudgetTracker,
        checkpoints: CheckpointStore,
        verifiers: Vec<Box<dyn Verifier>>,
        supervisor: AgentSupervisor,
        observer: Arc<dyn EngineObserver>,
        cancel: watch::Receiver<bool>,
        pause: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            budget,
            checkpoints,
            verifiers,
            supervisor,
            observer,
            cancel,
            pause,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn write_epic_note(&self, text: &str) {
        if let Err(e) = self.store.add_note(&self.config.epic_id, text).await {
            tracing::warn!(epic = %self.config.epic_id, error = %e, "failed to write epic note");
        }
    }

    async fn write_interruption_notes(&self, current_task: Option<&str>) {
        self.write_epic_note("interrupted: cancellation signal received")
            .await;
        if let Some(task_id) = current_task {
            if let Err(e) = self.store.add_note(task_id, "interrupted").await {
                tracing::warn!(task = %task_id, error = %e, "failed to write interruption note");
            }
        }
    }

    /// Blocks while the pause signal is flipped on, remaining responsive to
    /// cancellation.
    async fn wait_while_paused(&mut self) {
        while *self.pause.borrow() {
            if self.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = self.pause.changed() => {}
                _ = self.cancel.changed() => {}
            }
        }
    }

    /// Fail fast on an unknown epic id or an entity whose kind isn't "epic",
    /// rather than driving the whole loop against a task id or a bug.
    async fn check_epic_kind(&self) -> Result<()> {
        let epic = self
            .store
            .get_epic(&self.config.epic_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("epic {} not found", self.config.epic_id))?;

        if !epic.is_epic() {
            anyhow::bail!(
                "{} has kind \"{}\", not \"epic\" — refusing to start",
                epic.id,
                epic.kind
            );
        }

        Ok(())
    }

    pub async fn run(&mut self) -> Result<EngineResult> {
        self.check_epic_kind().await?;

        // The on-disk `.ticker/config.json` kill switch is read once per run
        // rather than per iteration — it gates a whole epic's verification,
        // not individual iterations.
        let verify_enabled_on_disk =
            crate::config::verification_enabled(&self.config.working_dir).await;

        let mut iteration: u32 = 0;
        let mut completed: Vec<String> = Vec::new();
        let mut previous_task_id: Option<String> = None;
        let mut stuck_count: u32 = 0;
        let mut last_awaiting: Option<AwaitingTag> = None;

        if let Some(checkpoint_id) = self.config.resume_from_checkpoint.clone() {
            if let Ok(Some(cp)) = self.checkpoints.load(&checkpoint_id).await {
                iteration = cp.iteration;
                completed = cp.closed_task_ids;
                tracing::info!(epic = %self.config.epic_id, iteration, "resumed from checkpoint");
            }
        }

        loop {
            // 1. cancel/budget check.
            if self.is_cancelled() {
                self.write_interruption_notes(previous_task_id.as_deref()).await;
                return Ok(self.finish(ExitReason::Cancelled, completed, iteration, last_awaiting));
            }
            if self.config.max_iterations > 0 && iteration >= self.config.max_iterations {
                return Ok(self.finish(ExitReason::IterationCapReached, completed, iteration, last_awaiting));
            }
            let (should_stop, reason) = self.budget.should_stop();
            if should_stop {
                let reason = reason.unwrap_or_else(|| "budget exhausted".to_string());
                return Ok(self.finish(ExitReason::BudgetExceeded(reason), completed, iteration, last_awaiting));
            }

            // 2. pause gate.
            self.wait_while_paused().await;
            if self.is_cancelled() {
                self.write_interruption_notes(previous_task_id.as_deref()).await;
                return Ok(self.finish(ExitReason::Cancelled, completed, iteration, last_awaiting));
            }

            // 3. task selection.
            let mut task = self.store.next_task(&self.config.epic_id).await?;
            if let Some(debounce) = self.config.debounce {
                if let Some(t) = &task {
                    let id = t.id.clone();
                    tokio::time::sleep(debounce).await;
                    task = self.store.get_task(&id).await?;
                }
            }

            // 4. no ready task.
            let Some(task) = task else {
                let has_open = self.store.has_open_tasks(&self.config.epic_id).await?;
                if !has_open {
                    let reason = if iteration == 0 {
                        ExitReason::NoTasksFound
                    } else {
                        ExitReason::AllTasksCompleted
                    };
                    let _ = self
                        .store
                        .close_epic(&self.config.epic_id, &reason.to_string())
                        .await;
                    return Ok(self.finish(reason, completed, iteration, last_awaiting));
                }

                if self.config.watch {
                    match self.idle_loop(iteration).await? {
                        Some(reason) => return Ok(self.finish(reason, completed, iteration, last_awaiting)),
                        None => continue,
                    }
                } else {
                    return Ok(self.finish(ExitReason::NoReadyTasks, completed, iteration, last_awaiting));
                }
            };

            // 5. stuck detection.
            if previous_task_id.as_deref() == Some(task.id.as_str()) {
                stuck_count += 1;
                if stuck_count > self.config.max_task_retries {
                    return Ok(self.finish(
                        ExitReason::StuckOnTask {
                            task_id: task.id.clone(),
                            iterations: stuck_count,
                        },
                        completed,
                        iteration,
                        last_awaiting,
                    ));
                }
            } else {
                stuck_count = 0;
            }
            previous_task_id = Some(task.id.clone());

            iteration += 1;
            self.observer.on_iteration_start(&self.config.epic_id, iteration);

            // 6. run one iteration.
            let outcome = self.run_single_iteration(iteration, &task).await;

            // 7. budget update.
            if let Some(record) = &outcome.record {
                self.budget
                    .add(record.input_tokens, record.output_tokens, record.cost);
            } else {
                self.budget.add_iteration();
            }

            // 8. timeout handling.
            if outcome.is_timeout {
                let tail = outcome
                    .snapshot
                    .as_ref()
                    .map(|s| truncate_tail(&s.output_text, 500))
                    .unwrap_or_default();
                self.write_epic_note(&format!(
                    "Iteration {} timed out after {:?} on task {}: {}",
                    iteration, self.config.agent_timeout, outcome.task_id, tail
                ))
                .await;
                self.observer.on_iteration_end(&self.config.epic_id, iteration);
                continue;
            }

            // 9. error handling.
            if let Some(error) = &outcome.error {
                self.write_epic_note(&format!(
                    "Iteration {} on task {} failed: {}",
                    iteration, outcome.task_id, error
                ))
                .await;
                self.observer.on_iteration_end(&self.config.epic_id, iteration);
                continue;
            }

            // 10. verification.
            if !self.config.skip_verify && verify_enabled_on_disk && !self.verifiers.is_empty() {
                if let Ok(Some(refreshed)) = self.store.get_task(&outcome.task_id).await {
                    if refreshed.status == TaskStatus::Closed {
                        self.observer
                            .on_verification_start(&self.config.epic_id, &outcome.task_id);
                        let output_text = outcome
                            .snapshot
                            .as_ref()
                            .map(|s| s.output_text.clone())
                            .unwrap_or_default();
                        let result =
                            verify_all(&self.verifiers, &outcome.task_id, &output_text).await;
                        self.observer
                            .on_verification_end(&self.config.epic_id, &result);

                        if !result.passed {
                            let _ = self.store.reopen_task(&outcome.task_id).await;
                            let truncated = result.summary.replace('\n', " | ");
                            let truncated = truncate_tail(&truncated, 300);
                            self.write_epic_note(&format!(
                                "Verification failed for {}: {}",
                                outcome.task_id, truncated
                            ))
                            .await;
                        } else {
                            completed.push(outcome.task_id.clone());
                        }
                    }
                }
            } else if let Ok(Some(refreshed)) = self.store.get_task(&outcome.task_id).await {
                if refreshed.status == TaskStatus::Closed {
                    completed.push(outcome.task_id.clone());
                }
            }

            // 11. signal handling.
            if let Some(signal) = &outcome.signal {
                self.observer.on_signal(&self.config.epic_id, signal);
                match signal.kind {
                    SignalKind::Complete => {
                        tracing::warn!(
                            epic = %self.config.epic_id,
                            task = %outcome.task_id,
                            "COMPLETE signal ignored — engine decides completion from task state"
                        );
                    }
                    other => {
                        if let Some(tag) = other.awaiting_tag() {
                            let _ = self
                                .store
                                .set_awaiting(&outcome.task_id, tag, &signal.reason)
                                .await;
                            last_awaiting = Some(tag);
                        }
                    }
                }
            }

            // 12. checkpoint.
            if self.config.checkpoint_interval > 0
                && iteration % self.config.checkpoint_interval == 0
            {
                let usage = self.budget.usage();
                let checkpoint = Checkpoint {
                    epic_id: self.config.epic_id.clone(),
                    iteration,
                    cumulative_tokens: usage.input_tokens + usage.output_tokens,
                    cumulative_cost: usage.cost,
                    closed_task_ids: completed.clone(),
                    commit_id: None,
                    timestamp: chrono::Utc::now(),
                };
                if let Err(e) = self.checkpoints.save(&checkpoint).await {
                    tracing::warn!(epic = %self.config.epic_id, error = %e, "failed to save checkpoint");
                }
            }

            self.observer.on_iteration_end(&self.config.epic_id, iteration);
        }
    }

    fn finish(
        &self,
        reason: ExitReason,
        completed: Vec<String>,
        iterations_run: u32,
        last_awaiting: Option<AwaitingTag>,
    ) -> EngineResult {
        EngineResult {
            epic_id: self.config.epic_id.clone(),
            exit_reason: reason,
            completed_task_ids: completed,
            iterations_run,
            last_awaiting,
        }
    }

    /// §4.9a: poll for a ready task until the watch deadline or cancellation.
    /// Returns `Some(reason)` to exit the engine, `None` to resume the main
    /// loop with a newly-found ready task.
    async fn idle_loop(&mut self, iteration: u32) -> Result<Option<ExitReason>> {
        self.observer.on_idle(&self.config.epic_id);
        let deadline = self.config.watch_timeout.map(|d| tokio::time::Instant::now() + d);

        loop {
            if self.is_cancelled() {
                self.write_interruption_notes(None).await;
                return Ok(Some(ExitReason::Cancelled));
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Ok(Some(ExitReason::WatchTimeout));
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;

            match self.store.next_task(&self.config.epic_id).await {
                Ok(Some(_)) => return Ok(None),
                Ok(None) => {
                    let has_open = self.store.has_open_tasks(&self.config.epic_id).await?;
                    if !has_open {
                        let reason = if iteration == 0 {
                            ExitReason::NoTasksFound
                        } else {
                            ExitReason::AllTasksCompleted
                        };
                        let _ = self
                            .store
                            .close_epic(&self.config.epic_id, &reason.to_string())
                            .await;
                        return Ok(Some(reason));
                    }
                }
                // Transient store failures must not end watch mode.
                Err(e) => {
                    tracing::debug!(epic = %self.config.epic_id, error = %e, "idle poll error, continuing");
                }
            }
        }
    }

    /// §4.9b: mark the task in-progress, build the prompt, invoke the agent.
    async fn run_single_iteration(&self, iteration: u32, task: &Task) -> SingleIterationOutcome {
        if let Err(e) = self.store.set_status(&task.id, TaskStatus::InProgress).await {
            tracing::warn!(task = %task.id, error = %e, "failed to mark task in_progress (non-fatal)");
        }

        let epic = match self.store.get_epic(&self.config.epic_id).await {
            Ok(Some(epic)) => epic,
            _ => {
                return SingleIterationOutcome {
                    task_id: task.id.clone(),
                    is_timeout: false,
                    error: Some("epic disappeared mid-run".to_string()),
                    signal: None,
                    snapshot: None,
                    record: None,
                }
            }
        };

        let epic_notes = self.store.get_notes(&self.config.epic_id).await.unwrap_or_default();
        let human_notes = self.store.get_human_notes(&task.id).await.unwrap_or_default();

        let prompt = build_prompt(iteration, &epic, task, &epic_notes, &human_notes);

        let outcome = self
            .supervisor
            .run(&prompt, &self.config.working_dir, self.config.agent_timeout, None)
            .await;

        match outcome {
            Ok(agent_outcome) => {
                if let Err(e) = self.store.set_run_record(&task.id, &agent_outcome.record).await {
                    tracing::warn!(task = %task.id, error = %e, "failed to persist run record");
                }
                let signal = parse_signal(&agent_outcome.snapshot.output_text);
                SingleIterationOutcome {
                    task_id: task.id.clone(),
                    is_timeout: false,
                    error: None,
                    signal,
                    snapshot: Some(agent_outcome.snapshot),
                    record: Some(agent_outcome.record),
                }
            }
            Err(AgentError::Timeout { partial, .. }) => {
                let _ = self.store.set_run_record(&task.id, &partial.record).await;
                SingleIterationOutcome {
                    task_id: task.id.clone(),
                    is_timeout: true,
                    error: None,
                    signal: None,
                    snapshot: Some(partial.snapshot),
                    record: Some(partial.record),
                }
            }
            Err(AgentError::NonZeroExit { partial, status, stderr }) => {
                let _ = self.store.set_run_record(&task.id, &partial.record).await;
                SingleIterationOutcome {
                    task_id: task.id.clone(),
                    is_timeout: false,
                    error: Some(format!("agent exited {status}: {stderr}")),
                    signal: None,
                    snapshot: Some(partial.snapshot),
                    record: Some(partial.record),
                }
            }
            Err(AgentError::LaunchFailed { binary, source }) => SingleIterationOutcome {
                task_id: task.id.clone(),
                is_timeout: false,
                error: Some(format!("failed to launch agent binary '{binary}': {source}")),
                signal: None,
                snapshot: None,
                record: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentSupervisorConfig;
    use crate::store::TaskFilter;
    use crate::types::{AwaitingTag, Epic, EpicStatus, Note};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeStore {
        epic: Epic,
        tasks: StdMutex<HashMap<String, Task>>,
        closed_epic: StdMutex<bool>,
    }

    #[async_trait]
    impl TaskStore for FakeStore {
        async fn get_epic(&self, id: &str) -> Result<Option<Epic>> {
            Ok(if id == self.epic.id { Some(self.epic.clone()) } else { None })
        }
        async fn get_task(&self, id: &str) -> Result<Option<Task>> {
            Ok(self.tasks.lock().unwrap().get(id).cloned())
        }
        async fn next_task(&self, _epic_id: &str) -> Result<Option<Task>> {
            let tasks = self.tasks.lock().unwrap();
            Ok(tasks
                .values()
                .find(|t| {
                    let blockers_closed = t.blocked_by.iter().all(|b| {
                        tasks.get(b).map(|bt| bt.status == TaskStatus::Closed).unwrap_or(true)
                    });
                    t.is_ready(blockers_closed)
                })
                .cloned())
        }
        async fn next_task_with_options(&self, _filter: TaskFilter) -> Result<Option<Task>> {
            Ok(None)
        }
        async fn has_open_tasks(&self, _epic_id: &str) -> Result<bool> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .values()
                .any(|t| t.status != TaskStatus::Closed))
        }
        async fn close_task(&self, id: &str, _reason: &str) -> Result<()> {
            if let Some(t) = self.tasks.lock().unwrap().get_mut(id) {
                t.status = TaskStatus::Closed;
            }
            Ok(())
        }
        async fn close_epic(&self, _id: &str, _reason: &str) -> Result<()> {
            *self.closed_epic.lock().unwrap() = true;
            Ok(())
        }
        async fn reopen_task(&self, id: &str) -> Result<()> {
            if let Some(t) = self.tasks.lock().unwrap().get_mut(id) {
                t.status = TaskStatus::Open;
            }
            Ok(())
        }
        async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
            if let Some(t) = self.tasks.lock().unwrap().get_mut(id) {
                t.status = status;
            }
            Ok(())
        }
        async fn set_awaiting(&self, task_id: &str, tag: AwaitingTag, _note: &str) -> Result<()> {
            if let Some(t) = self.tasks.lock().unwrap().get_mut(task_id) {
                t.awaiting = Some(tag);
            }
            Ok(())
        }
        async fn add_note(&self, _issue_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn get_notes(&self, _epic_id: &str) -> Result<Vec<Note>> {
            Ok(vec![])
        }
        async fn get_human_notes(&self, _task_id: &str) -> Result<Vec<Note>> {
            Ok(vec![])
        }
        async fn set_run_record(&self, _task_id: &str, _record: &AgentRunRecord) -> Result<()> {
            Ok(())
        }
        async fn get_run_record(&self, _task_id: &str) -> Result<Option<AgentRunRecord>> {
            Ok(None)
        }
        async fn list_ready_epics(&self) -> Result<Vec<Epic>> {
            Ok(vec![])
        }
    }

    fn make_task(id: &str, blocked_by: Vec<&str>) -> Task {
        Task {
            id: id.to_string(),
            parent_epic: Some("e1".to_string()),
            title: id.to_string(),
            description: "desc".to_string(),
            status: TaskStatus::Open,
            priority: 0,
            blocked_by: blocked_by.into_iter().map(String::from).collect(),
            awaiting: None,
            requires: None,
        }
    }

    fn test_engine(store: Arc<dyn TaskStore>, max_iterations: u32) -> IterationEngine {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let config = EngineConfig {
            epic_id: "e1".to_string(),
            max_iterations,
            agent_timeout: Duration::from_secs(1),
            skip_verify: true,
            ..Default::default()
        };
        IterationEngine::new(
            config,
            store,
            BudgetTracker::new(crate::budget::BudgetLimits {
                max_iterations,
                ..Default::default()
            }),
            CheckpointStore::new(std::env::temp_dir().join(format!("ticker-test-{}", uuid::Uuid::new_v4()))),
            vec![],
            AgentSupervisor::new(AgentSupervisorConfig {
                binary: "this-agent-binary-does-not-exist".to_string(),
                extra_args: vec![],
            }),
            Arc::new(NullObserver),
            cancel_rx,
            pause_rx,
        )
    }

    #[tokio::test]
    async fn no_tasks_found_closes_epic_on_first_iteration() {
        let store: Arc<dyn TaskStore> = Arc::new(FakeStore {
            epic: Epic {
                id: "e1".to_string(),
                title: "Epic".to_string(),
                status: EpicStatus::Open,
                kind: "epic".to_string(),
                description: String::new(),
            },
            tasks: StdMutex::new(HashMap::new()),
            closed_epic: StdMutex::new(false),
        });
        let mut engine = test_engine(Arc::clone(&store), 5);
        let result = engine.run().await.unwrap();
        assert_eq!(result.exit_reason, ExitReason::NoTasksFound);
    }

    #[tokio::test]
    async fn launch_failure_is_recorded_as_error_and_loop_continues_until_cap() {
        let mut tasks = HashMap::new();
        tasks.insert("t1".to_string(), make_task("t1", vec![]));
        let store: Arc<dyn TaskStore> = Arc::new(FakeStore {
            epic: Epic {
                id: "e1".to_string(),
                title: "Epic".to_string(),
                status: EpicStatus::Open,
                kind: "epic".to_string(),
                description: String::new(),
            },
            tasks: StdMutex::new(tasks),
            closed_epic: StdMutex::new(false),
        });
        let mut engine = test_engine(Arc::clone(&store), 2);
        let result = engine.run().await.unwrap();
        assert_eq!(result.exit_reason, ExitReason::IterationCapReached);
        assert_eq!(result.iterations_run, 2);
    }

    #[tokio::test]
    async fn cancellation_before_start_exits_immediately() {
        let (cancel_tx, cancel_rx) = watch::channel(true);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let store: Arc<dyn TaskStore> = Arc::new(FakeStore {
            epic: Epic {
                id: "e1".to_string(),
                title: "Epic".to_string(),
                status: EpicStatus::Open,
                kind: "epic".to_string(),
                description: String::new(),
            },
            tasks: StdMutex::new(HashMap::new()),
            closed_epic: StdMutex::new(false),
        });
        let mut engine = test_engine(Arc::clone(&store), 5);
        engine.cancel = cancel_rx;
        let result = engine.run().await.unwrap();
        assert_eq!(result.exit_reason, ExitReason::Cancelled);
        drop(cancel_tx);
    }

    #[tokio::test]
    async fn refuses_to_start_on_non_epic_kind() {
        let store: Arc<dyn TaskStore> = Arc::new(FakeStore {
            epic: Epic {
                id: "e1".to_string(),
                title: "Not an epic".to_string(),
                status: EpicStatus::Open,
                kind: "bug".to_string(),
                description: String::new(),
            },
            tasks: StdMutex::new(HashMap::new()),
            closed_epic: StdMutex::new(false),
        });
        let mut engine = test_engine(Arc::clone(&store), 5);
        let err = engine.run().await.unwrap_err();
        assert!(err.to_string().contains("not \"epic\""));
    }

    #[tokio::test]
    async fn refuses_to_start_on_unknown_epic_id() {
        let store: Arc<dyn TaskStore> = Arc::new(FakeStore {
            epic: Epic {
                id: "some-other-epic".to_string(),
                title: "Epic".to_string(),
                status: EpicStatus::Open,
                kind: "epic".to_string(),
                description: String::new(),
            },
            tasks: StdMutex::new(HashMap::new()),
            closed_epic: StdMutex::new(false),
        });
        let mut engine = test_engine(Arc::clone(&store), 5);
        let err = engine.run().await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
