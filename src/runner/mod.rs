//! Launches many `IterationEngine`s concurrently over a shared budget, gates
//! merges through a single `MergeCoordinator`, and aggregates results.
//!
//! Grounded on the teacher's `WorkerPool::spawn_workers` (a fixed pool of
//! `tokio::spawn` loops), generalized from a flat worker-claims-any-task
//! model to one `IterationEngine` per epic under a `tokio::sync::Semaphore`
//! permit — epics, unlike the teacher's individual tasks, need an exclusive
//! worktree for their whole lifetime.

use crate::agent::{AgentSupervisor, AgentSupervisorConfig};
use crate::budget::{BudgetLimits, BudgetTracker};
use crate::checkpoint::CheckpointStore;
use crate::engine::{EngineConfig, EngineObserver, EngineResult, ExitReason, IterationEngine};
use crate::merge::{MergeCoordinator, MergeOutcome};
use crate::store::TaskStore;
use crate::types::AwaitingTag;
use crate::verify::Verifier;
use crate::worktree::WorktreeManager;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone, PartialEq)]
pub enum EpicStatus {
    Completed,
    Failed,
    Conflict,
    Interrupted,
    BudgetExceeded,
    WatchTimeout,
    Handoff,
}

fn classify(reason: &ExitReason) -> EpicStatus {
    match reason {
        ExitReason::AllTasksCompleted | ExitReason::NoTasksFound => EpicStatus::Completed,
        ExitReason::NoReadyTasks => EpicStatus::Handoff,
        ExitReason::StuckOnTask { .. } => EpicStatus::Failed,
        ExitReason::IterationCapReached => EpicStatus::Failed,
        ExitReason::BudgetExceeded(_) => EpicStatus::BudgetExceeded,
        ExitReason::WatchTimeout => EpicStatus::WatchTimeout,
        ExitReason::Cancelled => EpicStatus::Interrupted,
    }
}

#[derive(Debug, Clone)]
pub struct EpicOutcome {
    pub epic_id: String,
    pub status: EpicStatus,
    pub exit_reason: String,
    pub completed_task_ids: Vec<String>,
    pub conflicted_files: Vec<String>,
    pub last_awaiting: Option<AwaitingTag>,
}

#[derive(Debug, Clone)]
pub struct RunnerResult {
    pub duration: Duration,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub epics: Vec<EpicOutcome>,
}

pub trait RunnerObserver: Send + Sync {
    fn on_epic_start(&self, _epic_id: &str) {}
    fn on_epic_complete(&self, _epic_id: &str) {}
    fn on_epic_failed(&self, _epic_id: &str, _reason: &str) {}
    fn on_epic_conflict(&self, _epic_id: &str, _branch: &str, _files: &[String]) {}
}

pub struct NullRunnerObserver;
impl RunnerObserver for NullRunnerObserver {}

pub struct ParallelRunnerConfig {
    pub trunk_dir: PathBuf,
    pub worktree_base: PathBuf,
    pub concurrency: usize,
    pub budget_limits: BudgetLimits,
    pub agent: AgentSupervisorConfig,
    pub engine_defaults: EngineConfig,
}

pub struct ParallelRunner {
    config: ParallelRunnerConfig,
    store: Arc<dyn TaskStore>,
    budget: BudgetTracker,
    worktrees: WorktreeManager,
    merge_coordinator: Arc<MergeCoordinator>,
    observer: Arc<dyn RunnerObserver>,
    cancel: watch::Receiver<bool>,
}

impl ParallelRunner {
    pub fn new(
        config: ParallelRunnerConfig,
        store: Arc<dyn TaskStore>,
        observer: Arc<dyn RunnerObserver>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let budget = BudgetTracker::new(config.budget_limits);
        let worktrees = WorktreeManager::new(config.trunk_dir.clone(), config.worktree_base.clone());
        let merge_coordinator = Arc::new(MergeCoordinator::new(config.trunk_dir.clone()));
        Self {
            config,
            store,
            budget,
            worktrees,
            merge_coordinator,
            observer,
            cancel,
        }
    }

    /// Refuses to start unless the trunk is clean, auto-committing
    /// engine-metadata-only dirt first.
    async fn check_preconditions(&self) -> Result<()> {
        if self.worktrees.trunk_only_metadata_dirty().await? {
            self.worktrees.auto_commit_metadata().await?;
            return Ok(());
        }
        if self.worktrees.trunk_is_dirty().await? {
            anyhow::bail!("trunk working tree is dirty; commit or stash before a parallel run");
        }
        Ok(())
    }

    pub async fn run(
        &self,
        epic_ids: Vec<String>,
        make_verifiers: Arc<dyn Fn(&Path) -> Vec<Box<dyn Verifier>> + Send + Sync>,
        make_engine_observer: Arc<dyn Fn(&str) -> Arc<dyn EngineObserver> + Send + Sync>,
        pause: watch::Receiver<bool>,
    ) -> Result<RunnerResult> {
        self.check_preconditions().await?;

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        let mut handles = Vec::new();

        for epic_id in epic_ids {
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let budget = self.budget.clone();
            let worktrees_base = self.config.worktree_base.clone();
            let trunk_dir = self.config.trunk_dir.clone();
            let merge_coordinator = Arc::clone(&self.merge_coordinator);
            let observer = Arc::clone(&self.observer);
            let engine_defaults = self.config.engine_defaults.clone();
            let agent_config = self.config.agent.clone();
            let cancel = self.cancel.clone();
            let pause = pause.clone();
            let worktree_manager = WorktreeManager::new(trunk_dir, worktrees_base);
            let make_verifiers = Arc::clone(&make_verifiers);
            let make_engine_observer = Arc::clone(&make_engine_observer);

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .context("semaphore closed unexpectedly")?;

                let worktree = match worktree_manager.get(&epic_id).await {
                    Some(wt) => wt,
                    None => worktree_manager.create(&epic_id).await?,
                };

                observer.on_epic_start(&epic_id);

                let mut config = engine_defaults;
                config.epic_id = epic_id.clone();
                config.working_dir = worktree.path.clone();

                let checkpoints = CheckpointStore::new(trunk_checkpoints_dir(&worktree.path));
                let verifiers = make_verifiers(&worktree.path);
                let supervisor = AgentSupervisor::new(agent_config);
                let engine_observer = make_engine_observer(&epic_id);

                let mut engine = IterationEngine::new(
                    config,
                    store,
                    budget,
                    checkpoints,
                    verifiers,
                    supervisor,
                    engine_observer,
                    cancel,
                    pause,
                );

                let result = engine.run().await?;

                let outcome = Self::finalize_epic(
                    &merge_coordinator,
                    &worktree_manager,
                    &worktree.epic_id,
                    &worktree.branch,
                    result,
                    observer.as_ref(),
                )
                .await?;

                Ok::<EpicOutcome, anyhow::Error>(outcome)
            });

            handles.push(handle);
        }

        let mut epics = Vec::new();
        let mut total_cost = 0.0;
        let mut total_tokens = 0u64;

        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => epics.push(outcome),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "epic task failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "epic task panicked");
                }
            }
        }

        let usage = self.budget.usage();
        total_cost += usage.cost;
        total_tokens += usage.input_tokens + usage.output_tokens;

        Ok(RunnerResult {
            duration: started.elapsed(),
            total_cost,
            total_tokens,
            epics,
        })
    }

    /// §4.11: merge only on a true-completion exit reason; otherwise preserve
    /// the worktree untouched for resume or manual resolution.
    async fn finalize_epic(
        merge_coordinator: &MergeCoordinator,
        worktree_manager: &WorktreeManager,
        epic_id: &str,
        branch: &str,
        result: EngineResult,
        observer: &dyn RunnerObserver,
    ) -> Result<EpicOutcome> {
        let status = classify(&result.exit_reason);
        let exit_reason = result.exit_reason.to_string();
        let last_awaiting = result.last_awaiting;

        if !matches!(result.exit_reason, ExitReason::AllTasksCompleted) {
            match status {
                EpicStatus::Completed => {
                    observer.on_epic_complete(epic_id);
                }
                _ => observer.on_epic_failed(epic_id, &exit_reason),
            }
            return Ok(EpicOutcome {
                epic_id: epic_id.to_string(),
                status,
                exit_reason,
                completed_task_ids: result.completed_task_ids,
                conflicted_files: vec![],
                last_awaiting,
            });
        }

        let worktree = worktree_manager
            .get(epic_id)
            .await
            .context("worktree missing at merge time")?;

        let merge_result = merge_coordinator.merge(&worktree).await?;
        match merge_result.outcome {
            MergeOutcome::Merged { .. } => {
                worktree_manager.remove(epic_id).await.ok();
                observer.on_epic_complete(epic_id);
                Ok(EpicOutcome {
                    epic_id: epic_id.to_string(),
                    status: EpicStatus::Completed,
                    exit_reason,
                    completed_task_ids: result.completed_task_ids,
                    conflicted_files: vec![],
                    last_awaiting,
                })
            }
            MergeOutcome::Conflict { files } => {
                observer.on_epic_conflict(epic_id, branch, &files);
                Ok(EpicOutcome {
                    epic_id: epic_id.to_string(),
                    status: EpicStatus::Conflict,
                    exit_reason,
                    completed_task_ids: result.completed_task_ids,
                    conflicted_files: files,
                    last_awaiting,
                })
            }
        }
    }
}

fn trunk_checkpoints_dir(worktree_path: &std::path::Path) -> PathBuf {
    worktree_path.join(".ticker").join("checkpoints")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_completion_reasons_to_completed() {
        assert_eq!(classify(&ExitReason::AllTasksCompleted), EpicStatus::Completed);
        assert_eq!(classify(&ExitReason::NoTasksFound), EpicStatus::Completed);
    }

    #[test]
    fn classify_maps_no_ready_tasks_to_handoff() {
        assert_eq!(classify(&ExitReason::NoReadyTasks), EpicStatus::Handoff);
    }

    #[test]
    fn classify_maps_budget_exceeded() {
        assert_eq!(
            classify(&ExitReason::BudgetExceeded("cost limit reached".to_string())),
            EpicStatus::BudgetExceeded
        );
    }

    #[test]
    fn classify_maps_cancellation_to_interrupted() {
        assert_eq!(classify(&ExitReason::Cancelled), EpicStatus::Interrupted);
    }
}
