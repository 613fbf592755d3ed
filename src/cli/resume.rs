//! `ticker resume` - resume a single epic from its latest checkpoint

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::AgentSupervisor;
use crate::budget::BudgetTracker;
use crate::checkpoint::CheckpointStore;
use crate::cli::find_project_dir;
use crate::config::{load_config, RuntimeConfig};
use crate::engine::{EngineObserver, IterationEngine, NullObserver};
use crate::store::{BeadsTaskStore, TaskStore};
use crate::verify::{GitCleanVerifier, Verifier};
use tokio::sync::watch;

#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Epic ID to resume
    epic: String,

    /// Project directory
    #[arg(short, long)]
    project_dir: Option<PathBuf>,
}

pub async fn execute(args: ResumeArgs) -> anyhow::Result<i32> {
    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => find_project_dir()?,
    };

    let config = load_config(&project_dir)?;
    let runtime: RuntimeConfig = config.into();
    let runtime = runtime.with_project_dir(project_dir.clone());

    let checkpoints_dir = project_dir.join(".ticker").join("checkpoints");
    let checkpoints = CheckpointStore::new(checkpoints_dir);

    let latest = checkpoints
        .latest(&args.epic)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no checkpoint found for epic {}", args.epic))?;

    println!(
        "resuming {} from iteration {} ({} task(s) already closed)",
        args.epic,
        latest.iteration,
        latest.closed_task_ids.len()
    );

    let store: Arc<dyn TaskStore> = Arc::new(BeadsTaskStore::new(project_dir.clone()));
    let budget = BudgetTracker::new(runtime.budget_limits);
    let supervisor = AgentSupervisor::new(runtime.agent.clone());
    let observer: Arc<dyn EngineObserver> = Arc::new(NullObserver);

    let verifiers: Vec<Box<dyn Verifier>> = if runtime.engine_defaults.skip_verify {
        Vec::new()
    } else {
        vec![Box::new(GitCleanVerifier::new_unchecked(&project_dir)) as Box<dyn Verifier>]
    };

    let mut engine_config = runtime.engine_defaults.clone();
    engine_config.epic_id = args.epic.clone();
    engine_config.working_dir = project_dir.clone();
    engine_config.resume_from_checkpoint = Some(latest.id());

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let (_pause_tx, pause_rx) = watch::channel(false);

    let mut engine = IterationEngine::new(
        engine_config,
        store,
        budget,
        checkpoints,
        verifiers,
        supervisor,
        observer,
        cancel_rx,
        pause_rx,
    );

    let result = engine.run().await?;

    println!("exit reason: {}", result.exit_reason);
    println!("iterations run: {}", result.iterations_run);
    println!("tasks completed: {}", result.completed_task_ids.len());

    Ok(0)
}
