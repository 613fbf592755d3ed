//! `ticker run` - drive epics to completion (or handoff) via the parallel runner

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::find_project_dir;
use crate::config::{load_config, RuntimeConfig};
use crate::engine::NullObserver;
use crate::runner::{
    EpicOutcome, EpicStatus, ParallelRunner, ParallelRunnerConfig, RunnerObserver, RunnerResult,
};
use crate::store::{BeadsTaskStore, TaskStore};
use crate::verify::{GitCleanVerifier, Verifier};
use tokio::sync::watch;

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run a single epic by ID instead of sweeping every ready epic
    #[arg(short, long)]
    epic: Option<String>,

    /// Number of epics to drive concurrently
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Max iterations per epic
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Max cost in dollars shared across the run
    #[arg(long)]
    max_cost: Option<f64>,

    /// Skip post-task verification
    #[arg(long)]
    skip_verify: bool,

    /// Keep polling for newly-ready tasks instead of exiting on handoff
    #[arg(long)]
    watch: bool,

    /// Show what would run without executing anything
    #[arg(long)]
    dry_run: bool,

    /// Project directory
    #[arg(short, long)]
    project_dir: Option<PathBuf>,
}

struct PrintingRunnerObserver;

impl RunnerObserver for PrintingRunnerObserver {
    fn on_epic_start(&self, epic_id: &str) {
        println!("\u{25b6} {epic_id} starting");
    }
    fn on_epic_complete(&self, epic_id: &str) {
        println!("\u{2713} {epic_id} complete");
    }
    fn on_epic_failed(&self, epic_id: &str, reason: &str) {
        println!("\u{2717} {epic_id} failed: {reason}");
    }
    fn on_epic_conflict(&self, epic_id: &str, branch: &str, files: &[String]) {
        println!(
            "\u{26a0} {epic_id} merge conflict on {branch}: {}",
            files.join(", ")
        );
    }
}

pub async fn execute(args: RunArgs) -> anyhow::Result<i32> {
    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => find_project_dir()?,
    };

    let mut config = load_config(&project_dir)?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(max_cost) = args.max_cost {
        config.max_cost = max_cost;
    }
    if args.skip_verify {
        config.skip_verify = true;
    }
    if args.watch {
        config.watch = true;
    }

    let store: Arc<dyn TaskStore> = Arc::new(BeadsTaskStore::new(project_dir.clone()));

    let epic_ids: Vec<String> = match args.epic {
        Some(id) => vec![id],
        None => store
            .list_ready_epics()
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect(),
    };

    if epic_ids.is_empty() {
        println!("No work found!");
        return Ok(0);
    }

    println!("ticker \u{2014} driving {} epic(s)", epic_ids.len());
    for id in &epic_ids {
        println!("  - {id}");
    }
    println!();

    if args.dry_run {
        println!("dry run \u{2014} not executing");
        return Ok(0);
    }

    let runtime: RuntimeConfig = config.into();
    let runtime = runtime.with_project_dir(project_dir.clone());

    let durable = crate::durable::DurableStore::connect(&runtime.database).await?;
    durable.init().await?;
    let run_id = uuid::Uuid::new_v4();
    durable.start_run(&run_id, &epic_ids).await?;

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let (_pause_tx, pause_rx) = watch::channel(false);

    let skip_verify = runtime.engine_defaults.skip_verify;

    let runner_config = ParallelRunnerConfig {
        trunk_dir: project_dir.clone(),
        worktree_base: runtime.worktree_dir.clone(),
        concurrency: runtime.concurrency,
        budget_limits: runtime.budget_limits,
        agent: runtime.agent.clone(),
        engine_defaults: runtime.engine_defaults.clone(),
    };

    let observer: Arc<dyn RunnerObserver> = Arc::new(PrintingRunnerObserver);
    let runner = ParallelRunner::new(runner_config, Arc::clone(&store), observer, cancel_rx);

    let make_verifiers: Arc<dyn Fn(&std::path::Path) -> Vec<Box<dyn Verifier>> + Send + Sync> =
        Arc::new(move |dir| {
            if skip_verify {
                Vec::new()
            } else {
                vec![Box::new(GitCleanVerifier::new_unchecked(dir)) as Box<dyn Verifier>]
            }
        });

    let make_engine_observer: Arc<dyn Fn(&str) -> Arc<dyn crate::engine::EngineObserver> + Send + Sync> =
        Arc::new(|_epic_id| Arc::new(NullObserver));

    let result = runner
        .run(epic_ids, make_verifiers, make_engine_observer, pause_rx)
        .await?;

    durable.complete_run(&run_id, &result).await?;

    print_results(&result);

    Ok(exit_code_for(&result))
}

fn print_results(result: &RunnerResult) {
    println!();
    println!("{}", "\u{2500}".repeat(60));
    println!("Duration:    {:?}", result.duration);
    println!("Total cost:  ${:.2}", result.total_cost);
    println!("Total tokens: {}", result.total_tokens);
    println!();

    for epic in &result.epics {
        println!(
            "  {} [{:?}] {} ({} task(s) completed)",
            epic.epic_id,
            epic.status,
            epic.exit_reason,
            epic.completed_task_ids.len()
        );
        if !epic.conflicted_files.is_empty() {
            println!("      conflicted: {}", epic.conflicted_files.join(", "));
        }
    }
}

/// Per-epic exit code per the 5-way scheme (0 success, 1 iteration cap, 2
/// eject, 3 blocked, 4 error), taking the worst code across all epics.
fn exit_code_for(result: &RunnerResult) -> i32 {
    result
        .epics
        .iter()
        .map(exit_code_for_epic)
        .max()
        .unwrap_or(0)
}

fn exit_code_for_epic(epic: &EpicOutcome) -> i32 {
    use crate::types::AwaitingTag;

    match epic.status {
        EpicStatus::Completed => 0,
        EpicStatus::Handoff => match epic.last_awaiting {
            Some(AwaitingTag::Work) => 2,
            _ => 3,
        },
        EpicStatus::Failed => {
            if epic.exit_reason == "iteration cap reached" {
                1
            } else {
                4
            }
        }
        EpicStatus::Conflict
        | EpicStatus::Interrupted
        | EpicStatus::BudgetExceeded
        | EpicStatus::WatchTimeout => 4,
    }
}
