//! CLI command handlers

pub mod checkpoints;
pub mod list;
pub mod resume;
pub mod run;
pub mod status;

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drive epics to completion via the parallel runner
    Run(run::RunArgs),

    /// Check progress on an epic
    Status(status::StatusArgs),

    /// List ready epics (the teacher's `muster`, renamed)
    List(list::ListArgs),

    /// Resume a single epic from its latest checkpoint
    Resume(resume::ResumeArgs),

    /// Inspect or delete saved checkpoints
    Checkpoints(checkpoints::CheckpointsArgs),
}

/// Returns the process exit code the caller should use.
pub async fn handle_command(cmd: Commands) -> anyhow::Result<i32> {
    match cmd {
        Commands::Run(args) => run::execute(args).await,
        Commands::Status(args) => status::execute(args).await,
        Commands::List(args) => list::execute(args).await,
        Commands::Resume(args) => resume::execute(args).await,
        Commands::Checkpoints(args) => checkpoints::execute(args).await,
    }
}

pub fn find_project_dir() -> anyhow::Result<PathBuf> {
    let current = std::env::current_dir()?;

    for ancestor in current.ancestors() {
        let ticker_config = ancestor.join(".ticker.toml");
        let beads_dir = ancestor.join(".beads");

        if ticker_config.exists() || beads_dir.exists() {
            return Ok(PathBuf::from(ancestor));
        }
    }

    Ok(current)
}
