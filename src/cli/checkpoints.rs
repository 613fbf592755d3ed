//! `ticker checkpoints` - inspect saved checkpoints

use clap::Parser;
use std::path::PathBuf;

use crate::checkpoint::CheckpointStore;
use crate::cli::find_project_dir;

#[derive(Parser, Debug)]
pub struct CheckpointsArgs {
    /// Restrict to one epic's checkpoints
    #[arg(short, long)]
    epic: Option<String>,

    /// Delete the named checkpoint (format: `<epicId>-<iteration>`)
    #[arg(long)]
    delete: Option<String>,

    /// Project directory
    #[arg(short, long)]
    project_dir: Option<PathBuf>,
}

pub async fn execute(args: CheckpointsArgs) -> anyhow::Result<i32> {
    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => find_project_dir()?,
    };

    let store = CheckpointStore::new(project_dir.join(".ticker").join("checkpoints"));

    if let Some(id) = args.delete {
        store.delete(&id).await?;
        println!("deleted checkpoint {id}");
        return Ok(0);
    }

    let checkpoints = match &args.epic {
        Some(epic_id) => store.list_for_epic(epic_id).await?,
        None => store.list().await?,
    };

    if checkpoints.is_empty() {
        println!("No checkpoints found.");
        return Ok(0);
    }

    println!("Checkpoints:\n");
    for cp in &checkpoints {
        println!(
            "  {} - iteration {} - {} task(s) closed - ${:.2} - {}",
            cp.id(),
            cp.iteration,
            cp.closed_task_ids.len(),
            cp.cumulative_cost,
            cp.timestamp.to_rfc3339()
        );
    }

    Ok(0)
}
