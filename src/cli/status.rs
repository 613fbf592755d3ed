//! `ticker status` - check progress on an epic

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::CheckpointStore;
use crate::cli::find_project_dir;
use crate::store::{BeadsTaskStore, TaskStore};

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Epic ID to report on
    epic: String,

    /// Watch mode - redraw every 2 seconds
    #[arg(short, long)]
    watch: bool,

    /// Project directory
    #[arg(short, long)]
    project_dir: Option<PathBuf>,
}

pub async fn execute(args: StatusArgs) -> anyhow::Result<i32> {
    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => find_project_dir()?,
    };

    let store: Arc<dyn TaskStore> = Arc::new(BeadsTaskStore::new(project_dir.clone()));
    let checkpoints = CheckpointStore::new(project_dir.join(".ticker").join("checkpoints"));

    if args.watch {
        loop {
            print!("\x1b[2J\x1b[H");
            show_status(&store, &checkpoints, &args.epic).await?;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    } else {
        show_status(&store, &checkpoints, &args.epic).await?;
    }

    Ok(0)
}

async fn show_status(
    store: &Arc<dyn TaskStore>,
    checkpoints: &CheckpointStore,
    epic_id: &str,
) -> anyhow::Result<()> {
    let epic = store
        .get_epic(epic_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("epic {epic_id} not found"))?;

    println!("ticker status - {}\n", epic.title);
    println!("  Status: {:?}", epic.status);

    let has_open = store.has_open_tasks(epic_id).await?;
    let next = store.next_task(epic_id).await?;
    println!("  Open tasks remain: {has_open}");
    match &next {
        Some(t) => println!("  Next ready task: {} ({})", t.id, t.title),
        None => println!("  Next ready task: none"),
    }

    if let Some(latest) = checkpoints.latest(epic_id).await? {
        println!();
        println!("  Last checkpoint: iteration {}", latest.iteration);
        println!("  Cumulative tokens: {}", latest.cumulative_tokens);
        println!("  Cumulative cost: ${:.2}", latest.cumulative_cost);
        println!("  Closed tasks: {}", latest.closed_task_ids.len());
    } else {
        println!("\n  No checkpoints saved yet.");
    }

    let notes = store.get_notes(epic_id).await?;
    if !notes.is_empty() {
        println!("\n  Recent notes:");
        for note in notes.iter().rev().take(5) {
            println!("    - {}", note.text);
        }
    }

    Ok(())
}
