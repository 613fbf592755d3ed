//! `ticker list` - list epics with open work, the teacher's `muster` renamed

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::find_project_dir;
use crate::store::{BeadsTaskStore, TaskStore};
use crate::types::EpicStatus;

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output JSON instead of a human-readable table
    #[arg(long)]
    json: bool,

    /// Project directory
    #[arg(short, long)]
    project_dir: Option<PathBuf>,
}

#[derive(serde::Serialize)]
struct ListedEpic {
    id: String,
    title: String,
    status: String,
    next_ready_task: Option<String>,
    has_open_tasks: bool,
}

pub async fn execute(args: ListArgs) -> anyhow::Result<i32> {
    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => find_project_dir()?,
    };

    let store: Arc<dyn TaskStore> = Arc::new(BeadsTaskStore::new(project_dir));
    let epics = store.list_ready_epics().await?;

    let mut listed = Vec::with_capacity(epics.len());
    for epic in &epics {
        let next_ready_task = store
            .next_task(&epic.id)
            .await?
            .map(|t| format!("{} ({})", t.id, t.title));
        let has_open_tasks = store.has_open_tasks(&epic.id).await?;
        listed.push(ListedEpic {
            id: epic.id.clone(),
            title: epic.title.clone(),
            status: format!("{:?}", epic.status),
            next_ready_task,
            has_open_tasks,
        });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return Ok(0);
    }

    if listed.is_empty() {
        println!("No ready epics found.");
        return Ok(0);
    }

    println!("Ready epics:\n");
    for epic in &listed {
        let symbol = if epic.status == format!("{:?}", EpicStatus::Open) {
            "\u{25cb}"
        } else {
            "\u{2713}"
        };
        println!("  {} {} - {}", symbol, epic.id, epic.title);
        match &epic.next_ready_task {
            Some(task) => println!("      next ready task: {task}"),
            None if epic.has_open_tasks => println!("      open tasks remain, none ready (awaiting human)"),
            None => println!("      no open tasks"),
        }
    }

    Ok(0)
}
