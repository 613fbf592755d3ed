//! `TaskStore` implemented against the `bd` task-tracker CLI.
//!
//! Grounded on the `bd` subprocess calls scattered through the teacher's
//! `drover::discover_work`/`load_epic`/`load_epic_tasks` (`bd show`, `bd ls
//! --parent`, `bd ls --all`) and `create_beads_task`/`close_task` (`bd new`,
//! `bd close`). `bd` has no notion of notes or agent run transcripts, so
//! those two pieces of the contract are backed by local JSON files under
//! `.ticker/notes/` and `.ticker/run-records/`, written with the same
//! temp-file-then-rename durability pattern as `CheckpointStore`.

use super::{TaskFilter, TaskStore};
use crate::types::{
    AgentRunRecord, AwaitingTag, Epic, EpicStatus, Note, NoteAuthor, Task, TaskStatus,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;

#[derive(Debug, Clone, Deserialize)]
struct BeadItem {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    blocked_by: Vec<String>,
    #[serde(default)]
    issue_type: String,
    #[serde(default)]
    awaiting: Option<String>,
}

impl BeadItem {
    fn task_status(&self) -> TaskStatus {
        match self.status.as_str() {
            "in_progress" => TaskStatus::InProgress,
            "closed" | "done" => TaskStatus::Closed,
            _ => TaskStatus::Open,
        }
    }

    fn epic_status(&self) -> EpicStatus {
        match self.status.as_str() {
            "closed" | "done" => EpicStatus::Closed,
            "archived" => EpicStatus::Archived,
            _ => EpicStatus::Open,
        }
    }

    fn awaiting_tag(&self) -> Option<AwaitingTag> {
        match self.awaiting.as_deref() {
            Some("approval") => Some(AwaitingTag::Approval),
            Some("input") => Some(AwaitingTag::Input),
            Some("review") => Some(AwaitingTag::Review),
            Some("content") => Some(AwaitingTag::Content),
            Some("escalation") => Some(AwaitingTag::Escalation),
            Some("checkpoint") => Some(AwaitingTag::Checkpoint),
            Some("work") => Some(AwaitingTag::Work),
            _ => None,
        }
    }

    fn into_task(self) -> Task {
        Task {
            id: self.id.clone(),
            parent_epic: self.parent.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.task_status(),
            priority: self.priority,
            blocked_by: self.blocked_by.clone(),
            awaiting: self.awaiting_tag(),
            requires: None,
        }
    }

    fn into_epic(self) -> Epic {
        Epic {
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.epic_status(),
            kind: self.issue_type.clone(),
            description: self.description.clone(),
        }
    }
}

fn awaiting_str(tag: AwaitingTag) -> &'static str {
    match tag {
        AwaitingTag::Approval => "approval",
        AwaitingTag::Input => "input",
        AwaitingTag::Review => "review",
        AwaitingTag::Content => "content",
        AwaitingTag::Escalation => "escalation",
        AwaitingTag::Checkpoint => "checkpoint",
        AwaitingTag::Work => "work",
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Open => "open",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Closed => "closed",
    }
}

pub struct BeadsTaskStore {
    project_dir: PathBuf,
    notes_dir: PathBuf,
    run_records_dir: PathBuf,
}

impl BeadsTaskStore {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            notes_dir: project_dir.join(".ticker").join("notes"),
            run_records_dir: project_dir.join(".ticker").join("run-records"),
            project_dir,
        }
    }

    async fn run_bd(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("bd")
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .await
            .context("failed to run bd")?;

        if !output.status.success() {
            anyhow::bail!(
                "bd {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn show(&self, id: &str) -> Result<Option<BeadItem>> {
        let output = Command::new("bd")
            .args(["show", id, "--json"])
            .current_dir(&self.project_dir)
            .output()
            .await
            .context("failed to run bd show")?;

        if !output.status.success() {
            return Ok(None);
        }
        let item: BeadItem = serde_json::from_slice(&output.stdout)
            .context("failed to parse bd show output")?;
        Ok(Some(item))
    }

    async fn list_children(&self, epic_id: &str) -> Result<Vec<BeadItem>> {
        let stdout = self
            .run_bd(&["ls", "--parent", epic_id, "--json"])
            .await?;
        parse_items(&stdout)
    }

    async fn list_all(&self) -> Result<Vec<BeadItem>> {
        let stdout = self.run_bd(&["ls", "--all", "--json"]).await?;
        parse_items(&stdout)
    }

    /// Picks the highest-priority ready task among `candidates`, resolving
    /// each candidate's blockers against the status map of the same set.
    fn pick_ready(candidates: Vec<BeadItem>) -> Option<Task> {
        let statuses: std::collections::HashMap<String, TaskStatus> = candidates
            .iter()
            .map(|c| (c.id.clone(), c.task_status()))
            .collect();

        candidates
            .into_iter()
            .map(BeadItem::into_task)
            .filter(|task| {
                let blockers_closed = task
                    .blocked_by
                    .iter()
                    .all(|b| statuses.get(b).map(|s| *s == TaskStatus::Closed).unwrap_or(true));
                task.is_ready(blockers_closed)
            })
            .max_by_key(|task| task.priority)
    }

    fn note_path(&self, issue_id: &str) -> PathBuf {
        self.notes_dir.join(format!("{issue_id}.json"))
    }

    async fn read_notes_file(&self, issue_id: &str) -> Result<Vec<Note>> {
        match tokio::fs::read(self.note_path(issue_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e).context("failed to read notes file"),
        }
    }

    async fn write_notes_file(&self, issue_id: &str, notes: &[Note]) -> Result<()> {
        tokio::fs::create_dir_all(&self.notes_dir)
            .await
            .context("failed to create notes directory")?;
        let final_path = self.note_path(issue_id);
        let tmp_path = self.notes_dir.join(format!(".{issue_id}.tmp"));
        let contents = serde_json::to_vec_pretty(notes)?;
        tokio::fs::write(&tmp_path, &contents).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    fn run_record_path(&self, task_id: &str) -> PathBuf {
        self.run_records_dir.join(format!("{task_id}.json"))
    }
}

fn parse_items(stdout: &str) -> Result<Vec<BeadItem>> {
    if stdout.trim().is_empty() {
        return Ok(vec![]);
    }
    serde_json::from_str(stdout).context("failed to parse bd ls output")
}

#[async_trait]
impl TaskStore for BeadsTaskStore {
    async fn get_epic(&self, id: &str) -> Result<Option<Epic>> {
        Ok(self.show(id).await?.map(BeadItem::into_epic))
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.show(id).await?.map(BeadItem::into_task))
    }

    async fn next_task(&self, epic_id: &str) -> Result<Option<Task>> {
        let children = self.list_children(epic_id).await?;
        Ok(Self::pick_ready(children))
    }

    async fn next_task_with_options(&self, filter: TaskFilter) -> Result<Option<Task>> {
        let all = self.list_all().await?;
        let epic_ids: std::collections::HashSet<String> = all
            .iter()
            .filter(|i| i.issue_type == "epic")
            .map(|i| i.id.clone())
            .collect();

        let candidates: Vec<BeadItem> = all
            .into_iter()
            .filter(|item| item.issue_type != "epic")
            .filter(|item| match filter {
                TaskFilter::EpicChildren => item.parent.is_some(),
                TaskFilter::StandaloneOnly => item.parent.is_none(),
                TaskFilter::OrphanedOnly => item
                    .parent
                    .as_ref()
                    .is_some_and(|p| !epic_ids.contains(p)),
            })
            .collect();

        Ok(Self::pick_ready(candidates))
    }

    async fn has_open_tasks(&self, epic_id: &str) -> Result<bool> {
        let children = self.list_children(epic_id).await?;
        Ok(children
            .iter()
            .any(|c| !matches!(c.task_status(), TaskStatus::Closed)))
    }

    async fn close_task(&self, id: &str, reason: &str) -> Result<()> {
        self.run_bd(&["close", id, "--reason", reason]).await?;
        Ok(())
    }

    async fn close_epic(&self, id: &str, reason: &str) -> Result<()> {
        self.run_bd(&["close", id, "--reason", reason]).await?;
        Ok(())
    }

    async fn reopen_task(&self, id: &str) -> Result<()> {
        self.run_bd(&["update", id, "--status", "open"]).await?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        self.run_bd(&["update", id, "--status", status_str(status)])
            .await?;
        Ok(())
    }

    async fn set_awaiting(&self, task_id: &str, tag: AwaitingTag, note: &str) -> Result<()> {
        self.run_bd(&["update", task_id, "--awaiting", awaiting_str(tag)])
            .await?;
        if !note.is_empty() {
            self.add_note(task_id, note).await?;
        }
        Ok(())
    }

    async fn add_note(&self, issue_id: &str, text: &str) -> Result<()> {
        let mut notes = self.read_notes_file(issue_id).await?;
        notes.push(Note {
            id: uuid::Uuid::new_v4().to_string(),
            issue_id: issue_id.to_string(),
            text: text.to_string(),
            created_at: chrono::Utc::now(),
            author: NoteAuthor::Engine,
        });
        self.write_notes_file(issue_id, &notes).await
    }

    async fn get_notes(&self, epic_id: &str) -> Result<Vec<Note>> {
        Ok(self
            .read_notes_file(epic_id)
            .await?
            .into_iter()
            .filter(|n| n.author == NoteAuthor::Engine)
            .collect())
    }

    async fn get_human_notes(&self, task_id: &str) -> Result<Vec<Note>> {
        let mut notes: Vec<Note> = self
            .read_notes_file(task_id)
            .await?
            .into_iter()
            .filter(|n| n.author == NoteAuthor::Human)
            .collect();
        notes.sort_by_key(|n| n.created_at);
        Ok(notes)
    }

    async fn set_run_record(&self, task_id: &str, record: &AgentRunRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.run_records_dir)
            .await
            .context("failed to create run-records directory")?;
        let final_path = self.run_record_path(task_id);
        let tmp_path = self.run_records_dir.join(format!(".{task_id}.tmp"));
        let contents = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp_path, &contents).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn get_run_record(&self, task_id: &str) -> Result<Option<AgentRunRecord>> {
        match tokio::fs::read(self.run_record_path(task_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read run record"),
        }
    }

    async fn list_ready_epics(&self) -> Result<Vec<Epic>> {
        let all = self.list_all().await?;
        Ok(all
            .into_iter()
            .filter(|i| i.issue_type == "epic" && i.status != "closed" && i.status != "archived")
            .map(BeadItem::into_epic)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bead_item_maps_status_strings() {
        let item = BeadItem {
            id: "t1".into(),
            title: "t".into(),
            description: String::new(),
            status: "in_progress".into(),
            priority: 0,
            parent: None,
            blocked_by: vec![],
            issue_type: "task".into(),
            awaiting: None,
        };
        assert_eq!(item.task_status(), TaskStatus::InProgress);
    }

    #[test]
    fn pick_ready_respects_blockers_and_priority() {
        let a = BeadItem {
            id: "a".into(),
            title: "a".into(),
            description: String::new(),
            status: "open".into(),
            priority: 1,
            parent: Some("e1".into()),
            blocked_by: vec!["b".into()],
            issue_type: "task".into(),
            awaiting: None,
        };
        let b = BeadItem {
            id: "b".into(),
            title: "b".into(),
            description: String::new(),
            status: "open".into(),
            priority: 5,
            parent: Some("e1".into()),
            blocked_by: vec![],
            issue_type: "task".into(),
            awaiting: None,
        };
        let picked = BeadsTaskStore::pick_ready(vec![a, b]).unwrap();
        assert_eq!(picked.id, "b");
    }

    #[tokio::test]
    async fn notes_round_trip_through_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = BeadsTaskStore::new(dir.path());
        store.add_note("e1", "watch out").await.unwrap();
        let notes = store.get_notes("e1").await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].text, "watch out");
        assert_eq!(notes[0].author, NoteAuthor::Engine);
    }

    #[tokio::test]
    async fn run_record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BeadsTaskStore::new(dir.path());
        let record = AgentRunRecord {
            session_id: "s1".into(),
            model: "m".into(),
            started_at: chrono::Utc::now(),
            ended_at: None,
            output_text: "out".into(),
            thinking_text: String::new(),
            tool_calls: vec![],
            input_tokens: 1,
            output_tokens: 2,
            cache_tokens: 0,
            cost: 0.1,
            success: true,
            turn_count: 1,
        };
        store.set_run_record("t1", &record).await.unwrap();
        let loaded = store.get_run_record("t1").await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
    }
}
