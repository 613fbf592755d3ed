//! The `TaskStore` abstraction the engine speaks to, and its one adapter.

pub mod beads;

use crate::types::{AgentRunRecord, AwaitingTag, Epic, Note, Task, TaskStatus};
use anyhow::Result;
use async_trait::async_trait;

pub use beads::BeadsTaskStore;

/// Selection policy for tasks outside the normal epic-scoped lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFilter {
    /// Only tasks that belong to some epic.
    EpicChildren,
    /// Tasks with no parent epic at all.
    StandaloneOnly,
    /// Tasks whose parent epic id no longer resolves to a live epic.
    OrphanedOnly,
}

/// Query/mutate epics, tasks, notes, and persisted run records. Implementors
/// must assume concurrent modification by humans: callers always re-read
/// before taking a consequential action, so the trait itself makes no
/// caching promises.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_epic(&self, id: &str) -> Result<Option<Epic>>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Returns a ready task in the epic, or none. Policy per the data
    /// model's readiness invariant (open/in-progress, blockers closed, not
    /// awaiting a human).
    async fn next_task(&self, epic_id: &str) -> Result<Option<Task>>;

    /// Same as `next_task` but scoped by a selection filter instead of one
    /// epic id — used for standalone/orphaned task sweeps.
    async fn next_task_with_options(&self, filter: TaskFilter) -> Result<Option<Task>>;

    async fn has_open_tasks(&self, epic_id: &str) -> Result<bool>;

    async fn close_task(&self, id: &str, reason: &str) -> Result<()>;
    async fn close_epic(&self, id: &str, reason: &str) -> Result<()>;
    async fn reopen_task(&self, id: &str) -> Result<()>;
    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()>;
    async fn set_awaiting(&self, task_id: &str, tag: AwaitingTag, note: &str) -> Result<()>;

    async fn add_note(&self, issue_id: &str, text: &str) -> Result<()>;
    /// Engine-authored notes for an epic, in append order.
    async fn get_notes(&self, epic_id: &str) -> Result<Vec<Note>>;
    /// Human-authored notes for a task, time-ordered.
    async fn get_human_notes(&self, task_id: &str) -> Result<Vec<Note>>;

    async fn set_run_record(&self, task_id: &str, record: &AgentRunRecord) -> Result<()>;
    async fn get_run_record(&self, task_id: &str) -> Result<Option<AgentRunRecord>>;

    async fn list_ready_epics(&self) -> Result<Vec<Epic>>;
}
