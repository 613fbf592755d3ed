//! Core data model shared by the store, engine, and runner.

use serde::{Deserialize, Serialize};

/// A container of related tasks forming a unit of work for one autonomous run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub title: String,
    pub status: EpicStatus,
    /// Must be "epic" for the engine to accept this entity as a run target.
    pub kind: String,
    pub description: String,
}

impl Epic {
    /// Invariant: the engine refuses to start on an entity whose kind isn't "epic".
    pub fn is_epic(&self) -> bool {
        self.kind == "epic"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpicStatus {
    Open,
    Closed,
    Archived,
}

/// An atomic work item with status, blockers, and optional human-gated states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub parent_epic: Option<String>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub blocked_by: Vec<String>,
    pub awaiting: Option<AwaitingTag>,
    /// Pre-declared approval gate. Carried on the type but not consulted by
    /// signal handling — see Open Question (i) in DESIGN.md.
    pub requires: Option<AwaitingTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
}

/// Fixed vocabulary of human-gated states a task can be waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingTag {
    Approval,
    Input,
    Review,
    Content,
    Escalation,
    Checkpoint,
    Work,
}

impl Task {
    /// A task is ready iff it's open/in-progress, every blocker is closed, and
    /// it isn't waiting on a human.
    pub fn is_ready(&self, blockers_closed: bool) -> bool {
        matches!(self.status, TaskStatus::Open | TaskStatus::InProgress)
            && blockers_closed
            && self.awaiting.is_none()
    }
}

/// A timestamped text entry attached to either an epic or a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub issue_id: String,
    pub text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub author: NoteAuthor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteAuthor {
    Human,
    Engine,
}

/// The persisted transcript of one agent invocation on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub session_id: String,
    pub model: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub output_text: String,
    pub thinking_text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub cost: f64,
    pub success: bool,
    pub turn_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub id: String,
    pub duration: std::time::Duration,
    pub error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus, awaiting: Option<AwaitingTag>) -> Task {
        Task {
            id: "t1".into(),
            parent_epic: None,
            title: "t".into(),
            description: String::new(),
            status,
            priority: 0,
            blocked_by: vec![],
            awaiting,
            requires: None,
        }
    }

    #[test]
    fn ready_requires_open_or_in_progress() {
        assert!(task(TaskStatus::Open, None).is_ready(true));
        assert!(task(TaskStatus::InProgress, None).is_ready(true));
        assert!(!task(TaskStatus::Closed, None).is_ready(true));
    }

    #[test]
    fn ready_requires_blockers_closed() {
        assert!(!task(TaskStatus::Open, None).is_ready(false));
    }

    #[test]
    fn ready_requires_no_awaiting_tag() {
        assert!(!task(TaskStatus::Open, Some(AwaitingTag::Approval)).is_ready(true));
    }
}
