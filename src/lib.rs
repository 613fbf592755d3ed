//! Ticker - drive an AI coding agent through a task tracker's epics to completion
//!
//! Ticker runs an `IterationEngine` per epic: pick a ready task, prompt an
//! external coding agent, verify its work, react to human-gated signals, and
//! checkpoint progress. A `ParallelRunner` fans this out across many epics
//! concurrently, each isolated in its own git worktree, merging back to trunk
//! only on clean completion.

pub mod agent;
pub mod budget;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod durable;
pub mod engine;
pub mod merge;
pub mod prompt;
pub mod runner;
pub mod signal;
pub mod store;
pub mod types;
pub mod verify;
pub mod worktree;

pub use config::{Config, RuntimeConfig};
pub use engine::{EngineConfig, EngineResult, ExitReason, IterationEngine};
pub use runner::{EpicOutcome, EpicStatus, ParallelRunner, ParallelRunnerConfig, RunnerResult};
pub use store::{BeadsTaskStore, TaskStore};
pub use types::{AgentRunRecord, AwaitingTag, Epic, Note, Task, TaskStatus};
