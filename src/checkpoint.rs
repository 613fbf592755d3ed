//! Durable snapshot-of-progress checkpoints under `.ticker/checkpoints/`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub epic_id: String,
    pub iteration: u32,
    pub cumulative_tokens: u64,
    pub cumulative_cost: f64,
    pub closed_task_ids: Vec<String>,
    pub commit_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    pub fn id(&self) -> String {
        format!("{}-{}", self.epic_id, self.iteration)
    }
}

/// Filesystem-backed map from checkpoint id to `Checkpoint`.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Writes to a temp file then atomically renames. Rejects empty ids.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let id = checkpoint.id();
        if id.trim().is_empty() || checkpoint.epic_id.trim().is_empty() {
            anyhow::bail!("checkpoint id must not be empty");
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .context("failed to create checkpoint directory")?;

        let final_path = self.path_for(&id);
        let tmp_path = self.root.join(format!(".{id}.tmp"));

        let contents = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp_path, &contents)
            .await
            .context("failed to write checkpoint temp file")?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .context("failed to rename checkpoint temp file into place")?;

        tracing::info!(checkpoint = %id, "saved checkpoint");
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read checkpoint"),
        }
    }

    /// All checkpoints across all epics, sorted newest-first by timestamp.
    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self.read_all().await?;
        checkpoints.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(checkpoints)
    }

    /// One epic's checkpoints, sorted by iteration descending.
    pub async fn list_for_epic(&self, epic_id: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|c| c.epic_id == epic_id)
            .collect();
        checkpoints.sort_by(|a, b| b.iteration.cmp(&a.iteration));
        Ok(checkpoints)
    }

    pub async fn latest(&self, epic_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.list_for_epic(epic_id).await?.into_iter().next())
    }

    /// Idempotent: deleting a missing checkpoint is not an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to delete checkpoint"),
        }
    }

    async fn read_all(&self) -> Result<Vec<Checkpoint>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            // Missing directory is treated as empty.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).context("failed to read checkpoint directory"),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !is_checkpoint_file(&entry.path()) {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                if let Ok(checkpoint) = serde_json::from_slice::<Checkpoint>(&bytes) {
                    checkpoints.push(checkpoint);
                }
            }
        }
        Ok(checkpoints)
    }
}

fn is_checkpoint_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".json") && !name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(epic: &str, iteration: u32) -> Checkpoint {
        Checkpoint {
            epic_id: epic.to_string(),
            iteration,
            cumulative_tokens: 100,
            cumulative_cost: 0.5,
            closed_task_ids: vec!["t1".to_string()],
            commit_id: Some("abc123".to_string()),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let cp = checkpoint("e1", 3);

        store.save(&cp).await.unwrap();
        let loaded = store.load(&cp.id()).await.unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[tokio::test]
    async fn save_rejects_empty_epic_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut cp = checkpoint("e1", 1);
        cp.epic_id = String::new();
        assert!(store.save(&cp).await.is_err());
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nonexistent"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.delete("nope-1").await.unwrap();
        store.delete("nope-1").await.unwrap();
    }

    #[tokio::test]
    async fn list_for_epic_sorts_by_iteration_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&checkpoint("e1", 1)).await.unwrap();
        store.save(&checkpoint("e1", 3)).await.unwrap();
        store.save(&checkpoint("e1", 2)).await.unwrap();
        store.save(&checkpoint("e2", 9)).await.unwrap();

        let list = store.list_for_epic("e1").await.unwrap();
        let iterations: Vec<u32> = list.iter().map(|c| c.iteration).collect();
        assert_eq!(iterations, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn latest_returns_highest_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&checkpoint("e1", 1)).await.unwrap();
        store.save(&checkpoint("e1", 5)).await.unwrap();

        let latest = store.latest("e1").await.unwrap().unwrap();
        assert_eq!(latest.iteration, 5);
    }
}
