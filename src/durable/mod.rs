//! Durable bookkeeping of whole parallel runs. The per-epic/per-iteration
//! state lives in `CheckpointStore`; this module is only for the top-level
//! `ticker run` invocation record, renamed from the teacher's `RunRecord` to
//! `OrchestrationRun` since it now spans many epics instead of one project.

use anyhow::Result;
use sqlx::{postgres::PgPool, sqlite::SqlitePool};
use uuid::Uuid;

use crate::runner::RunnerResult;

/// Durable store for one `ticker run` invocation's top-level bookkeeping.
pub enum DurableStore {
    Sqlite(SqliteStore),
    Postgres(PostgresStore),
}

impl DurableStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        if database_url.starts_with("sqlite://") {
            let path = database_url.trim_start_matches("sqlite://");
            SqliteStore::new(path).await.map(DurableStore::Sqlite)
        } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
            PostgresStore::new(database_url).await.map(DurableStore::Postgres)
        } else {
            anyhow::bail!("unsupported database URL: {}", database_url);
        }
    }

    pub async fn init(&self) -> Result<()> {
        match self {
            DurableStore::Sqlite(s) => s.init().await,
            DurableStore::Postgres(p) => p.init().await,
        }
    }

    pub async fn start_run(&self, run_id: &Uuid, epic_ids: &[String]) -> Result<()> {
        match self {
            DurableStore::Sqlite(s) => s.start_run(run_id, epic_ids).await,
            DurableStore::Postgres(p) => p.start_run(run_id, epic_ids).await,
        }
    }

    pub async fn complete_run(&self, run_id: &Uuid, result: &RunnerResult) -> Result<()> {
        match self {
            DurableStore::Sqlite(s) => s.complete_run(run_id, result).await,
            DurableStore::Postgres(p) => p.complete_run(run_id, result).await,
        }
    }

    pub async fn list_runs(&self) -> Result<Vec<OrchestrationRun>> {
        match self {
            DurableStore::Sqlite(s) => s.list_runs().await,
            DurableStore::Postgres(p) => p.list_runs().await,
        }
    }

    pub async fn get_run(&self, run_id: &Uuid) -> Result<Option<OrchestrationRun>> {
        match self {
            DurableStore::Sqlite(s) => s.get_run(run_id).await,
            DurableStore::Postgres(p) => p.get_run(run_id).await,
        }
    }
}

/// Record of one `ticker run` invocation across however many epics it drove.
#[derive(Debug, Clone)]
pub struct OrchestrationRun {
    pub id: Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub epic_count: i32,
    pub total_cost: Option<f64>,
    pub total_tokens: Option<i64>,
}

// ============================================================================
// SQLITE IMPLEMENTATION
// ============================================================================

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(path: &str) -> Result<Self> {
        let pool = SqlitePool::connect(path).await?;
        Ok(Self { pool })
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestration_runs (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                epic_count INTEGER NOT NULL,
                epic_ids TEXT NOT NULL,
                total_cost REAL,
                total_tokens INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn start_run(&self, run_id: &Uuid, epic_ids: &[String]) -> Result<()> {
        let epic_ids_json = serde_json::to_string(epic_ids)?;

        sqlx::query(
            r#"
            INSERT INTO orchestration_runs (id, started_at, epic_count, epic_ids)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(run_id.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(epic_ids.len() as i32)
        .bind(epic_ids_json)
        .execute(&self.pool)
        .await?;

        tracing::info!(run = %run_id, "started orchestration run");
        Ok(())
    }

    async fn complete_run(&self, run_id: &Uuid, result: &RunnerResult) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orchestration_runs
            SET completed_at = ?1, total_cost = ?2, total_tokens = ?3
            WHERE id = ?4
            "#,
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(result.total_cost)
        .bind(result.total_tokens as i64)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        tracing::info!(run = %run_id, "completed orchestration run");
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<OrchestrationRun>> {
        let rows = sqlx::query_as::<_, (String, String, Option<String>, i32, Option<f64>, Option<i64>)>(
            "SELECT id, started_at, completed_at, epic_count, total_cost, total_tokens FROM orchestration_runs ORDER BY started_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_run).collect())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<OrchestrationRun>> {
        let row = sqlx::query_as::<_, (String, String, Option<String>, i32, Option<f64>, Option<i64>)>(
            "SELECT id, started_at, completed_at, epic_count, total_cost, total_tokens FROM orchestration_runs WHERE id = ?1",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_run))
    }
}

fn row_to_run(row: (String, String, Option<String>, i32, Option<f64>, Option<i64>)) -> OrchestrationRun {
    let (id, started, completed, epic_count, total_cost, total_tokens) = row;
    OrchestrationRun {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        started_at: chrono::DateTime::parse_from_rfc3339(&started)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        completed_at: completed
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        epic_count,
        total_cost,
        total_tokens,
    }
}

// ============================================================================
// POSTGRES IMPLEMENTATION
// ============================================================================

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self { pool })
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestration_runs (
                id UUID PRIMARY KEY,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                epic_count INTEGER NOT NULL,
                epic_ids JSONB NOT NULL,
                total_cost DOUBLE PRECISION,
                total_tokens BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn start_run(&self, run_id: &Uuid, epic_ids: &[String]) -> Result<()> {
        let epic_ids_json = serde_json::to_value(epic_ids)?;

        sqlx::query(
            r#"
            INSERT INTO orchestration_runs (id, started_at, epic_count, epic_ids)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run_id)
        .bind(chrono::Utc::now())
        .bind(epic_ids.len() as i32)
        .bind(epic_ids_json)
        .execute(&self.pool)
        .await?;

        tracing::info!(run = %run_id, "started orchestration run");
        Ok(())
    }

    async fn complete_run(&self, run_id: &Uuid, result: &RunnerResult) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orchestration_runs
            SET completed_at = $1, total_cost = $2, total_tokens = $3
            WHERE id = $4
            "#,
        )
        .bind(chrono::Utc::now())
        .bind(result.total_cost)
        .bind(result.total_tokens as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(run = %run_id, "completed orchestration run");
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<OrchestrationRun>> {
        let rows = sqlx::query_as::<_, (Uuid, chrono::DateTime<chrono::Utc>, Option<chrono::DateTime<chrono::Utc>>, i32, Option<f64>, Option<i64>)>(
            "SELECT id, started_at, completed_at, epic_count, total_cost, total_tokens FROM orchestration_runs ORDER BY started_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, started_at, completed_at, epic_count, total_cost, total_tokens)| OrchestrationRun {
                id,
                started_at,
                completed_at,
                epic_count,
                total_cost,
                total_tokens,
            })
            .collect())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<OrchestrationRun>> {
        let row = sqlx::query_as::<_, (Uuid, chrono::DateTime<chrono::Utc>, Option<chrono::DateTime<chrono::Utc>>, i32, Option<f64>, Option<i64>)>(
            "SELECT id, started_at, completed_at, epic_count, total_cost, total_tokens FROM orchestration_runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, started_at, completed_at, epic_count, total_cost, total_tokens)| OrchestrationRun {
            id,
            started_at,
            completed_at,
            epic_count,
            total_cost,
            total_tokens,
        }))
    }
}
