//! SQLite-based run store

use crate::core::RunStatus;
use crate::persistence::{RunStore, RunSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

const COLUMNS: &str = "id, pipeline_name, repository, revision, status, current_stage, \
    completed_stages, total_stages, failure, superseded_by, started_at, updated_at, completed_at";

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (creating if missing) the database at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open run database {:?}", db_path))?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("sitepipe");
        std::fs::create_dir_all(&db_dir)?;

        Self::new(&db_dir.join("runs.db")).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                repository TEXT NOT NULL,
                revision TEXT NOT NULL,
                status TEXT NOT NULL,
                current_stage TEXT,
                completed_stages INTEGER NOT NULL DEFAULT 0,
                total_stages INTEGER NOT NULL DEFAULT 0,
                failure TEXT,
                superseded_by TEXT,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline_name ON runs(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<RunSummary> {
        let status: String = row.get("status");
        let superseded_by: Option<String> = row.get("superseded_by");
        Ok(RunSummary {
            run_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline_name: row.get("pipeline_name"),
            repository: row.get("repository"),
            revision: row.get("revision"),
            status: status.parse::<RunStatus>().map_err(anyhow::Error::msg)?,
            current_stage: row.get("current_stage"),
            completed_stages: row.get::<i64, _>("completed_stages") as usize,
            total_stages: row.get::<i64, _>("total_stages") as usize,
            failure: row.get("failure"),
            superseded_by: superseded_by.as_deref().map(Uuid::parse_str).transpose()?,
            started_at: Self::from_naive(row.get("started_at")),
            updated_at: Self::from_naive(row.get("updated_at")),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(Self::from_naive),
        })
    }
}

#[async_trait::async_trait]
impl RunStore for SqliteRunStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO runs ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            COLUMNS
        ))
        .bind(run.run_id.to_string())
        .bind(&run.pipeline_name)
        .bind(&run.repository)
        .bind(&run.revision)
        .bind(run.status.as_str())
        .bind(run.current_stage.clone())
        .bind(run.completed_stages as i64)
        .bind(run.total_stages as i64)
        .bind(run.failure.clone())
        .bind(run.superseded_by.map(|id| id.to_string()))
        .bind(Self::to_naive(run.started_at))
        .bind(Self::to_naive(run.updated_at))
        .bind(run.completed_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE pipeline_name = ?1 ORDER BY started_at DESC",
            COLUMNS
        ))
        .bind(pipeline_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT pipeline_name FROM runs ORDER BY pipeline_name ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }
}
