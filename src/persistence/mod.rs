//! Persistence layer for pipeline run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{PipelineRun, RunStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Status record of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,

    pub pipeline_name: String,

    /// Repository the trigger came from, as `owner/name@branch`
    pub repository: String,

    /// Source revision that triggered the run
    pub revision: String,

    pub status: RunStatus,

    /// Stage being executed, or the last one executed
    pub current_stage: Option<String>,

    pub completed_stages: usize,

    pub total_stages: usize,

    /// Failure reason for failed runs
    pub failure: Option<String>,

    pub superseded_by: Option<Uuid>,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            run_id: run.run_id,
            pipeline_name: run.pipeline_name.clone(),
            repository: run.trigger.repository.to_string(),
            revision: run.trigger.revision.clone(),
            status: run.status,
            current_stage: run.current_stage_name().map(String::from),
            completed_stages: run.completed_stages(),
            total_stages: run.stages.len(),
            failure: run.failure.as_ref().map(|f| f.to_string()),
            superseded_by: run.superseded_by,
            started_at: run.started_at,
            updated_at: run.updated_at,
            completed_at: run.completed_at,
        }
    }

    /// Fraction of stages that succeeded (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_stages == 0 {
            return 0.0;
        }
        self.completed_stages as f64 / self.total_stages as f64
    }
}

/// Trait for run-status stores
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run record
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// Runs of a pipeline, newest first
    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>>;

    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory run store (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, RunSummary>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>> {
        let mut runs: Vec<RunSummary> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.pipeline_name == pipeline_name)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .runs
            .read()
            .await
            .values()
            .map(|r| r.pipeline_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
