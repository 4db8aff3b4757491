//! Cache-invalidation task
//!
//! A short-lived function invoked by the pipeline after publishing. It asks
//! the edge cache to invalidate every path and reports the outcome as a job
//! result. It holds the only edge cache handle in the system.

use crate::collaborators::{EdgeCache, InvalidationRequest};
use crate::execution::jobs::{Invocable, InvocationJob, InvokeError, JobReporter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Environment variable naming the distribution to invalidate
pub const DISTRIBUTION_ENV: &str = "CLOUDFRONT_DISTRIBUTION_ID";

/// Name the task is registered under in pipeline definitions
pub const FUNCTION_NAME: &str = "cache-invalidation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationTaskConfig {
    pub distribution_id: String,
    pub paths: Vec<String>,
}

impl InvalidationTaskConfig {
    pub fn new(distribution_id: impl Into<String>) -> Self {
        Self {
            distribution_id: distribution_id.into(),
            paths: vec!["/*".to_string()],
        }
    }

    pub fn from_env() -> Result<Self> {
        let distribution_id = std::env::var(DISTRIBUTION_ENV)
            .with_context(|| format!("{} is not set", DISTRIBUTION_ENV))?;
        Ok(Self::new(distribution_id))
    }
}

/// Observable lifecycle of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationState {
    Invoked,
    Succeeded,
    Failed,
}

#[derive(Clone)]
pub struct CacheInvalidationTask {
    config: InvalidationTaskConfig,
    edge_cache: Arc<dyn EdgeCache>,
    reporter: JobReporter,
    /// Lifecycle of every job seen, by token
    states: Arc<RwLock<HashMap<Uuid, InvalidationState>>>,
}

impl CacheInvalidationTask {
    pub fn new(
        config: InvalidationTaskConfig,
        edge_cache: Arc<dyn EdgeCache>,
        reporter: JobReporter,
    ) -> Self {
        Self {
            config,
            edge_cache,
            reporter,
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn state(&self, token: Uuid) -> Option<InvalidationState> {
        self.states.read().await.get(&token).copied()
    }

    async fn record(&self, token: Uuid, state: InvalidationState) {
        self.states.write().await.insert(token, state);
    }

    /// Perform the invalidation and report it; no retry on failure
    pub async fn handle(&self, job: InvocationJob) -> InvalidationState {
        self.record(job.token, InvalidationState::Invoked).await;
        info!(
            "Invalidating {:?} on {} for {} (job {})",
            self.config.paths, self.config.distribution_id, job.action_name, job.token
        );

        let request = InvalidationRequest {
            distribution_id: self.config.distribution_id.clone(),
            paths: self.config.paths.clone(),
            caller_reference: job.token.to_string(),
        };

        let (state, report) = match self.edge_cache.create_invalidation(request).await {
            Ok(invalidation) => {
                info!("Invalidation {} accepted", invalidation.id);
                (
                    InvalidationState::Succeeded,
                    self.reporter.put_job_success_result(job.token, None).await,
                )
            }
            Err(e) => {
                error!("Invalidation failed: {}", e);
                (
                    InvalidationState::Failed,
                    self.reporter
                        .put_job_failure_result(job.token, e.to_string())
                        .await,
                )
            }
        };

        if let Err(e) = report {
            warn!("Job result for {} was not accepted: {}", job.action_name, e);
        }
        self.record(job.token, state).await;
        state
    }
}

#[async_trait]
impl Invocable for CacheInvalidationTask {
    async fn invoke(&self, job: InvocationJob) -> Result<(), InvokeError> {
        let task = self.clone();
        tokio::spawn(async move {
            task.handle(job).await;
        });
        Ok(())
    }
}
