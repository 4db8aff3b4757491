//! Job results reported by invoked functions
//!
//! An invoke action registers a job token before calling its function and
//! then waits on a oneshot channel keyed by that token. The function reports
//! through a [`JobReporter`]. A token is consumed by the first report, or
//! expired when the waiting side times out; either way any later report is
//! rejected with [`JobError::UnknownJob`].

use crate::core::{ActionError, Bundle};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Result reported for an invocation job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success { output: Option<Bundle> },
    Failure { reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    /// Token was never issued, already reported, or expired
    #[error("unknown job: {0}")]
    UnknownJob(Uuid),
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("invocation rejected: {0}")]
    Rejected(String),
}

/// Payload handed to an invoked function
#[derive(Debug, Clone)]
pub struct InvocationJob {
    pub token: Uuid,
    pub run_id: Uuid,
    pub action_name: String,
    pub user_parameters: BTreeMap<String, String>,
    /// Input artifacts by name
    pub inputs: BTreeMap<String, Bundle>,
}

/// A function the pipeline can invoke
///
/// `invoke` only accepts the job; the outcome arrives later through the
/// function's [`JobReporter`].
#[async_trait]
pub trait Invocable: Send + Sync {
    async fn invoke(&self, job: InvocationJob) -> Result<(), InvokeError>;
}

/// Invocable functions by name
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Invocable>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn Invocable>) {
        self.functions.insert(name.into(), function);
    }

    pub fn with(mut self, name: impl Into<String>, function: Arc<dyn Invocable>) -> Self {
        self.register(name, function);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Invocable>, InvokeError> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| InvokeError::FunctionNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<JobResult>>>>;

/// Awaiting side of job results
#[derive(Clone, Default)]
pub struct JobRegistry {
    pending: PendingMap,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token and the handle that waits for its result
    pub async fn register(&self) -> PendingJob {
        let token = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(token, sender);
        debug!("Registered job {}", token);
        PendingJob {
            token,
            receiver,
            pending: self.pending.clone(),
        }
    }

    /// Reporting side, handed to invocable functions
    pub fn reporter(&self) -> JobReporter {
        JobReporter {
            pending: self.pending.clone(),
        }
    }

    /// Number of tokens still awaiting a result
    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// A registered job awaiting its result
pub struct PendingJob {
    token: Uuid,
    receiver: oneshot::Receiver<JobResult>,
    pending: PendingMap,
}

impl PendingJob {
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Wait for the job result, expiring the token after `timeout`
    pub async fn wait(self, timeout: Duration) -> Result<JobResult, ActionError> {
        let PendingJob {
            token,
            mut receiver,
            pending,
        } = self;

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ActionError::execution(format!(
                "job {} was dropped without a result",
                token
            ))),
            Err(_) => {
                let mut pending = pending.lock().await;
                if pending.remove(&token).is_none() {
                    // A reporter claimed the token before the lock; its result wins
                    if let Ok(result) = receiver.try_recv() {
                        return Ok(result);
                    }
                }
                warn!("Job {} expired after {:?}", token, timeout);
                Err(ActionError::Timeout(timeout))
            }
        }
    }

    /// Withdraw the token without waiting
    pub async fn expire(self) {
        self.pending.lock().await.remove(&self.token);
    }
}

/// Reporting side of job results
#[derive(Clone)]
pub struct JobReporter {
    pending: PendingMap,
}

impl JobReporter {
    pub async fn put_job_success_result(
        &self,
        token: Uuid,
        output: Option<Bundle>,
    ) -> Result<(), JobError> {
        self.report(token, JobResult::Success { output }).await
    }

    pub async fn put_job_failure_result(
        &self,
        token: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), JobError> {
        self.report(
            token,
            JobResult::Failure {
                reason: reason.into(),
            },
        )
        .await
    }

    /// Claims the token and delivers under one lock, so an expiring waiter
    /// sees either the token or the result
    async fn report(&self, token: Uuid, result: JobResult) -> Result<(), JobError> {
        let mut pending = self.pending.lock().await;
        let sender = pending.remove(&token).ok_or(JobError::UnknownJob(token))?;
        sender.send(result).map_err(|_| JobError::UnknownJob(token))
    }
}
