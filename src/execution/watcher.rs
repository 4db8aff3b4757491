//! Branch watcher - starts a run for every new head commit

use crate::collaborators::{SourceError, SourceProvider};
use crate::core::{RepositoryRef, SourceRevision};
use crate::execution::orchestrator::{Orchestrator, RunHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct BranchWatcher {
    orchestrator: Orchestrator,
    source: Arc<dyn SourceProvider>,
    repository: RepositoryRef,
    connection: String,
    interval: Duration,
    last_seen: Option<String>,
}

impl BranchWatcher {
    pub fn new(
        orchestrator: Orchestrator,
        source: Arc<dyn SourceProvider>,
        repository: RepositoryRef,
        connection: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            source,
            repository,
            connection: connection.into(),
            interval,
            last_seen: None,
        }
    }

    /// Treat `revision` as already handled
    pub fn with_last_seen(mut self, revision: impl Into<String>) -> Self {
        self.last_seen = Some(revision.into());
        self
    }

    pub fn last_seen(&self) -> Option<&str> {
        self.last_seen.as_deref()
    }

    /// Check the branch once; start a run if the head moved
    pub async fn poll_once(&mut self) -> Result<Option<RunHandle>, SourceError> {
        let head = self
            .source
            .resolve_head(&self.repository, &self.connection)
            .await?;

        if self.last_seen.as_deref() == Some(head.as_str()) {
            debug!("{} unchanged at {}", self.repository, head);
            return Ok(None);
        }

        info!("New commit on {}: {}", self.repository, head);
        self.last_seen = Some(head.clone());
        let handle = self
            .orchestrator
            .start_run(SourceRevision::new(self.repository.clone(), head))
            .await;
        Ok(Some(handle))
    }

    /// Poll until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("Polling {} failed: {}", self.repository, e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stopped watching {}", self.repository);
                        return;
                    }
                }
            }
        }
    }
}
