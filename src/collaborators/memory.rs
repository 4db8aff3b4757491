//! In-memory collaborators for tests and dry runs

use crate::collaborators::{
    EdgeCache, EdgeCacheError, Invalidation, InvalidationRequest, PublishError, PublishTarget,
    SourceError, SourceProvider,
};
use crate::core::{artifact::normalize_path, Bundle, RepositoryRef};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Repository {
    /// Branch name to head revision
    heads: HashMap<String, String>,
    commits: HashMap<String, Bundle>,
}

/// Source provider holding repositories in memory
#[derive(Debug, Default)]
pub struct InMemorySource {
    repositories: RwLock<HashMap<(String, String), Repository>>,
    authorized: RwLock<HashSet<String>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `connection` to read every repository
    pub async fn authorize(&self, connection: impl Into<String>) {
        self.authorized.write().await.insert(connection.into());
    }

    /// Record a commit and move the branch head to it
    pub async fn push_commit(
        &self,
        repository: &RepositoryRef,
        revision: impl Into<String>,
        snapshot: Bundle,
    ) {
        let revision = revision.into();
        let mut repositories = self.repositories.write().await;
        let repo = repositories
            .entry((repository.owner.clone(), repository.name.clone()))
            .or_default();
        repo.commits.insert(revision.clone(), snapshot);
        repo.heads.insert(repository.branch.clone(), revision);
    }

    async fn check_connection(&self, connection: &str) -> Result<(), SourceError> {
        if self.authorized.read().await.contains(connection) {
            Ok(())
        } else {
            Err(SourceError::Unauthorized(connection.to_string()))
        }
    }
}

#[async_trait]
impl SourceProvider for InMemorySource {
    async fn resolve_head(
        &self,
        repository: &RepositoryRef,
        connection: &str,
    ) -> Result<String, SourceError> {
        self.check_connection(connection).await?;
        let repositories = self.repositories.read().await;
        let repo = repositories
            .get(&(repository.owner.clone(), repository.name.clone()))
            .ok_or_else(|| SourceError::Unreachable(repository.to_string()))?;
        repo.heads
            .get(&repository.branch)
            .cloned()
            .ok_or_else(|| SourceError::RevisionNotFound(repository.branch.clone()))
    }

    async fn fetch(
        &self,
        repository: &RepositoryRef,
        connection: &str,
        revision: &str,
    ) -> Result<Bundle, SourceError> {
        self.check_connection(connection).await?;
        let repositories = self.repositories.read().await;
        let repo = repositories
            .get(&(repository.owner.clone(), repository.name.clone()))
            .ok_or_else(|| SourceError::Unreachable(repository.to_string()))?;
        repo.commits
            .get(revision)
            .cloned()
            .ok_or_else(|| SourceError::RevisionNotFound(revision.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Publish target backed by a map
#[derive(Debug, Default)]
pub struct MemoryPublishTarget {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    writes: RwLock<usize>,
}

impl MemoryPublishTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    /// Current key to body mapping
    pub async fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.objects
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.body.clone()))
            .collect()
    }

    /// Total number of writes accepted, including overwrites
    pub async fn write_count(&self) -> usize {
        *self.writes.read().await
    }
}

#[async_trait]
impl PublishTarget for MemoryPublishTarget {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), PublishError> {
        let key = normalize_path(key)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PublishError::InvalidKey(key.to_string()))?;
        self.objects.write().await.insert(
            key,
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        *self.writes.write().await += 1;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, PublishError> {
        Ok(self.objects.read().await.get(key).map(|o| o.body.clone()))
    }

    async fn list_keys(&self) -> Result<Vec<String>, PublishError> {
        Ok(self.objects.read().await.keys().cloned().collect())
    }
}

/// Edge cache that records every accepted invalidation
#[derive(Debug)]
pub struct RecordingEdgeCache {
    distribution_id: String,
    failure: Option<String>,
    delay: Option<Duration>,
    accepted: RwLock<Vec<Invalidation>>,
}

impl RecordingEdgeCache {
    pub fn new(distribution_id: impl Into<String>) -> Self {
        Self {
            distribution_id: distribution_id.into(),
            failure: None,
            delay: None,
            accepted: RwLock::new(Vec::new()),
        }
    }

    /// Reject every request with `reason`
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Wait before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn invalidations(&self) -> Vec<Invalidation> {
        self.accepted.read().await.clone()
    }
}

#[async_trait]
impl EdgeCache for RecordingEdgeCache {
    async fn create_invalidation(
        &self,
        request: InvalidationRequest,
    ) -> Result<Invalidation, EdgeCacheError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if request.distribution_id != self.distribution_id {
            return Err(EdgeCacheError::UnknownDistribution(request.distribution_id));
        }
        if let Some(reason) = &self.failure {
            return Err(EdgeCacheError::Rejected(reason.clone()));
        }

        let mut accepted = self.accepted.write().await;
        // Same caller reference returns the original invalidation
        if let Some(existing) = accepted
            .iter()
            .find(|i| i.caller_reference == request.caller_reference)
        {
            return Ok(existing.clone());
        }
        let invalidation = Invalidation::accepted(request);
        accepted.push(invalidation.clone());
        Ok(invalidation)
    }
}
