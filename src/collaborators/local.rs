//! Filesystem-backed publish target and edge cache

use crate::collaborators::{
    EdgeCache, EdgeCacheError, Invalidation, InvalidationRequest, PublishError, PublishTarget,
};
use crate::core::{artifact::normalize_path, Bundle};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Publishes objects as files below a root directory
#[derive(Debug, Clone)]
pub struct DirectoryPublishTarget {
    root: PathBuf,
}

impl DirectoryPublishTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, PublishError> {
        let key = normalize_path(key)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PublishError::InvalidKey(key.to_string()))?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl PublishTarget for DirectoryPublishTarget {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), PublishError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!("Publishing {} ({}, {} bytes)", key, content_type, body.len());
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, PublishError> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, PublishError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let bundle = tokio::task::spawn_blocking(move || Bundle::from_dir(&root))
            .await
            .map_err(|e| PublishError::Io(std::io::Error::other(e)))??;
        Ok(bundle.paths().into_iter().map(String::from).collect())
    }
}

/// Edge cache that appends accepted invalidations to a JSON-lines journal
#[derive(Debug)]
pub struct JournalEdgeCache {
    distribution_id: String,
    journal: PathBuf,
    lock: Mutex<()>,
}

impl JournalEdgeCache {
    pub fn new(distribution_id: impl Into<String>, journal: impl Into<PathBuf>) -> Self {
        Self {
            distribution_id: distribution_id.into(),
            journal: journal.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn entries(&self) -> Result<Vec<Invalidation>, EdgeCacheError> {
        let content = match tokio::fs::read_to_string(&self.journal).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| EdgeCacheError::Rejected(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl EdgeCache for JournalEdgeCache {
    async fn create_invalidation(
        &self,
        request: InvalidationRequest,
    ) -> Result<Invalidation, EdgeCacheError> {
        if request.distribution_id != self.distribution_id {
            return Err(EdgeCacheError::UnknownDistribution(request.distribution_id));
        }

        let _guard = self.lock.lock().await;
        if let Some(existing) = self
            .entries()
            .await?
            .into_iter()
            .find(|i| i.caller_reference == request.caller_reference)
        {
            return Ok(existing);
        }

        let invalidation = Invalidation::accepted(request);
        let mut line =
            serde_json::to_string(&invalidation).map_err(|e| EdgeCacheError::Rejected(e.to_string()))?;
        line.push('\n');

        if let Some(parent) = self.journal.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(invalidation)
    }
}
