//! External collaborators the orchestrator drives
//!
//! Each collaborator is a trait so the orchestrator can be exercised against
//! in-memory implementations; the local implementations back the CLI.

pub mod error;
pub mod git;
pub mod local;
pub mod memory;
pub mod shell;

use crate::core::{pipeline::ComputeEnvelope, Bundle, RepositoryRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use error::{BuildError, EdgeCacheError, PublishError, SourceError};
pub use git::GitSource;
pub use local::{DirectoryPublishTarget, JournalEdgeCache};
pub use memory::{InMemorySource, MemoryPublishTarget, RecordingEdgeCache};
pub use shell::ShellBuildRunner;

/// Version-control collaborator
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Current head revision of the repository's branch
    async fn resolve_head(
        &self,
        repository: &RepositoryRef,
        connection: &str,
    ) -> Result<String, SourceError>;

    /// Snapshot of the repository at `revision`
    async fn fetch(
        &self,
        repository: &RepositoryRef,
        connection: &str,
        revision: &str,
    ) -> Result<Bundle, SourceError>;
}

/// Everything a build needs; nothing else is visible to it
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub source: Bundle,
    /// Path of the build specification inside `source`
    pub buildspec: String,
    /// Named build-time variables
    pub environment: BTreeMap<String, String>,
    pub envelope: ComputeEnvelope,
}

/// Runs a build specification in an isolated, ephemeral environment
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Run the build and package its declared output directory
    async fn run(&self, request: BuildRequest) -> Result<Bundle, BuildError>;
}

/// Durable destination for published content
#[async_trait]
pub trait PublishTarget: Send + Sync {
    /// Create or replace the object at `key`
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), PublishError>;

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, PublishError>;

    async fn list_keys(&self) -> Result<Vec<String>, PublishError>;
}

/// A request to discard cached copies of published content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRequest {
    pub distribution_id: String,
    pub paths: Vec<String>,
    /// Unique per request; makes a repeated submission idempotent
    pub caller_reference: String,
}

/// An accepted invalidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub id: String,
    pub distribution_id: String,
    pub paths: Vec<String>,
    pub caller_reference: String,
    pub created_at: DateTime<Utc>,
}

impl Invalidation {
    pub fn accepted(request: InvalidationRequest) -> Self {
        Self {
            id: format!("I{}", uuid::Uuid::new_v4().simple()).to_uppercase(),
            distribution_id: request.distribution_id,
            paths: request.paths,
            caller_reference: request.caller_reference,
            created_at: Utc::now(),
        }
    }
}

/// Content-distribution layer in front of the publish target
#[async_trait]
pub trait EdgeCache: Send + Sync {
    async fn create_invalidation(
        &self,
        request: InvalidationRequest,
    ) -> Result<Invalidation, EdgeCacheError>;
}

/// Collaborators the action executors call
///
/// The edge cache is deliberately absent; only the invalidation task holds it.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceProvider>,
    pub builder: Arc<dyn BuildRunner>,
    pub publisher: Arc<dyn PublishTarget>,
}

/// Content type for a published path, by extension
pub fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "webmanifest" => "application/manifest+json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("index.html"), "text/html");
        assert_eq!(content_type_for("assets/app.4f2a.JS"), "text/javascript");
        assert_eq!(content_type_for("favicon.ico"), "image/x-icon");
        assert_eq!(content_type_for("LICENSE"), "application/octet-stream");
    }

    #[test]
    fn test_invalidation_ids_are_distinct() {
        let request = InvalidationRequest {
            distribution_id: "E2EXAMPLE".to_string(),
            paths: vec!["/*".to_string()],
            caller_reference: "token-1".to_string(),
        };
        let a = Invalidation::accepted(request.clone());
        let b = Invalidation::accepted(request);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with('I'));
    }
}
