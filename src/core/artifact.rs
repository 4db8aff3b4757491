//! Run-scoped artifacts and the store that holds them between stages

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Errors raised by an artifact store
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact task failed: {0}")]
    Task(String),
}

/// A tree of files keyed by relative, forward-slash path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    files: BTreeMap<String, Vec<u8>>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file; returns an error for paths that escape the bundle root
    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<(), ArtifactError> {
        let normalized =
            normalize_path(path).ok_or_else(|| ArtifactError::InvalidPath(path.to_string()))?;
        self.files.insert(normalized, contents.into());
        Ok(())
    }

    /// Builder-style insert, for fixtures with known-good paths
    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        if let Some(normalized) = normalize_path(path) {
            self.files.insert(normalized, contents.into());
        }
        self
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        normalize_path(path)
            .and_then(|p| self.files.get(&p))
            .map(|v| v.as_slice())
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.files.iter()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total size of all file contents
    pub fn size_bytes(&self) -> u64 {
        self.files.values().map(|v| v.len() as u64).sum()
    }

    /// Files below `base`, re-rooted at `base`
    ///
    /// An empty or "." base returns the whole bundle.
    pub fn subtree(&self, base: &str) -> Bundle {
        let base = match normalize_path(base) {
            Some(b) if !b.is_empty() => b,
            _ => return self.clone(),
        };
        let prefix = format!("{}/", base);

        let files = self
            .files
            .iter()
            .filter_map(|(path, contents)| {
                path.strip_prefix(&prefix)
                    .map(|rest| (rest.to_string(), contents.clone()))
            })
            .collect();

        Bundle { files }
    }

    /// Read a directory tree into a bundle
    ///
    /// `.git` directories are skipped.
    pub fn from_dir(root: &Path) -> std::io::Result<Bundle> {
        let mut bundle = Bundle::new();
        Self::collect(root, root, &mut bundle)?;
        Ok(bundle)
    }

    fn collect(root: &Path, dir: &Path, bundle: &mut Bundle) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if entry.file_name() == ".git" {
                    continue;
                }
                Self::collect(root, &path, bundle)?;
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                bundle.files.insert(key, std::fs::read(&path)?);
            }
        }
        Ok(())
    }

    /// Materialize the bundle below `root`
    pub fn write_to(&self, root: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(root)?;
        for (path, contents) in &self.files {
            let target = root.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }
        Ok(())
    }
}

/// Normalize a relative path: forward slashes, no `.` segments, no `..`
pub fn normalize_path(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

/// Opaque, run-scoped handle to a stored bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Run that owns this artifact
    pub run_id: Uuid,

    /// Artifact name as declared in the pipeline
    pub name: String,

    /// Store key
    pub key: String,

    pub size_bytes: u64,

    pub file_count: usize,

    pub created_at: DateTime<Utc>,
}

impl Artifact {
    fn new(run_id: Uuid, name: &str, bundle: &Bundle) -> Self {
        Self {
            run_id,
            name: name.to_string(),
            key: artifact_key(run_id, name),
            size_bytes: bundle.size_bytes(),
            file_count: bundle.len(),
            created_at: Utc::now(),
        }
    }
}

fn artifact_key(run_id: Uuid, name: &str) -> String {
    format!("{}/{}", run_id, name)
}

/// What happens to a run's artifacts once it reaches a terminal status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep artifacts after the run ends
    #[default]
    Retain,
    /// Delete artifacts as soon as the run ends
    PurgeOnCompletion,
}

/// Storage for inter-stage artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a bundle as the named artifact of a run
    async fn put(&self, run_id: Uuid, name: &str, bundle: &Bundle) -> Result<Artifact, ArtifactError>;

    /// Read the bundle behind an artifact handle
    async fn get(&self, artifact: &Artifact) -> Result<Bundle, ArtifactError>;

    /// Drop every artifact of a run, returning how many were removed
    async fn purge_run(&self, run_id: Uuid) -> Result<usize, ArtifactError>;
}

/// In-memory artifact store (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryArtifactStore {
    blobs: RwLock<HashMap<String, Bundle>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, run_id: Uuid, name: &str, bundle: &Bundle) -> Result<Artifact, ArtifactError> {
        let artifact = Artifact::new(run_id, name, bundle);
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(&artifact.key) {
            return Err(ArtifactError::AlreadyExists(artifact.key));
        }
        blobs.insert(artifact.key.clone(), bundle.clone());
        Ok(artifact)
    }

    async fn get(&self, artifact: &Artifact) -> Result<Bundle, ArtifactError> {
        self.blobs
            .read()
            .await
            .get(&artifact.key)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(artifact.key.clone()))
    }

    async fn purge_run(&self, run_id: Uuid) -> Result<usize, ArtifactError> {
        let prefix = format!("{}/", run_id);
        let mut blobs = self.blobs.write().await;
        let before = blobs.len();
        blobs.retain(|key, _| !key.starts_with(&prefix));
        Ok(before - blobs.len())
    }
}

/// Artifact store backed by a local directory: `<root>/<run_id>/<name>/...`
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create store under the platform data directory
    pub fn with_default_path() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(data_dir.join("sitepipe").join("artifacts"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, run_id: Uuid, name: &str, bundle: &Bundle) -> Result<Artifact, ArtifactError> {
        let artifact = Artifact::new(run_id, name, bundle);
        let dir = self.root.join(run_id.to_string()).join(name);
        if tokio::fs::try_exists(&dir).await? {
            return Err(ArtifactError::AlreadyExists(artifact.key));
        }

        debug!(key = %artifact.key, files = bundle.len(), "writing artifact");
        let bundle = bundle.clone();
        tokio::task::spawn_blocking(move || bundle.write_to(&dir))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;

        Ok(artifact)
    }

    async fn get(&self, artifact: &Artifact) -> Result<Bundle, ArtifactError> {
        let dir = self
            .root
            .join(artifact.run_id.to_string())
            .join(&artifact.name);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(ArtifactError::NotFound(artifact.key.clone()));
        }

        let bundle = tokio::task::spawn_blocking(move || Bundle::from_dir(&dir))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;
        Ok(bundle)
    }

    async fn purge_run(&self, run_id: Uuid) -> Result<usize, ArtifactError> {
        let dir = self.root.join(run_id.to_string());
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(0);
        }

        let mut count = 0;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./dist/index.html"), Some("dist/index.html".to_string()));
        assert_eq!(normalize_path("/assets//app.js"), Some("assets/app.js".to_string()));
        assert_eq!(normalize_path("a\\b.txt"), Some("a/b.txt".to_string()));
        assert_eq!(normalize_path("../etc/passwd"), None);
    }

    #[test]
    fn test_bundle_rejects_escaping_paths() {
        let mut bundle = Bundle::new();
        assert!(bundle.insert("../outside", "x").is_err());
        assert!(bundle.insert("inside/file", "x").is_ok());
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn test_subtree_reroots_files() {
        let bundle = Bundle::new()
            .with_file("package.json", "{}")
            .with_file("dist/index.html", "<html>")
            .with_file("dist/assets/app.js", "js");

        let dist = bundle.subtree("dist");
        assert_eq!(dist.paths(), vec!["assets/app.js", "index.html"]);
        assert_eq!(dist.get("index.html"), Some("<html>".as_bytes()));

        assert_eq!(bundle.subtree(".").len(), 3);
    }

    #[test]
    fn test_bundle_dir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::new()
            .with_file("index.html", "<html>")
            .with_file("assets/app.js", "console.log(1)");

        bundle.write_to(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();

        let loaded = Bundle::from_dir(dir.path()).unwrap();
        assert_eq!(loaded, bundle);
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip_and_purge() {
        let store = InMemoryArtifactStore::new();
        let run_id = Uuid::new_v4();
        let bundle = Bundle::new().with_file("index.html", "<html>");

        let artifact = store.put(run_id, "build_output", &bundle).await.unwrap();
        assert_eq!(artifact.file_count, 1);
        assert_eq!(store.get(&artifact).await.unwrap(), bundle);

        // Exactly one producer per artifact
        assert!(matches!(
            store.put(run_id, "build_output", &bundle).await,
            Err(ArtifactError::AlreadyExists(_))
        ));

        assert_eq!(store.purge_run(run_id).await.unwrap(), 1);
        assert!(matches!(store.get(&artifact).await, Err(ArtifactError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_store_round_trip_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let bundle = Bundle::new()
            .with_file("Buildspec.yml", "version: 0.2")
            .with_file("src/main.tsx", "render()");

        let artifact = store.put(run_id, "source_output", &bundle).await.unwrap();
        assert_eq!(store.get(&artifact).await.unwrap(), bundle);

        assert_eq!(store.purge_run(run_id).await.unwrap(), 1);
        assert!(store.get(&artifact).await.is_err());
    }
}
