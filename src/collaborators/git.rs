//! Source provider backed by local git repositories
//!
//! Repositories live at `<root>/<owner>/<name>`; each fetch clones the
//! repository into a scratch directory and checks out the exact revision.

use crate::collaborators::{SourceError, SourceProvider};
use crate::core::{Bundle, RepositoryRef};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GitSource {
    root: PathBuf,
    scratch_root: PathBuf,
    /// Connection handles allowed to read repositories
    connections: HashSet<String>,
    git: String,
}

impl GitSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch_root: std::env::temp_dir().join("sitepipe-sources"),
            connections: HashSet::new(),
            git: "git".to_string(),
        }
    }

    pub fn authorize(mut self, connection: impl Into<String>) -> Self {
        self.connections.insert(connection.into());
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    fn repository_path(&self, repository: &RepositoryRef) -> Result<PathBuf, SourceError> {
        let path = self.root.join(&repository.owner).join(&repository.name);
        if path.exists() {
            Ok(path)
        } else {
            Err(SourceError::Unreachable(format!(
                "{} not found under {:?}",
                repository, self.root
            )))
        }
    }

    fn check_connection(&self, connection: &str) -> Result<(), SourceError> {
        if self.connections.contains(connection) {
            Ok(())
        } else {
            Err(SourceError::Unauthorized(connection.to_string()))
        }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<Output, SourceError> {
        debug!("git {}", args.join(" "));
        Command::new(&self.git)
            .args(args)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SourceError::Unreachable(format!("failed to run git: {}", e)))
    }

    async fn checkout(&self, origin: &Path, workdir: &Path, revision: &str) -> Result<Bundle, SourceError> {
        let origin = origin.to_string_lossy().into_owned();
        let target = workdir.to_string_lossy().into_owned();
        let clone = self
            .git(&self.scratch_root, &["clone", "--quiet", "--no-checkout", &origin, &target])
            .await?;
        if !clone.status.success() {
            return Err(SourceError::Unreachable(
                String::from_utf8_lossy(&clone.stderr).trim().to_string(),
            ));
        }

        let checkout = self
            .git(workdir, &["checkout", "--quiet", "--detach", revision])
            .await?;
        if !checkout.status.success() {
            return Err(SourceError::RevisionNotFound(revision.to_string()));
        }

        let snapshot_dir = workdir.to_path_buf();
        tokio::task::spawn_blocking(move || Bundle::from_dir(&snapshot_dir))
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?
            .map_err(|e| SourceError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn resolve_head(
        &self,
        repository: &RepositoryRef,
        connection: &str,
    ) -> Result<String, SourceError> {
        self.check_connection(connection)?;
        let path = self.repository_path(repository)?;
        let reference = format!("refs/heads/{}^{{commit}}", repository.branch);

        let output = self.git(&path, &["rev-parse", "--verify", "--quiet", &reference]).await?;
        if !output.status.success() {
            return Err(SourceError::RevisionNotFound(repository.branch.clone()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn fetch(
        &self,
        repository: &RepositoryRef,
        connection: &str,
        revision: &str,
    ) -> Result<Bundle, SourceError> {
        self.check_connection(connection)?;
        let origin = tokio::fs::canonicalize(self.repository_path(repository)?)
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        tokio::fs::create_dir_all(&self.scratch_root)
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;
        let workdir = self.scratch_root.join(format!("source-{}", Uuid::new_v4()));

        let result = self.checkout(&origin, &workdir, revision).await;

        if workdir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
                warn!("Failed to remove source checkout {:?}: {}", workdir, e);
            }
        }
        result
    }
}
