//! Build runner that executes build specification commands with a shell

use crate::collaborators::{BuildError, BuildRequest, BuildRunner};
use crate::core::{artifact::normalize_path, buildspec::BuildSpec, Bundle};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process variables passed through to build commands
const INHERITED_VARS: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR"];

/// Longest stderr tail kept in a failure message
const STDERR_TAIL: usize = 2048;

/// Runs each phase's commands with `sh -c` inside a scratch directory
///
/// Every build gets a fresh directory holding only the source snapshot, and
/// the directory is removed afterwards. Commands see the inherited process
/// variables, the build specification's variables, and the action's
/// variables, in that order of precedence (later wins).
#[derive(Debug, Clone)]
pub struct ShellBuildRunner {
    shell: String,
    scratch_root: PathBuf,
}

impl ShellBuildRunner {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            shell: "sh".to_string(),
            scratch_root: scratch_root.into(),
        }
    }

    /// Scratch space under the system temp directory
    pub fn with_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("sitepipe-builds"))
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    async fn run_in(&self, workdir: &Path, spec: &BuildSpec, request: &BuildRequest) -> Result<Bundle, BuildError> {
        let inherited: Vec<(String, String)> = INHERITED_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect();

        for (phase, commands) in spec.phases() {
            debug!("Running {} phase ({} commands)", phase, commands.commands.len());
            for command in &commands.commands {
                let output = Command::new(&self.shell)
                    .arg("-c")
                    .arg(command)
                    .current_dir(workdir)
                    .env_clear()
                    .envs(inherited.iter().cloned())
                    .envs(&spec.env.variables)
                    .envs(&request.environment)
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .output()
                    .await?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let stderr = stderr.trim();
                    let tail = &stderr[floor_char_boundary(stderr, stderr.len().saturating_sub(STDERR_TAIL))..];
                    warn!(
                        "Build command `{}` exited with code {:?}: {}",
                        command,
                        output.status.code(),
                        tail
                    );
                    return Err(BuildError::CommandFailed {
                        phase: phase.to_string(),
                        command: command.clone(),
                        exit_code: output.status.code(),
                        stderr: tail.to_string(),
                    });
                }
            }
        }

        let base = &spec.artifacts.base_directory;
        let relative = normalize_path(base).ok_or_else(|| BuildError::MissingOutput(base.clone()))?;
        let output_dir = workdir.join(&relative);
        if !output_dir.is_dir() {
            return Err(BuildError::MissingOutput(base.clone()));
        }

        let bundle = tokio::task::spawn_blocking(move || Bundle::from_dir(&output_dir))
            .await
            .map_err(|e| BuildError::Io(std::io::Error::other(e)))??;

        if bundle.size_bytes() > request.envelope.max_output_bytes {
            return Err(BuildError::EnvelopeExceeded(format!(
                "output is {} bytes, limit is {}",
                bundle.size_bytes(),
                request.envelope.max_output_bytes
            )));
        }

        Ok(bundle)
    }
}

#[async_trait]
impl BuildRunner for ShellBuildRunner {
    async fn run(&self, request: BuildRequest) -> Result<Bundle, BuildError> {
        let raw = request
            .source
            .get(&request.buildspec)
            .ok_or_else(|| BuildError::MissingBuildspec(request.buildspec.clone()))?;
        let raw = std::str::from_utf8(raw).map_err(|e| BuildError::InvalidBuildspec(e.to_string()))?;
        let spec = BuildSpec::from_yaml(raw).map_err(|e| BuildError::InvalidBuildspec(e.to_string()))?;

        let workdir = self.scratch_root.join(format!("build-{}", Uuid::new_v4()));
        let source = request.source.clone();
        let target = workdir.clone();
        tokio::task::spawn_blocking(move || source.write_to(&target))
            .await
            .map_err(|e| BuildError::Io(std::io::Error::other(e)))??;

        info!(
            "Running build in {:?} ({} commands)",
            workdir,
            spec.command_count()
        );
        let result = self.run_in(&workdir, &spec, &request).await;

        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            warn!("Failed to remove build directory {:?}: {}", workdir, e);
        }

        result
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
