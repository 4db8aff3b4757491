//! Collaborator error types

use thiserror::Error;

/// Errors from the source collaborator
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connection '{0}' is not authorized for this repository")]
    Unauthorized(String),

    #[error("revision '{0}' not found")]
    RevisionNotFound(String),

    #[error("source unreachable: {0}")]
    Unreachable(String),
}

/// Errors from a build run
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build specification '{0}' not found in source")]
    MissingBuildspec(String),

    #[error("invalid build specification: {0}")]
    InvalidBuildspec(String),

    #[error("{phase} command `{command}` exited with code {}: {stderr}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    CommandFailed {
        phase: String,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("output directory '{0}' was not produced")]
    MissingOutput(String),

    #[error("compute envelope exceeded: {0}")]
    EnvelopeExceeded(String),

    #[error("build I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the publish target
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("publish I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the edge cache
#[derive(Debug, Error)]
pub enum EdgeCacheError {
    #[error("unknown distribution: {0}")]
    UnknownDistribution(String),

    #[error("invalidation rejected: {0}")]
    Rejected(String),

    #[error("edge cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}
