//! sitepipe - continuous delivery for static sites

pub mod cli;
pub mod collaborators;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use collaborators::{BuildRunner, Collaborators, EdgeCache, PublishTarget, SourceProvider};
pub use core::{PipelineDefinition, PipelineRun, RunStatus, SourceRevision};
pub use execution::{ExecutionEvent, Orchestrator, OrchestratorConfig, RunHandle, SchedulingStrategy};
