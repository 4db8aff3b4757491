//! Pipeline execution: orchestration, action executors, job results

pub mod executor;
pub mod invalidation;
pub mod jobs;
pub mod orchestrator;
pub mod scheduler;
pub mod watcher;

pub use executor::ActionExecutor;
pub use invalidation::{CacheInvalidationTask, InvalidationState, InvalidationTaskConfig};
pub use jobs::{
    FunctionRegistry, Invocable, InvocationJob, InvokeError, JobError, JobRegistry, JobReporter,
    JobResult,
};
pub use orchestrator::{
    ActionOutcome, Advance, EventHandler, ExecutionEvent, Orchestrator, OrchestratorConfig,
    OrchestratorError, RunHandle, StageResult,
};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
pub use watcher::BranchWatcher;
