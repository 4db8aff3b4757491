//! Pipeline orchestrator - owns runs of one pipeline definition
//!
//! Every run is driven by its own task, one stage at a time. Starting a run
//! supersedes the in-progress one under the ledger lock, so at most one run
//! per definition is ever in progress. A superseded driver stops waiting on
//! its stage; actions already spawned finish on their own and nothing they
//! did is undone, except that their stored outputs are purged when the
//! retention policy asks for it.

use crate::{
    collaborators::Collaborators,
    core::{
        artifact::{ArtifactStore, RetentionPolicy},
        config::{PipelineConfig, DEFAULT_INVOKE_TIMEOUT_SECS},
        ActionError, ActionState, Artifact, FailureKind, PipelineDefinition, PipelineRun,
        RunFailure, RunStatus, SourceRevision, StageStatus,
    },
    execution::{
        executor::ActionExecutor,
        jobs::{FunctionRegistry, JobRegistry},
        scheduler::{ExecutionScheduler, SchedulingStrategy},
    },
    persistence::{RunStore, RunSummary},
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline runs
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        revision: String,
    },
    RunSuperseded {
        run_id: Uuid,
        superseded_by: Uuid,
    },
    StageStarted {
        run_id: Uuid,
        stage: String,
    },
    ActionStarted {
        run_id: Uuid,
        stage: String,
        action: String,
    },
    ActionSucceeded {
        run_id: Uuid,
        stage: String,
        action: String,
        output: Option<String>,
    },
    ActionFailed {
        run_id: Uuid,
        stage: String,
        action: String,
        kind: FailureKind,
        error: String,
    },
    StageCompleted {
        run_id: Uuid,
        stage: String,
        succeeded: bool,
    },
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("pipeline definition has no stages")]
    EmptyDefinition,

    #[error("unknown run: {0}")]
    UnknownRun(Uuid),

    #[error("run {run_id} is at stage {current}, not {reported}")]
    StageMismatch {
        run_id: Uuid,
        current: usize,
        reported: usize,
    },

    #[error("stage {stage} of run {run_id} has actions without an outcome")]
    IncompleteStage { run_id: Uuid, stage: String },

    #[error("run {0} is not ready to complete")]
    NotComplete(Uuid),
}

/// Orchestrator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub scheduling: SchedulingStrategy,
    pub retention: RetentionPolicy,
    /// Timeout for invoke actions that do not set their own
    pub default_invoke_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduling: SchedulingStrategy::default(),
            retention: RetentionPolicy::default(),
            default_invoke_timeout: Duration::from_secs(DEFAULT_INVOKE_TIMEOUT_SECS),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            scheduling: SchedulingStrategy::from_concurrency(config.action_concurrency),
            retention: config.artifact_retention,
            default_invoke_timeout: Duration::from_secs(
                config.default_timeout_secs.unwrap_or(DEFAULT_INVOKE_TIMEOUT_SECS),
            ),
        }
    }
}

/// Terminal outcome of one action
#[derive(Debug)]
pub struct ActionOutcome {
    pub action: String,
    pub result: Result<Option<Artifact>, ActionError>,
}

/// Outcomes of every action that ran in a stage
#[derive(Debug)]
pub struct StageResult {
    pub stage: usize,
    pub outcomes: Vec<ActionOutcome>,
}

/// What happens after a stage result is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Continue with the stage at this index
    Next(usize),
    /// Final stage succeeded; the run can be completed
    Completed,
    Failed(RunFailure),
    /// Run is no longer in progress; the result was discarded
    Stopped,
}

/// Handle to a started run
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: Uuid,
    status: watch::Receiver<RunStatus>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Wait until the run reaches a terminal status
    pub async fn wait(&mut self) -> RunStatus {
        loop {
            let status = *self.status.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }
}

/// Finished runs kept in memory; older ones are only in the run store
const MAX_RETAINED_RUNS: usize = 100;

#[derive(Default)]
struct Ledger {
    runs: HashMap<Uuid, PipelineRun>,
    /// Run ids in start order
    order: Vec<Uuid>,
    active: Option<Uuid>,
    signals: HashMap<Uuid, watch::Sender<RunStatus>>,
}

impl Ledger {
    fn finish(&mut self, run_id: Uuid, status: RunStatus) {
        if self.active == Some(run_id) {
            self.active = None;
        }
        if let Some(signal) = self.signals.remove(&run_id) {
            signal.send_replace(status);
        }
    }

    /// Drop the oldest finished runs beyond the retention cap
    fn prune(&mut self) {
        while self.order.len() > MAX_RETAINED_RUNS {
            let oldest = self
                .order
                .iter()
                .position(|id| self.runs.get(id).map_or(true, |run| !run.is_active()));
            let Some(position) = oldest else {
                break;
            };
            let run_id = self.order.remove(position);
            self.runs.remove(&run_id);
        }
    }
}

struct Inner {
    definition: PipelineDefinition,
    executor: Arc<ActionExecutor>,
    scheduler: ExecutionScheduler,
    config: OrchestratorConfig,
    artifacts: Arc<dyn ArtifactStore>,
    store: Arc<dyn RunStore>,
    ledger: Mutex<Ledger>,
    event_handlers: Mutex<Vec<EventHandler>>,
}

/// Pipeline orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        definition: PipelineDefinition,
        collaborators: Collaborators,
        functions: FunctionRegistry,
        jobs: JobRegistry,
        artifacts: Arc<dyn ArtifactStore>,
        store: Arc<dyn RunStore>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        if definition.is_empty() {
            return Err(OrchestratorError::EmptyDefinition);
        }

        let executor = ActionExecutor::new(
            collaborators,
            artifacts.clone(),
            functions,
            jobs,
            config.default_invoke_timeout,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                definition,
                executor: Arc::new(executor),
                scheduler: ExecutionScheduler::new(config.scheduling),
                config,
                artifacts,
                store,
                ledger: Mutex::new(Ledger::default()),
                event_handlers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.inner.definition
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.inner.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.inner.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    async fn persist(&self, summary: RunSummary) {
        if let Err(e) = self.inner.store.save_run(&summary).await {
            warn!("Failed to save run {}: {:#}", summary.run_id, e);
        }
    }

    async fn release_artifacts(&self, run_id: Uuid) {
        if self.inner.config.retention != RetentionPolicy::PurgeOnCompletion {
            return;
        }
        match self.inner.artifacts.purge_run(run_id).await {
            Ok(count) => debug!("Purged {} artifacts of run {}", count, run_id),
            Err(e) => warn!("Failed to purge artifacts of run {}: {}", run_id, e),
        }
    }

    /// Purge again for a run that stopped while one of its actions ran
    async fn release_if_stopped(&self, run_id: Uuid) {
        if self.inner.config.retention != RetentionPolicy::PurgeOnCompletion {
            return;
        }
        let stopped = {
            let ledger = self.inner.ledger.lock().await;
            ledger.runs.get(&run_id).map_or(true, |run| !run.is_active())
        };
        if stopped {
            self.release_artifacts(run_id).await;
        }
    }

    /// Start a run for `trigger`, superseding the in-progress run if any
    pub async fn start_run(&self, trigger: SourceRevision) -> RunHandle {
        let run = PipelineRun::new(&self.inner.definition, trigger);
        let run_id = run.run_id;
        let revision = run.trigger.revision.clone();
        let (signal, status) = watch::channel(RunStatus::InProgress);

        let (superseded, summaries) = {
            let mut ledger = self.inner.ledger.lock().await;
            let mut summaries = Vec::new();

            let superseded = match ledger.active.take() {
                Some(previous) => match ledger.runs.get_mut(&previous) {
                    Some(prev) if prev.is_active() => {
                        prev.supersede(run_id);
                        summaries.push(RunSummary::from_run(prev));
                        ledger.finish(previous, RunStatus::Superseded);
                        Some(previous)
                    }
                    _ => None,
                },
                None => None,
            };

            summaries.push(RunSummary::from_run(&run));
            ledger.runs.insert(run_id, run);
            ledger.order.push(run_id);
            ledger.active = Some(run_id);
            ledger.signals.insert(run_id, signal);
            ledger.prune();

            (superseded, summaries)
        };

        for summary in summaries {
            self.persist(summary).await;
        }

        if let Some(previous) = superseded {
            info!("Run {} superseded by {}", previous, run_id);
            self.emit_event(ExecutionEvent::RunSuperseded {
                run_id: previous,
                superseded_by: run_id,
            })
            .await;
            self.emit_event(ExecutionEvent::RunCompleted {
                run_id: previous,
                status: RunStatus::Superseded,
            })
            .await;
            self.release_artifacts(previous).await;
        }

        info!(
            "Starting run {} of {} at {}",
            run_id, self.inner.definition.name, revision
        );
        self.emit_event(ExecutionEvent::RunStarted {
            run_id,
            pipeline_name: self.inner.definition.name.clone(),
            revision,
        })
        .await;

        let driver = self.clone();
        let watch = status.clone();
        tokio::spawn(async move {
            driver.drive(run_id, watch).await;
        });

        RunHandle { run_id, status }
    }

    /// Drive a run stage by stage until it stops
    async fn drive(self, run_id: Uuid, mut signal: watch::Receiver<RunStatus>) {
        let mut stage = 0;
        loop {
            if !self.begin_stage(run_id, stage).await {
                return;
            }

            let result = tokio::select! {
                result = self.run_stage(run_id, stage) => result,
                _ = stopped(&mut signal) => {
                    info!("Run {} stopped during stage {}", run_id, stage);
                    return;
                }
            };

            match self.advance_stage(run_id, result).await {
                Ok(Advance::Next(next)) => stage = next,
                Ok(Advance::Completed) => {
                    if let Err(e) = self.complete_run(run_id).await {
                        debug!("Run {} not completed: {}", run_id, e);
                    }
                    return;
                }
                Ok(Advance::Failed(_)) | Ok(Advance::Stopped) => return,
                Err(e) => {
                    error!("Run {} could not advance: {}", run_id, e);
                    return;
                }
            }
        }
    }

    /// Mark a stage in progress; false if the run is no longer active
    async fn begin_stage(&self, run_id: Uuid, index: usize) -> bool {
        let stage_name = {
            let mut ledger = self.inner.ledger.lock().await;
            let Some(run) = ledger.runs.get_mut(&run_id) else {
                return false;
            };
            if !run.is_active() {
                return false;
            }
            let Some(stage) = run.stages.get_mut(index) else {
                return false;
            };
            stage.status = StageStatus::InProgress;
            stage.started_at = Some(Utc::now());
            let name = stage.name.clone();
            run.current_stage = index;
            run.touch();
            name
        };

        info!("Run {}: starting stage {}", run_id, stage_name);
        self.emit_event(ExecutionEvent::StageStarted {
            run_id,
            stage: stage_name,
        })
        .await;
        true
    }

    /// Run every wave of a stage; later waves are skipped after a failure
    async fn run_stage(&self, run_id: Uuid, index: usize) -> StageResult {
        let stage = &self.inner.definition.stages[index];
        let (trigger, mut available) = {
            let ledger = self.inner.ledger.lock().await;
            match ledger.runs.get(&run_id) {
                Some(run) => (run.trigger.clone(), run.bindings.clone()),
                None => {
                    return StageResult {
                        stage: index,
                        outcomes: Vec::new(),
                    }
                }
            }
        };

        let mut outcomes = Vec::new();
        for batch in self.inner.scheduler.batches(stage) {
            let mut tasks = Vec::with_capacity(batch.len());
            for &action_index in &batch {
                let action = stage.actions[action_index].clone();
                self.record_action(run_id, index, &action.name, ActionState::Running {
                    started_at: Utc::now(),
                })
                .await;
                self.emit_event(ExecutionEvent::ActionStarted {
                    run_id,
                    stage: stage.name.clone(),
                    action: action.name.clone(),
                })
                .await;

                let orchestrator = self.clone();
                let trigger = trigger.clone();
                let inputs = available.clone();
                tasks.push(tokio::spawn(async move {
                    let result = orchestrator
                        .inner
                        .executor
                        .execute(&action, run_id, &trigger, &inputs)
                        .await;
                    // The run may have been stopped while the action was storing
                    orchestrator.release_if_stopped(run_id).await;
                    (action.name, result)
                }));
            }

            let mut failed = false;
            for (joined, &action_index) in join_all(tasks).await.into_iter().zip(&batch) {
                let (action, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => (
                        stage.actions[action_index].name.clone(),
                        Err(ActionError::execution(format!("action task aborted: {}", e))),
                    ),
                };
                self.finish_action(run_id, index, &action, &result).await;
                match &result {
                    Ok(Some(artifact)) => {
                        available.insert(artifact.name.clone(), artifact.clone());
                    }
                    Ok(None) => {}
                    Err(_) => failed = true,
                }
                outcomes.push(ActionOutcome { action, result });
            }

            if failed {
                break;
            }
        }

        StageResult {
            stage: index,
            outcomes,
        }
    }

    async fn record_action(&self, run_id: Uuid, stage: usize, action: &str, state: ActionState) {
        let mut ledger = self.inner.ledger.lock().await;
        if let Some(run) = ledger.runs.get_mut(&run_id) {
            // Superseded runs keep the state they were abandoned in
            if !run.is_active() {
                return;
            }
            if let Some(record) = run.stages.get_mut(stage).and_then(|s| s.action_mut(action)) {
                record.state = state;
            }
            run.touch();
        }
    }

    async fn finish_action(
        &self,
        run_id: Uuid,
        stage: usize,
        action: &str,
        result: &Result<Option<Artifact>, ActionError>,
    ) {
        let started_at = {
            let ledger = self.inner.ledger.lock().await;
            ledger
                .runs
                .get(&run_id)
                .and_then(|run| run.stages.get(stage))
                .and_then(|s| s.action(action))
                .and_then(|a| match a.state {
                    ActionState::Running { started_at } => Some(started_at),
                    _ => None,
                })
                .unwrap_or_else(Utc::now)
        };
        let stage_name = self.inner.definition.stages[stage].name.clone();

        let (state, event) = match result {
            Ok(output) => {
                let output = output.as_ref().map(|a| a.name.clone());
                info!("Action {}/{} succeeded", stage_name, action);
                (
                    ActionState::Succeeded {
                        output: output.clone(),
                        started_at,
                        completed_at: Utc::now(),
                    },
                    ExecutionEvent::ActionSucceeded {
                        run_id,
                        stage: stage_name,
                        action: action.to_string(),
                        output,
                    },
                )
            }
            Err(e) => {
                warn!("Action {}/{} failed: {}", stage_name, action, e);
                (
                    ActionState::Failed {
                        kind: e.kind(),
                        error: e.to_string(),
                        started_at,
                        failed_at: Utc::now(),
                    },
                    ExecutionEvent::ActionFailed {
                        run_id,
                        stage: stage_name,
                        action: action.to_string(),
                        kind: e.kind(),
                        error: e.to_string(),
                    },
                )
            }
        };

        self.record_action(run_id, stage, action, state).await;
        self.emit_event(event).await;
    }

    /// Apply a stage's outcomes to the run
    ///
    /// The first failed action fails the run. Otherwise the stage's outputs
    /// become run bindings and the run moves to the next stage, provided
    /// every input that stage needs from earlier stages is bound. Results for
    /// runs that are no longer in progress are discarded.
    pub async fn advance_stage(
        &self,
        run_id: Uuid,
        result: StageResult,
    ) -> Result<Advance, OrchestratorError> {
        let definition = &self.inner.definition;
        let mut events = Vec::new();

        let (advance, summary) = {
            let mut ledger = self.inner.ledger.lock().await;
            let run = ledger
                .runs
                .get_mut(&run_id)
                .ok_or(OrchestratorError::UnknownRun(run_id))?;

            if !run.is_active() {
                debug!("Discarding stage result for {} run {}", run.status, run_id);
                return Ok(Advance::Stopped);
            }
            if result.stage != run.current_stage {
                return Err(OrchestratorError::StageMismatch {
                    run_id,
                    current: run.current_stage,
                    reported: result.stage,
                });
            }

            let index = result.stage;
            let stage_name = definition.stages[index].name.clone();
            let failure = result.outcomes.iter().find_map(|o| match &o.result {
                Err(e) => Some(RunFailure {
                    stage: stage_name.clone(),
                    action: Some(o.action.clone()),
                    kind: e.kind(),
                    reason: e.to_string(),
                }),
                Ok(_) => None,
            });

            let advance = if let Some(failure) = failure {
                run.stages[index].status = StageStatus::Failed;
                run.stages[index].completed_at = Some(Utc::now());
                error!("Run {} failed: {}", run_id, failure);
                run.fail(failure.clone());
                events.push(ExecutionEvent::StageCompleted {
                    run_id,
                    stage: stage_name,
                    succeeded: false,
                });
                events.push(ExecutionEvent::RunCompleted {
                    run_id,
                    status: RunStatus::Failed,
                });
                Advance::Failed(failure)
            } else {
                let unfinished = definition.stages[index]
                    .actions
                    .iter()
                    .any(|a| !result.outcomes.iter().any(|o| o.action == a.name));
                if unfinished {
                    return Err(OrchestratorError::IncompleteStage {
                        run_id,
                        stage: stage_name,
                    });
                }

                for outcome in &result.outcomes {
                    if let Ok(Some(artifact)) = &outcome.result {
                        run.bindings.insert(artifact.name.clone(), artifact.clone());
                    }
                }
                run.stages[index].status = StageStatus::Succeeded;
                run.stages[index].completed_at = Some(Utc::now());
                run.touch();
                info!("Run {}: stage {} succeeded", run_id, stage_name);
                events.push(ExecutionEvent::StageCompleted {
                    run_id,
                    stage: stage_name,
                    succeeded: true,
                });

                match definition.stage(index + 1) {
                    None => Advance::Completed,
                    Some(next) => {
                        let missing = next
                            .external_inputs()
                            .into_iter()
                            .find(|input| !run.bindings.contains_key(*input))
                            .map(String::from);

                        match missing {
                            Some(artifact) => {
                                let error = ActionError::Binding { artifact };
                                let failure = RunFailure {
                                    stage: next.name.clone(),
                                    action: None,
                                    kind: error.kind(),
                                    reason: error.to_string(),
                                };
                                error!("Run {} failed: {}", run_id, failure);
                                run.current_stage = index + 1;
                                run.stages[index + 1].status = StageStatus::Failed;
                                run.fail(failure.clone());
                                events.push(ExecutionEvent::RunCompleted {
                                    run_id,
                                    status: RunStatus::Failed,
                                });
                                Advance::Failed(failure)
                            }
                            None => {
                                run.current_stage = index + 1;
                                Advance::Next(index + 1)
                            }
                        }
                    }
                }
            };

            let summary = RunSummary::from_run(run);
            if matches!(advance, Advance::Failed(_)) {
                ledger.finish(run_id, RunStatus::Failed);
            }
            (advance, summary)
        };

        self.persist(summary).await;
        for event in events {
            self.emit_event(event).await;
        }
        if matches!(advance, Advance::Failed(_)) {
            self.release_artifacts(run_id).await;
        }
        Ok(advance)
    }

    /// Mark a run whose final stage succeeded as Succeeded
    pub async fn complete_run(&self, run_id: Uuid) -> Result<(), OrchestratorError> {
        let summary = {
            let mut ledger = self.inner.ledger.lock().await;
            let run = ledger
                .runs
                .get_mut(&run_id)
                .ok_or(OrchestratorError::UnknownRun(run_id))?;

            let final_stage_done = run
                .stages
                .last()
                .is_some_and(|s| s.status == StageStatus::Succeeded);
            if !run.is_active() || !final_stage_done {
                return Err(OrchestratorError::NotComplete(run_id));
            }

            run.succeed();
            let summary = RunSummary::from_run(run);
            ledger.finish(run_id, RunStatus::Succeeded);
            summary
        };

        info!("Run {} succeeded", run_id);
        self.persist(summary).await;
        self.emit_event(ExecutionEvent::RunCompleted {
            run_id,
            status: RunStatus::Succeeded,
        })
        .await;
        self.release_artifacts(run_id).await;
        Ok(())
    }

    pub async fn run(&self, run_id: Uuid) -> Option<PipelineRun> {
        self.inner.ledger.lock().await.runs.get(&run_id).cloned()
    }

    /// The in-progress run, if any
    pub async fn active_run(&self) -> Option<PipelineRun> {
        let ledger = self.inner.ledger.lock().await;
        ledger.active.and_then(|id| ledger.runs.get(&id).cloned())
    }

    /// All runs in start order
    pub async fn runs(&self) -> Vec<PipelineRun> {
        let ledger = self.inner.ledger.lock().await;
        ledger
            .order
            .iter()
            .filter_map(|id| ledger.runs.get(id).cloned())
            .collect()
    }

    /// Bindings of a run, by artifact name
    pub async fn bindings(&self, run_id: Uuid) -> Option<BTreeMap<String, Artifact>> {
        self.run(run_id).await.map(|run| run.bindings)
    }
}

/// Resolves once the run leaves InProgress
async fn stopped(signal: &mut watch::Receiver<RunStatus>) {
    loop {
        if signal.borrow_and_update().is_terminal() {
            return;
        }
        // The sender is dropped once the run has finished
        if signal.changed().await.is_err() {
            return;
        }
    }
}
