//! Run state models

use crate::core::{
    artifact::Artifact,
    error::FailureKind,
    pipeline::{PipelineDefinition, RepositoryRef},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run is executing; at most one per definition
    InProgress,
    /// Final stage succeeded
    Succeeded,
    /// An action failed and no further stages ran
    Failed,
    /// A newer run started while this one was in progress
    Superseded,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "InProgress",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Superseded => "Superseded",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InProgress" => Ok(RunStatus::InProgress),
            "Succeeded" => Ok(RunStatus::Succeeded),
            "Failed" => Ok(RunStatus::Failed),
            "Superseded" => Ok(RunStatus::Superseded),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// The event that started a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRevision {
    pub repository: RepositoryRef,
    pub revision: String,
}

impl SourceRevision {
    pub fn new(repository: RepositoryRef, revision: impl Into<String>) -> Self {
        Self {
            repository,
            revision: revision.into(),
        }
    }
}

/// State of a single action within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        output: Option<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    Failed {
        kind: FailureKind,
        error: String,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Succeeded { .. } | ActionState::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    /// Stage was in flight when its run was superseded
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub name: String,
    pub state: ActionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub actions: Vec<ActionRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn action_mut(&mut self, name: &str) -> Option<&mut ActionRecord> {
        self.actions.iter_mut().find(|a| a.name == name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionRecord> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// Why a run failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: String,
    /// The failing action, absent for stage-level binding failures
    pub action: Option<String>,
    pub kind: FailureKind,
    pub reason: String,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.action {
            Some(action) => write!(f, "{}/{}: {}", self.stage, action, self.reason),
            None => write!(f, "{}: {}", self.stage, self.reason),
        }
    }
}

/// One execution of a pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,

    pub pipeline_name: String,

    pub trigger: SourceRevision,

    pub status: RunStatus,

    /// Index of the stage being executed (or last executed)
    pub current_stage: usize,

    pub stages: Vec<StageRecord>,

    /// Artifacts produced by completed stages, by artifact name
    pub bindings: BTreeMap<String, Artifact>,

    pub failure: Option<RunFailure>,

    pub superseded_by: Option<Uuid>,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(definition: &PipelineDefinition, trigger: SourceRevision) -> Self {
        let now = Utc::now();
        let stages = definition
            .stages
            .iter()
            .map(|stage| StageRecord {
                name: stage.name.clone(),
                status: StageStatus::Pending,
                actions: stage
                    .actions
                    .iter()
                    .map(|a| ActionRecord {
                        name: a.name.clone(),
                        state: ActionState::Pending,
                    })
                    .collect(),
                started_at: None,
                completed_at: None,
            })
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            pipeline_name: definition.name.clone(),
            trigger,
            status: RunStatus::InProgress,
            current_stage: 0,
            stages,
            bindings: BTreeMap::new(),
            failure: None,
            superseded_by: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RunStatus::InProgress
    }

    pub fn current_stage_name(&self) -> Option<&str> {
        self.stages.get(self.current_stage).map(|s| s.name.as_str())
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn action_state(&self, stage: &str, action: &str) -> Option<&ActionState> {
        self.stage(stage).and_then(|s| s.action(action)).map(|a| &a.state)
    }

    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Succeeded)
            .count()
    }

    /// Fraction of stages that succeeded (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.stages.is_empty() {
            return 0.0;
        }
        self.completed_stages() as f64 / self.stages.len() as f64
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn succeed(&mut self) {
        self.status = RunStatus::Succeeded;
        self.finish();
    }

    pub fn fail(&mut self, failure: RunFailure) {
        self.status = RunStatus::Failed;
        self.failure = Some(failure);
        self.finish();
    }

    /// Mark superseded; the in-flight stage is abandoned, nothing is undone
    pub fn supersede(&mut self, by: Uuid) {
        self.status = RunStatus::Superseded;
        self.superseded_by = Some(by);
        if let Some(stage) = self.stages.get_mut(self.current_stage) {
            if stage.status == StageStatus::InProgress {
                stage.status = StageStatus::Abandoned;
            }
        }
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}
