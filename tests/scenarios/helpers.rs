//! Test utilities for pipeline scenarios

use async_trait::async_trait;
use sitepipe::collaborators::{
    BuildError, BuildRequest, BuildRunner, Collaborators, InMemorySource, MemoryPublishTarget,
    RecordingEdgeCache,
};
use sitepipe::core::artifact::InMemoryArtifactStore;
use sitepipe::core::config::{DeploymentSettings, PipelineConfig};
use sitepipe::core::{
    Bundle, FailureKind, PipelineRun, RepositoryRef, RunStatus, SourceRevision,
};
use sitepipe::execution::invalidation::FUNCTION_NAME;
use sitepipe::execution::{
    CacheInvalidationTask, ExecutionEvent, FunctionRegistry, InvalidationTaskConfig, JobRegistry,
    Orchestrator, OrchestratorConfig, RunHandle,
};
use sitepipe::persistence::InMemoryRunStore;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

pub const DISTRIBUTION: &str = "E2EXAMPLE";

/// The four-stage static site pipeline
pub const SITE_PIPELINE: &str = r#"
name: static-site
source:
  owner: { from_env: GithubOwner }
  repo: { from_env: GithubRepo }
  branch: { from_env: GithubBranch, default: main }
  connection: { from_env: GithubConnectionARN }
stages:
  - name: Source
    actions:
      - name: GitHub_Source
        type: source
        output: source_output
  - name: Build
    actions:
      - name: SiteBuild
        type: build
        buildspec: Buildspec.yml
        inputs: [source_output]
        output: build_output
        environment:
          VITE_AWS_USER_POOL_ID: { from_env: UserPoolId }
  - name: Deploy
    actions:
      - name: DeployToBucket
        type: deploy
        inputs: [build_output]
  - name: InvalidateCDNCache
    actions:
      - name: CDNCacheBurst
        type: invoke
        function: cache-invalidation
        timeout_secs: 1
"#;

pub fn settings() -> DeploymentSettings {
    DeploymentSettings::new()
        .with("GithubOwner", "acme")
        .with("GithubRepo", "web-app")
        .with("GithubConnectionARN", "conn-1")
        .with("UserPoolId", "pool-42")
}

pub fn repo() -> RepositoryRef {
    RepositoryRef {
        owner: "acme".to_string(),
        name: "web-app".to_string(),
        branch: "main".to_string(),
    }
}

/// A source snapshot with a buildspec and a `public/` tree
pub fn site_snapshot(title: &str) -> Bundle {
    Bundle::new()
        .with_file("Buildspec.yml", "version: 0.2\nphases: {}\n")
        .with_file("src/main.js", "console.log('hi')")
        .with_file("public/index.html", format!("<h1>{}</h1>", title))
        .with_file("public/assets/app.css", "body{}")
}

/// Builds by keeping `public/` and recording the build variables
#[derive(Default)]
pub struct CopyBuildRunner;

#[async_trait]
impl BuildRunner for CopyBuildRunner {
    async fn run(&self, request: BuildRequest) -> Result<Bundle, BuildError> {
        copy_public(request)
    }
}

fn copy_public(request: BuildRequest) -> Result<Bundle, BuildError> {
    if request.source.get(&request.buildspec).is_none() {
        return Err(BuildError::MissingBuildspec(request.buildspec));
    }
    let mut output = request.source.subtree("public");
    if output.is_empty() {
        return Err(BuildError::MissingOutput("public".to_string()));
    }
    let env = request
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");
    output
        .insert("build.env", env)
        .map_err(|e| BuildError::InvalidBuildspec(e.to_string()))?;
    Ok(output)
}

/// Build whose first command exits non-zero
pub struct FailingBuildRunner;

#[async_trait]
impl BuildRunner for FailingBuildRunner {
    async fn run(&self, _request: BuildRequest) -> Result<Bundle, BuildError> {
        Err(BuildError::CommandFailed {
            phase: "build".to_string(),
            command: "npm run build".to_string(),
            exit_code: Some(1),
            stderr: "Module not found: ./missing".to_string(),
        })
    }
}

/// Holds every build until the gate opens
pub struct GatedBuildRunner {
    entered: Notify,
    open: watch::Sender<bool>,
}

impl Default for GatedBuildRunner {
    fn default() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            entered: Notify::new(),
            open,
        }
    }
}

impl GatedBuildRunner {
    /// Wait until a build is parked at the gate
    pub async fn first_build_started(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl BuildRunner for GatedBuildRunner {
    async fn run(&self, request: BuildRequest) -> Result<Bundle, BuildError> {
        let mut open = self.open.subscribe();
        self.entered.notify_one();
        let _ = open.wait_for(|open| *open).await;
        copy_public(request)
    }
}

/// In-memory wiring of one pipeline
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub source: Arc<InMemorySource>,
    pub publisher: Arc<MemoryPublishTarget>,
    pub edge_cache: Arc<RecordingEdgeCache>,
    pub artifacts: Arc<InMemoryArtifactStore>,
    pub store: Arc<InMemoryRunStore>,
    pub jobs: JobRegistry,
    pub events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

pub async fn harness(yaml: &str, builder: Arc<dyn BuildRunner>, edge_cache: RecordingEdgeCache) -> Harness {
    let config = PipelineConfig::from_yaml(yaml).unwrap();
    let definition = config.to_definition(&settings()).unwrap();

    let source = Arc::new(InMemorySource::new());
    source.authorize("conn-1").await;
    let publisher = Arc::new(MemoryPublishTarget::new());
    let edge_cache = Arc::new(edge_cache);
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let store = Arc::new(InMemoryRunStore::new());

    let jobs = JobRegistry::new();
    let functions = FunctionRegistry::new().with(
        FUNCTION_NAME,
        Arc::new(CacheInvalidationTask::new(
            InvalidationTaskConfig::new(DISTRIBUTION),
            edge_cache.clone(),
            jobs.reporter(),
        )),
    );

    let orchestrator = Orchestrator::new(
        definition,
        Collaborators {
            source: source.clone(),
            builder,
            publisher: publisher.clone(),
        },
        functions,
        jobs.clone(),
        artifacts.clone(),
        store.clone(),
        OrchestratorConfig::from_pipeline(&config),
    )
    .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    orchestrator
        .add_event_handler(move |event| sink.lock().unwrap().push(event))
        .await;

    Harness {
        orchestrator,
        source,
        publisher,
        edge_cache,
        artifacts,
        store,
        jobs,
        events,
    }
}

pub async fn default_harness() -> Harness {
    harness(
        SITE_PIPELINE,
        Arc::new(CopyBuildRunner::default()),
        RecordingEdgeCache::new(DISTRIBUTION),
    )
    .await
}

impl Harness {
    /// Push a commit and start a run for it
    pub async fn push_and_start(&self, revision: &str, snapshot: Bundle) -> RunHandle {
        self.source.push_commit(&repo(), revision, snapshot).await;
        self.orchestrator
            .start_run(SourceRevision::new(repo(), revision))
            .await
    }

    /// Push, run to a terminal status and return the final run
    pub async fn run_to_end(&self, revision: &str, snapshot: Bundle) -> PipelineRun {
        let mut handle = self.push_and_start(revision, snapshot).await;
        handle.wait().await;
        self.orchestrator.run(handle.run_id()).await.unwrap()
    }

    pub fn stages_started(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::StageStarted { stage, .. } => Some(stage.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn assert_failed_at(run: &PipelineRun, stage: &str, kind: FailureKind) {
    assert_eq!(run.status, RunStatus::Failed, "run should have failed");
    let failure = run.failure.as_ref().expect("failed run records its failure");
    assert_eq!(failure.stage, stage);
    assert_eq!(failure.kind, kind);
}
