//! Action executor - runs a single action against its collaborators

use crate::{
    collaborators::{content_type_for, BuildRequest, Collaborators},
    core::{
        artifact::{normalize_path, ArtifactStore},
        Action, ActionError, ActionKind, Artifact, Bundle, ComputeSize, SourceRevision,
    },
    execution::jobs::{FunctionRegistry, InvocationJob, JobRegistry, JobResult},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executes one action and stores its output artifact
pub struct ActionExecutor {
    collaborators: Collaborators,
    artifacts: Arc<dyn ArtifactStore>,
    functions: FunctionRegistry,
    jobs: JobRegistry,
    default_invoke_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        collaborators: Collaborators,
        artifacts: Arc<dyn ArtifactStore>,
        functions: FunctionRegistry,
        jobs: JobRegistry,
        default_invoke_timeout: Duration,
    ) -> Self {
        Self {
            collaborators,
            artifacts,
            functions,
            jobs,
            default_invoke_timeout,
        }
    }

    /// Execute an action
    ///
    /// `available` holds every artifact bound so far: the run's bindings plus
    /// outputs of earlier waves of the current stage. Returns the stored
    /// output artifact if the action produced one.
    pub async fn execute(
        &self,
        action: &Action,
        run_id: Uuid,
        trigger: &SourceRevision,
        available: &BTreeMap<String, Artifact>,
    ) -> Result<Option<Artifact>, ActionError> {
        info!("Executing {} action: {}", action.kind.label(), action.name);

        let inputs = self.resolve_inputs(action, available).await?;

        let produced = match &action.kind {
            ActionKind::SourceFetch {
                repository,
                connection,
            } => {
                let snapshot = self
                    .collaborators
                    .source
                    .fetch(repository, connection, &trigger.revision)
                    .await
                    .map_err(|e| ActionError::execution(e.to_string()))?;
                debug!(
                    "Fetched {} at {} ({} files)",
                    repository,
                    trigger.revision,
                    snapshot.len()
                );
                Some(snapshot)
            }
            ActionKind::Build {
                buildspec,
                compute,
                environment,
                timeout_secs,
            } => {
                let source = Self::single_input(action, inputs)?;
                Some(
                    self.build(source, buildspec, *compute, environment, *timeout_secs)
                        .await?,
                )
            }
            ActionKind::Deploy {
                extract,
                prefix,
                object_key,
            } => {
                let bundle = Self::single_input(action, inputs)?;
                self.deploy(&bundle, *extract, prefix.as_deref(), object_key.as_deref())
                    .await?;
                None
            }
            ActionKind::Invoke {
                function,
                user_parameters,
                timeout_secs,
            } => {
                let timeout = timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_invoke_timeout);
                self.invoke(action, run_id, function, user_parameters, inputs, timeout)
                    .await?
            }
        };

        match (&action.output, produced) {
            (Some(name), Some(bundle)) => {
                let artifact = self
                    .artifacts
                    .put(run_id, name, &bundle)
                    .await
                    .map_err(|e| ActionError::execution(e.to_string()))?;
                debug!("Stored artifact {} ({} bytes)", artifact.key, artifact.size_bytes);
                Ok(Some(artifact))
            }
            (Some(name), None) => {
                warn!("Action {} declared output '{}' but produced none", action.name, name);
                Ok(None)
            }
            (None, _) => Ok(None),
        }
    }

    async fn resolve_inputs(
        &self,
        action: &Action,
        available: &BTreeMap<String, Artifact>,
    ) -> Result<BTreeMap<String, Bundle>, ActionError> {
        let mut inputs = BTreeMap::new();
        for name in &action.inputs {
            let artifact = available.get(name).ok_or_else(|| ActionError::Binding {
                artifact: name.clone(),
            })?;
            let bundle = self
                .artifacts
                .get(artifact)
                .await
                .map_err(|_| ActionError::Binding {
                    artifact: name.clone(),
                })?;
            inputs.insert(name.clone(), bundle);
        }
        Ok(inputs)
    }

    fn single_input(action: &Action, inputs: BTreeMap<String, Bundle>) -> Result<Bundle, ActionError> {
        let mut bundles = inputs.into_values();
        match (bundles.next(), bundles.next()) {
            (Some(bundle), None) => Ok(bundle),
            _ => Err(ActionError::execution(format!(
                "{} action '{}' needs exactly one input artifact",
                action.kind.label(),
                action.name
            ))),
        }
    }

    async fn build(
        &self,
        source: Bundle,
        buildspec: &str,
        compute: ComputeSize,
        environment: &BTreeMap<String, String>,
        timeout_secs: Option<u64>,
    ) -> Result<Bundle, ActionError> {
        let mut envelope = compute.envelope();
        if let Some(secs) = timeout_secs {
            envelope.timeout = Duration::from_secs(secs);
        }

        let request = BuildRequest {
            source,
            buildspec: buildspec.to_string(),
            environment: environment.clone(),
            envelope,
        };

        match tokio::time::timeout(envelope.timeout, self.collaborators.builder.run(request)).await {
            Ok(Ok(output)) => {
                info!("Build produced {} files", output.len());
                Ok(output)
            }
            Ok(Err(e)) => Err(ActionError::execution(e.to_string())),
            Err(_) => Err(ActionError::execution(format!(
                "build exceeded its time ceiling of {}s",
                envelope.timeout.as_secs()
            ))),
        }
    }

    async fn deploy(
        &self,
        bundle: &Bundle,
        extract: bool,
        prefix: Option<&str>,
        object_key: Option<&str>,
    ) -> Result<(), ActionError> {
        let publisher = &self.collaborators.publisher;

        if !extract {
            let key = object_key.ok_or_else(|| {
                ActionError::execution("deploy without extract needs an object_key")
            })?;
            let body = serde_json::to_vec(bundle).map_err(|e| ActionError::execution(e.to_string()))?;
            publisher
                .put_object(key, body, "application/json")
                .await
                .map_err(|e| ActionError::execution(e.to_string()))?;
            info!("Published bundle as {}", key);
            return Ok(());
        }

        let prefix = prefix.and_then(normalize_path).filter(|p| !p.is_empty());
        for (path, contents) in bundle.files() {
            let key = match &prefix {
                Some(prefix) => format!("{}/{}", prefix, path),
                None => path.clone(),
            };
            publisher
                .put_object(&key, contents.clone(), content_type_for(path))
                .await
                .map_err(|e| ActionError::execution(format!("{}: {}", key, e)))?;
        }
        info!("Published {} files", bundle.len());
        Ok(())
    }

    async fn invoke(
        &self,
        action: &Action,
        run_id: Uuid,
        function: &str,
        user_parameters: &BTreeMap<String, String>,
        inputs: BTreeMap<String, Bundle>,
        timeout: Duration,
    ) -> Result<Option<Bundle>, ActionError> {
        let target = self
            .functions
            .get(function)
            .map_err(|e| ActionError::execution(e.to_string()))?;

        let pending = self.jobs.register().await;
        let job = InvocationJob {
            token: pending.token(),
            run_id,
            action_name: action.name.clone(),
            user_parameters: user_parameters.clone(),
            inputs,
        };

        if let Err(e) = target.invoke(job).await {
            pending.expire().await;
            return Err(ActionError::execution(e.to_string()));
        }

        match pending.wait(timeout).await? {
            JobResult::Success { output } => Ok(output),
            JobResult::Failure { reason } => Err(ActionError::execution(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        BuildError, BuildRunner, InMemorySource, MemoryPublishTarget, PublishTarget,
    };
    use crate::core::artifact::InMemoryArtifactStore;
    use crate::core::FailureKind;
    use crate::core::RepositoryRef;
    use crate::execution::jobs::{Invocable, InvokeError, JobReporter};
    use async_trait::async_trait;

    /// Copies `public/` of the source as the build output
    struct CopyPublicRunner;

    #[async_trait]
    impl BuildRunner for CopyPublicRunner {
        async fn run(&self, request: BuildRequest) -> Result<Bundle, BuildError> {
            if request.source.get(&request.buildspec).is_none() {
                return Err(BuildError::MissingBuildspec(request.buildspec));
            }
            Ok(request.source.subtree("public"))
        }
    }

    /// Reports success without an output after a delay
    struct DelayedReporter {
        reporter: JobReporter,
        delay: Duration,
    }

    #[async_trait]
    impl Invocable for DelayedReporter {
        async fn invoke(&self, job: InvocationJob) -> Result<(), InvokeError> {
            let reporter = self.reporter.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = reporter.put_job_success_result(job.token, None).await;
            });
            Ok(())
        }
    }

    fn repo() -> RepositoryRef {
        RepositoryRef {
            owner: "acme".to_string(),
            name: "web".to_string(),
            branch: "main".to_string(),
        }
    }

    struct Fixture {
        executor: ActionExecutor,
        source: Arc<InMemorySource>,
        publisher: Arc<MemoryPublishTarget>,
        artifacts: Arc<InMemoryArtifactStore>,
    }

    fn fixture(delay: Duration) -> Fixture {
        let source = Arc::new(InMemorySource::new());
        let publisher = Arc::new(MemoryPublishTarget::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let jobs = JobRegistry::new();
        let functions = FunctionRegistry::new().with(
            "notify",
            Arc::new(DelayedReporter {
                reporter: jobs.reporter(),
                delay,
            }),
        );
        let executor = ActionExecutor::new(
            Collaborators {
                source: source.clone(),
                builder: Arc::new(CopyPublicRunner),
                publisher: publisher.clone(),
            },
            artifacts.clone(),
            functions,
            jobs,
            Duration::from_secs(5),
        );
        Fixture {
            executor,
            source,
            publisher,
            artifacts,
        }
    }

    fn action(name: &str, kind: ActionKind, inputs: &[&str], output: Option<&str>) -> Action {
        Action {
            name: name.to_string(),
            kind,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output: output.map(String::from),
        }
    }

    fn source_action() -> Action {
        action(
            "Fetch",
            ActionKind::SourceFetch {
                repository: repo(),
                connection: "conn".to_string(),
            },
            &[],
            Some("src"),
        )
    }

    fn build_action() -> Action {
        action(
            "Build",
            ActionKind::Build {
                buildspec: "buildspec.yml".to_string(),
                compute: ComputeSize::Small,
                environment: BTreeMap::new(),
                timeout_secs: None,
            },
            &["src"],
            Some("site"),
        )
    }

    #[tokio::test]
    async fn test_source_build_deploy_chain() {
        let f = fixture(Duration::ZERO);
        let run_id = Uuid::new_v4();
        let snapshot = Bundle::new()
            .with_file("buildspec.yml", "phases: {}")
            .with_file("public/index.html", "<h1>v1</h1>")
            .with_file("public/css/site.css", "body{}");
        f.source.authorize("conn").await;
        f.source.push_commit(&repo(), "c1", snapshot).await;
        let trigger = SourceRevision::new(repo(), "c1");

        let mut available = BTreeMap::new();
        let src = f
            .executor
            .execute(&source_action(), run_id, &trigger, &available)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(src.name, "src");
        available.insert("src".to_string(), src);

        let site = f
            .executor
            .execute(&build_action(), run_id, &trigger, &available)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(site.file_count, 2);
        available.insert("site".to_string(), site);

        let deploy = action(
            "Deploy",
            ActionKind::Deploy {
                extract: true,
                prefix: None,
                object_key: None,
            },
            &["site"],
            None,
        );
        let out = f
            .executor
            .execute(&deploy, run_id, &trigger, &available)
            .await
            .unwrap();
        assert!(out.is_none());

        let stored = f.publisher.object("css/site.css").await.unwrap();
        assert_eq!(stored.content_type, "text/css");
        assert_eq!(f.publisher.list_keys().await.unwrap().len(), 2);
        assert_eq!(f.artifacts.len().await, 2);
    }

    #[tokio::test]
    async fn test_unresolved_input_is_binding_error() {
        let f = fixture(Duration::ZERO);
        let trigger = SourceRevision::new(repo(), "c1");
        let err = f
            .executor
            .execute(&build_action(), Uuid::new_v4(), &trigger, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Binding);
    }

    #[tokio::test]
    async fn test_unauthorized_source_is_execution_error() {
        let f = fixture(Duration::ZERO);
        f.source.push_commit(&repo(), "c1", Bundle::new()).await;
        let trigger = SourceRevision::new(repo(), "c1");
        let err = f
            .executor
            .execute(&source_action(), Uuid::new_v4(), &trigger, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Execution);
        assert!(err.to_string().contains("not authorized"));
    }

    #[tokio::test]
    async fn test_deploy_bundle_as_single_object() {
        let f = fixture(Duration::ZERO);
        let run_id = Uuid::new_v4();
        let bundle = Bundle::new().with_file("index.html", "x");
        let artifact = f.artifacts.put(run_id, "site", &bundle).await.unwrap();
        let available = BTreeMap::from([("site".to_string(), artifact)]);
        let deploy = action(
            "Archive",
            ActionKind::Deploy {
                extract: false,
                prefix: None,
                object_key: Some("releases/site.json".to_string()),
            },
            &["site"],
            None,
        );

        f.executor
            .execute(&deploy, run_id, &SourceRevision::new(repo(), "c1"), &available)
            .await
            .unwrap();

        let body = f.publisher.get_object("releases/site.json").await.unwrap().unwrap();
        let restored: Bundle = serde_json::from_slice(&body).unwrap();
        assert_eq!(restored, bundle);
    }

    #[tokio::test]
    async fn test_invoke_times_out_without_report() {
        let f = fixture(Duration::from_millis(500));
        let invoke = action(
            "Notify",
            ActionKind::Invoke {
                function: "notify".to_string(),
                user_parameters: BTreeMap::new(),
                timeout_secs: None,
            },
            &[],
            None,
        );
        let executor = ActionExecutor {
            default_invoke_timeout: Duration::from_millis(50),
            ..f.executor
        };

        let err = executor
            .execute(&invoke, Uuid::new_v4(), &SourceRevision::new(repo(), "c1"), &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_invoke_unknown_function() {
        let f = fixture(Duration::ZERO);
        let invoke = action(
            "Notify",
            ActionKind::Invoke {
                function: "missing".to_string(),
                user_parameters: BTreeMap::new(),
                timeout_secs: Some(1),
            },
            &[],
            None,
        );
        let err = f
            .executor
            .execute(&invoke, Uuid::new_v4(), &SourceRevision::new(repo(), "c1"), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("function not found"));
    }
}
