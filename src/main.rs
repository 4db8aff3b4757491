use anyhow::{Context, Result};
use sitepipe::cli::commands::{
    HistoryCommand, ListCommand, RunCommand, TargetArgs, ValidateCommand, WatchCommand,
};
use sitepipe::cli::output::*;
use sitepipe::cli::{Cli, Command};
use sitepipe::collaborators::{
    Collaborators, DirectoryPublishTarget, GitSource, JournalEdgeCache, ShellBuildRunner,
    SourceProvider,
};
use sitepipe::core::artifact::{ArtifactStore, LocalArtifactStore};
use sitepipe::core::config::{DeploymentSettings, PipelineConfig};
use sitepipe::core::{RepositoryRef, RunStatus, SourceRevision};
use sitepipe::execution::invalidation::{DISTRIBUTION_ENV, FUNCTION_NAME};
use sitepipe::execution::{
    BranchWatcher, CacheInvalidationTask, ExecutionEvent, FunctionRegistry, InvalidationTaskConfig,
    JobRegistry, Orchestrator, OrchestratorConfig,
};
use sitepipe::persistence::{InMemoryRunStore, RunStore, RunSummary};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, &cli).await?,
        Command::Watch(cmd) => watch_branch(cmd, &cli).await?,
        Command::Validate(cmd) => validate_pipeline(cmd, &cli)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

/// Process environment layered over the settings file, then `--var` overrides
fn load_settings(env_file: &str, vars: &[(String, String)]) -> Result<DeploymentSettings> {
    let file = if Path::new(env_file).exists() {
        DeploymentSettings::from_env_file(env_file)?
    } else {
        DeploymentSettings::new()
    };
    let mut settings = file.merge(DeploymentSettings::from_process_env());
    for (key, value) in vars {
        settings.set(key.clone(), value.clone());
    }
    Ok(settings)
}

#[cfg(feature = "sqlite")]
async fn open_store(ephemeral: bool) -> Result<Arc<dyn RunStore>> {
    if ephemeral {
        return Ok(Arc::new(InMemoryRunStore::new()));
    }
    Ok(Arc::new(
        sitepipe::persistence::SqliteRunStore::with_default_path().await?,
    ))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(ephemeral: bool) -> Result<Arc<dyn RunStore>> {
    if !ephemeral {
        warn!("Built without sqlite support; run history is not kept");
    }
    Ok(Arc::new(InMemoryRunStore::new()))
}

fn invalidation_config(target: &TargetArgs, settings: &DeploymentSettings) -> InvalidationTaskConfig {
    if let Some(id) = &target.distribution {
        return InvalidationTaskConfig::new(id);
    }
    match settings.get(DISTRIBUTION_ENV) {
        Some(id) => InvalidationTaskConfig::new(id),
        None => {
            warn!("{} is not set; invalidating distribution 'local'", DISTRIBUTION_ENV);
            InvalidationTaskConfig::new("local")
        }
    }
}

/// A wired orchestrator and the source it tracks
struct Deployment {
    name: String,
    stage_count: usize,
    orchestrator: Orchestrator,
    source: Arc<dyn SourceProvider>,
    repository: RepositoryRef,
    connection: String,
}

async fn prepare(target: &TargetArgs, cli: &Cli) -> Result<Deployment> {
    let config = PipelineConfig::from_file(&target.file).context("Failed to load pipeline config")?;
    let settings = load_settings(&cli.env_file, &target.var)?;
    let definition = config
        .to_definition(&settings)
        .context("Failed to resolve deployment settings")?;

    let (repository, connection) = definition
        .repository()
        .map(|(r, c)| (r.clone(), c.to_string()))
        .context("Pipeline has no source action")?;

    let mut git = GitSource::new(&target.repos_root);
    if target.authorize.is_empty() {
        git = git.authorize(connection.clone());
    }
    for allowed in &target.authorize {
        git = git.authorize(allowed.clone());
    }
    let source: Arc<dyn SourceProvider> = Arc::new(git);

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(match &target.artifact_dir {
        Some(dir) => LocalArtifactStore::new(dir),
        None => LocalArtifactStore::with_default_path(),
    });

    let jobs = JobRegistry::new();
    let task_config = invalidation_config(target, &settings);
    let edge_cache = Arc::new(JournalEdgeCache::new(
        task_config.distribution_id.clone(),
        &target.invalidation_journal,
    ));
    let functions = FunctionRegistry::new().with(
        FUNCTION_NAME,
        Arc::new(CacheInvalidationTask::new(task_config, edge_cache, jobs.reporter())),
    );

    debug!("Registered functions: {:?}", functions.names());

    let collaborators = Collaborators {
        source: source.clone(),
        builder: Arc::new(ShellBuildRunner::with_temp_dir().with_shell(&target.shell)),
        publisher: Arc::new(DirectoryPublishTarget::new(&target.publish_dir)),
    };

    let stage_count = definition.len();
    let orchestrator = Orchestrator::new(
        definition,
        collaborators,
        functions,
        jobs,
        artifacts,
        open_store(target.no_history).await?,
        OrchestratorConfig::from_pipeline(&config),
    )?;

    Ok(Deployment {
        name: config.name,
        stage_count,
        orchestrator,
        source,
        repository,
        connection,
    })
}

async fn run_pipeline(cmd: &RunCommand, cli: &Cli) -> Result<()> {
    let deployment = prepare(&cmd.target, cli).await?;
    println!(
        "{} Loaded pipeline: {} ({})",
        INFO,
        style(&deployment.name).bold(),
        style(&deployment.repository).cyan()
    );

    let revision = match &cmd.revision {
        Some(revision) => revision.clone(),
        None => deployment
            .source
            .resolve_head(&deployment.repository, &deployment.connection)
            .await
            .context("Failed to resolve branch head")?,
    };

    // Set up event handler for console output
    let progress = create_progress_bar(deployment.stage_count);
    let bar = progress.clone();
    deployment
        .orchestrator
        .add_event_handler(move |event| {
            match &event {
                ExecutionEvent::StageStarted { stage, .. } => bar.set_message(stage.clone()),
                ExecutionEvent::StageCompleted { succeeded: true, .. } => bar.inc(1),
                _ => {}
            }
            bar.println(format_execution_event(&event));
        })
        .await;

    println!();
    let mut handle = deployment
        .orchestrator
        .start_run(SourceRevision::new(deployment.repository.clone(), revision))
        .await;
    let status = handle.wait().await;
    progress.finish_and_clear();

    if let Some(run) = deployment.orchestrator.run(handle.run_id()).await {
        println!("\n{}", format_run_details(&run));
    }

    match status {
        RunStatus::Succeeded => {
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&deployment.name).bold(),
                style("successfully").green()
            );
            Ok(())
        }
        other => {
            println!(
                "\n{} {} {}",
                CROSS,
                style(&deployment.name).bold(),
                format_status(other)
            );
            error!("Run {} ended {}", handle.run_id(), other);
            std::process::exit(1);
        }
    }
}

async fn watch_branch(cmd: &WatchCommand, cli: &Cli) -> Result<()> {
    let deployment = prepare(&cmd.target, cli).await?;
    println!(
        "{} Watching {} every {}",
        INFO,
        style(&deployment.repository).cyan(),
        format_duration(Duration::from_secs(cmd.interval))
    );

    deployment
        .orchestrator
        .add_event_handler(|event| println!("{}", format_execution_event(&event)))
        .await;

    let (shutdown, stop) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(true);
        }
    });

    let mut watcher = BranchWatcher::new(
        deployment.orchestrator,
        deployment.source.clone(),
        deployment.repository.clone(),
        deployment.connection.clone(),
        Duration::from_secs(cmd.interval.max(1)),
    );
    if cmd.skip_current {
        let head = deployment
            .source
            .resolve_head(&deployment.repository, &deployment.connection)
            .await
            .context("Failed to resolve branch head")?;
        println!("{} Skipping current head {}", SKIP, style(&head).cyan());
        watcher = watcher.with_last_seen(head);
    }
    watcher.run(stop).await;

    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand, cli: &Cli) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let config = match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => config,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    };

    println!("{} Pipeline configuration is valid!", CHECK);
    println!("  Name: {}", style(&config.name).bold());
    println!("  Stages: {}", style(config.stages.len()).cyan());
    for stage in &config.stages {
        let actions: Vec<&str> = stage.actions.iter().map(|a| a.name.as_str()).collect();
        println!("    {} [{}]", style(&stage.name).bold(), actions.join(", "));
    }

    let settings = load_settings(&cli.env_file, &cmd.var)?;
    match config.to_definition(&settings) {
        Ok(definition) => {
            if let Some((repository, _)) = definition.repository() {
                println!("  Source: {}", style(repository).cyan());
            }
        }
        Err(e) => println!(
            "{} Deployment settings incomplete: {}",
            WARN,
            style(format!("{:#}", e)).yellow()
        ),
    }

    if cmd.json {
        let json = serde_json::to_string_pretty(&config)?;
        println!("\n{}", json);
    }
    Ok(())
}

async fn list_pipelines(cmd: &ListCommand) -> Result<()> {
    let store = open_store(false).await?;
    let pipelines = store.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(());
    }

    println!("{} Pipelines in history:", INFO);

    let mut json_data = Vec::new();
    for pipeline_name in &pipelines {
        let runs = store.list_runs(pipeline_name).await?;

        if cmd.with_counts {
            let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed, {} superseded)",
                style(pipeline_name).bold(),
                style(runs.len()).cyan(),
                style(count(RunStatus::Succeeded)).green(),
                style(count(RunStatus::Failed)).red(),
                style(count(RunStatus::Superseded)).dim()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }

        json_data.push(serde_json::json!({
            "name": pipeline_name,
            "run_count": runs.len()
        }));
    }

    if cmd.json {
        let data = serde_json::json!({ "pipelines": json_data });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_store(false).await?;

    // If a specific run is requested
    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => print_run_details(&summary, cmd.verbose)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let mut runs = match &cmd.pipeline {
        Some(pipeline_name) => store.list_runs(pipeline_name).await?,
        None => {
            let mut all = Vec::new();
            for pipeline in store.list_pipelines().await? {
                all.extend(store.list_runs(&pipeline).await?);
            }
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all
        }
    };
    runs.truncate(cmd.limit);

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, runs.len());
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }

    Ok(())
}

fn print_run_details(summary: &RunSummary, verbose: bool) -> Result<()> {
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Source: {} @ {}", summary.repository, style(&summary.revision).cyan());
    println!("  Status: {}", format_status(summary.status));
    if let Some(stage) = &summary.current_stage {
        println!("  Stage: {}", style(stage).bold());
    }
    if let Some(failure) = &summary.failure {
        println!("  Failure: {}", style(failure).red());
    }
    if let Some(newer) = summary.superseded_by {
        println!("  Superseded by: {}", style(newer).dim());
    }
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Progress: {} ({}/{})",
        style(format!("{:.0}%", summary.progress() * 100.0)).cyan(),
        summary.completed_stages,
        summary.total_stages
    );

    if verbose {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}
