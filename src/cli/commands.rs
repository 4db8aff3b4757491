//! CLI command definitions

use clap::Args;

/// Where the pipeline reads from and publishes to
#[derive(Debug, Args, Clone)]
pub struct TargetArgs {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Deployment setting overrides (KEY=VALUE)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// Directory holding repositories as <owner>/<name>
    #[arg(long, default_value = ".")]
    pub repos_root: String,

    /// Source connections allowed to read (default: the pipeline's own)
    #[arg(long)]
    pub authorize: Vec<String>,

    /// Directory the deploy stage publishes to
    #[arg(long, default_value = "public")]
    pub publish_dir: String,

    /// Artifact store directory (default: user data directory)
    #[arg(long)]
    pub artifact_dir: Option<String>,

    /// Distribution to invalidate (default: CLOUDFRONT_DISTRIBUTION_ID)
    #[arg(long)]
    pub distribution: Option<String>,

    /// Shell that runs build commands
    #[arg(long, default_value = "sh")]
    pub shell: String,

    /// Journal file recording invalidations
    #[arg(long, default_value = "invalidations.jsonl")]
    pub invalidation_journal: String,

    /// Don't save runs to history
    #[arg(long)]
    pub no_history: bool,
}

/// Run the pipeline once
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Revision to run (default: head of the tracked branch)
    #[arg(long)]
    pub revision: Option<String>,
}

/// Watch the tracked branch
#[derive(Debug, Args, Clone)]
pub struct WatchCommand {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Polling interval in seconds
    #[arg(long, default_value_t = 30)]
    pub interval: u64,

    /// Only react to commits made after the watch starts
    #[arg(long)]
    pub skip_current: bool,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Deployment setting overrides (KEY=VALUE)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines with recorded runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show full details
    #[arg(long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single run
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
