//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, ListCommand, RunCommand, ValidateCommand, WatchCommand};
use std::ffi::OsString;

/// Continuous delivery for static sites
#[derive(Debug, Parser, Clone)]
#[command(name = "sitepipe")]
#[command(author = "sitepipe contributors")]
#[command(version = "0.1.0")]
#[command(about = "Source, build, publish and invalidate a static site", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Deployment settings file (KEY=VALUE lines)
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: String,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the pipeline once for a revision
    Run(RunCommand),

    /// Start a run for every new commit on the tracked branch
    Watch(WatchCommand),

    /// Validate a pipeline configuration
    Validate(ValidateCommand),

    /// List pipelines with recorded runs
    List(ListCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
