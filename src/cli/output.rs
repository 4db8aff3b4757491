//! CLI output formatting

use crate::{
    core::{ActionState, PipelineRun, RunStatus, StageStatus},
    execution::ExecutionEvent,
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", ">> ");

/// Create a stage progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Format an action state for display
pub fn format_action_state(state: &ActionState) -> String {
    match state {
        ActionState::Pending => style("PENDING").dim().to_string(),
        ActionState::Running { .. } => style("RUNNING").yellow().to_string(),
        ActionState::Succeeded { .. } => style("SUCCEEDED").green().to_string(),
        ActionState::Failed { kind, .. } => style(format!("FAILED ({})", kind)).red().to_string(),
    }
}

pub fn format_stage_status(status: StageStatus) -> String {
    match status {
        StageStatus::Pending => style("PENDING").dim().to_string(),
        StageStatus::InProgress => style("IN PROGRESS").yellow().to_string(),
        StageStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        StageStatus::Failed => style("FAILED").red().to_string(),
        StageStatus::Abandoned => style("ABANDONED").dim().to_string(),
    }
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::InProgress => style("IN PROGRESS").yellow().to_string(),
        RunStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
        RunStatus::Superseded => style("SUPERSEDED").dim().to_string(),
    }
}

fn status_icon(status: RunStatus) -> Emoji<'static, 'static> {
    match status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::InProgress => SPINNER,
        RunStatus::Superseded => SKIP,
    }
}

/// Format a run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    format!(
        "{} {} - {} @ {} - {} ({}/{}) - {}",
        status_icon(summary.status),
        style(short_id(&summary.run_id)).dim(),
        style(&summary.pipeline_name).bold(),
        style(&summary.revision).cyan(),
        format_status(summary.status),
        summary.completed_stages,
        summary.total_stages,
        style(format!("{:.0}%", summary.progress() * 100.0)).cyan()
    )
}

/// Format a finished run, stage by stage
pub fn format_run_details(run: &PipelineRun) -> String {
    let mut lines = vec![format!(
        "{} {} {} at {}",
        status_icon(run.status),
        style(&run.pipeline_name).bold(),
        format_status(run.status),
        style(&run.trigger.revision).cyan()
    )];
    for stage in &run.stages {
        lines.push(format!(
            "  {} {}",
            style(&stage.name).bold(),
            format_stage_status(stage.status)
        ));
        for action in &stage.actions {
            lines.push(format!(
                "    {} {}",
                action.name,
                format_action_state(&action.state)
            ));
        }
    }
    if let Some(failure) = &run.failure {
        lines.push(format!("  {} {}", CROSS, style(failure).red()));
    }
    lines.join("\n")
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            revision,
        } => format!(
            "{} Starting {} at {} ({})",
            ROCKET,
            style(pipeline_name).bold(),
            style(revision).cyan(),
            style(short_id(run_id)).dim()
        ),
        ExecutionEvent::RunSuperseded {
            run_id,
            superseded_by,
        } => format!(
            "{} Run {} superseded by {}",
            SKIP,
            style(short_id(run_id)).dim(),
            style(short_id(superseded_by)).cyan()
        ),
        ExecutionEvent::StageStarted { stage, .. } => {
            format!("{} Stage {}", SPINNER, style(stage).bold())
        }
        ExecutionEvent::ActionStarted { stage, action, .. } => {
            format!("  {} {}/{}", SPINNER, style(stage).dim(), style(action).cyan())
        }
        ExecutionEvent::ActionSucceeded {
            stage,
            action,
            output,
            ..
        } => match output {
            Some(output) => format!(
                "  {} {}/{} → {}",
                CHECK,
                style(stage).dim(),
                style(action).green(),
                style(output).cyan()
            ),
            None => format!("  {} {}/{}", CHECK, style(stage).dim(), style(action).green()),
        },
        ExecutionEvent::ActionFailed {
            stage,
            action,
            kind,
            error,
            ..
        } => format!(
            "  {} {}/{} [{}]: {}",
            CROSS,
            style(stage).dim(),
            style(action).red(),
            kind,
            style(error).dim()
        ),
        ExecutionEvent::StageCompleted {
            stage, succeeded, ..
        } => {
            if *succeeded {
                format!("{} Stage {} succeeded", CHECK, style(stage).green())
            } else {
                format!("{} Stage {} failed", CROSS, style(stage).red())
            }
        }
        ExecutionEvent::RunCompleted { run_id, status } => format!(
            "{} Run {} {}",
            status_icon(*status),
            style(short_id(run_id)).dim(),
            format_status(*status)
        ),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
