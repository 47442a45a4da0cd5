//! Shared rendering helpers for CLI commands.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;
use uuid::Uuid;

use stepgate_core::workflow::executor::StepRun;
use stepgate_core::{EngineError, ErrorKind};
use stepgate_types::checkpoint::{Checkpoint, CheckpointStatus};
use stepgate_types::task::{TaskStatus, WorkflowTask};

pub fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.trim()
        .parse::<Uuid>()
        .with_context(|| format!("'{raw}' is not a valid {what} id"))
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| if i == 0 { Cell::new(h).fg(Color::Cyan) } else { Cell::new(h) })
                .collect::<Vec<_>>(),
        );
    table
}

pub fn status_cell(status: TaskStatus) -> Cell {
    let color = match status {
        TaskStatus::Completed => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Cancelled => Color::DarkGrey,
        TaskStatus::Paused => Color::Yellow,
        TaskStatus::Pending | TaskStatus::Running => Color::Blue,
    };
    Cell::new(status).fg(color)
}

pub fn checkpoint_status_cell(status: CheckpointStatus) -> Cell {
    let color = match status {
        CheckpointStatus::Pending => Color::Yellow,
        CheckpointStatus::Approved | CheckpointStatus::Skipped => Color::Green,
        CheckpointStatus::Rejected | CheckpointStatus::Timeout => Color::Red,
    };
    Cell::new(status).fg(color)
}

fn styled_status(status: TaskStatus) -> String {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => style(text).green().bold().to_string(),
        TaskStatus::Failed => style(text).red().bold().to_string(),
        TaskStatus::Paused => style(text).yellow().bold().to_string(),
        TaskStatus::Cancelled => style(text).dim().to_string(),
        TaskStatus::Pending | TaskStatus::Running => style(text).blue().to_string(),
    }
}

/// Detailed view of a single task.
pub fn print_task(task: &WorkflowTask) -> Result<()> {
    println!();
    println!(
        "  Task {} ({} for project '{}')",
        style(task.id).cyan(),
        task.definition_id,
        style(&task.project_id).cyan()
    );
    println!("  Status:      {}", styled_status(task.status));
    println!("  Supervision: {}", task.supervision_mode);
    println!("  Template:    {} v{}", task.definition_id, task.definition_version);
    if let Some(step) = &task.current_step_id {
        println!("  Step:        {step}");
    }
    if !task.completed_steps.is_empty() {
        println!("  Completed:   {}", task.completed_steps.join(" -> "));
    }
    println!("  Started:     {}", task.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(done) = task.completed_at {
        println!("  Finished:    {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(err) = &task.error {
        println!("  Error:       {}", style(err).red());
    }
    println!("  State:");
    for line in serde_json::to_string_pretty(&task.state)?.lines() {
        println!("    {line}");
    }
    println!();
    Ok(())
}

/// Detailed view of a checkpoint awaiting review.
pub fn print_checkpoint(checkpoint: &Checkpoint) -> Result<()> {
    println!(
        "  {} Checkpoint {} at step '{}' ({})",
        style("||").yellow().bold(),
        style(checkpoint.id).cyan(),
        checkpoint.step_id,
        checkpoint.checkpoint_type
    );
    println!(
        "  Expires: {}",
        checkpoint.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for line in serde_json::to_string_pretty(&checkpoint.data)?.lines() {
        println!("    {line}");
    }
    println!();
    println!(
        "  Approve: {}",
        style(format!("stepgate approve {}", checkpoint.id)).dim()
    );
    println!(
        "  Reject:  {}",
        style(format!("stepgate reject {} --reason \"...\"", checkpoint.id)).dim()
    );
    println!();
    Ok(())
}

/// Outcome of an entry point: the task plus the checkpoint it waits on.
pub fn print_run(run: &StepRun, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "task": run.task,
            "checkpoint": run.checkpoint,
        }));
    }
    print_task(&run.task)?;
    if let Some(checkpoint) = &run.checkpoint {
        print_checkpoint(checkpoint)?;
    }
    Ok(())
}

/// Exit code for an engine failure, grouped by how an operator should react.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>().map(EngineError::kind) {
        Some(ErrorKind::ValidationError) => 2,
        Some(ErrorKind::NotFound) => 3,
        Some(ErrorKind::Conflict | ErrorKind::InvalidState) => 4,
        Some(ErrorKind::Timeout | ErrorKind::BoundsError) => 5,
        Some(ErrorKind::StepExecutionError | ErrorKind::Cancelled) => 6,
        Some(ErrorKind::PersistenceError) => 7,
        None => 1,
    }
}
