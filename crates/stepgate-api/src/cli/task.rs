//! Task commands: start, status, tasks, cancel, audit.

use anyhow::{Context, Result, bail};
use comfy_table::Cell;
use console::style;

use stepgate_core::workflow::executor::StartOptions;
use stepgate_types::audit::Actor;
use stepgate_types::definition::SupervisionMode;

use crate::cli::output::{parse_id, print_json, print_run, print_task, status_cell, table};
use crate::state::AppState;

/// Strict parser for `--mode`; unknown names are an error rather than the
/// lenient template fallback.
pub fn parse_mode(raw: &str) -> Result<SupervisionMode, String> {
    match raw.trim().to_lowercase().replace('-', "_").as_str() {
        "full_supervision" => Ok(SupervisionMode::FullSupervision),
        "approval_required" => Ok(SupervisionMode::ApprovalRequired),
        "confidence_based" => Ok(SupervisionMode::ConfidenceBased),
        "review_checkpoints" => Ok(SupervisionMode::ReviewCheckpoints),
        other => Err(format!(
            "unknown supervision mode '{other}' (expected full_supervision, approval_required, confidence_based or review_checkpoints)"
        )),
    }
}

pub fn parse_state(raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--state must be valid JSON")?;
    if !value.is_object() {
        bail!("--state must be a JSON object");
    }
    Ok(Some(value))
}

pub async fn handle_start(
    state: &AppState,
    project: &str,
    workflow_type: &str,
    mode: Option<SupervisionMode>,
    initial_state: Option<&str>,
    actor: Option<String>,
    json: bool,
) -> Result<()> {
    let opts = StartOptions {
        supervision_mode: mode,
        initial_state: parse_state(initial_state)?,
        actor_id: actor,
    };

    let run = state
        .executor
        .start_workflow(project, workflow_type, opts)
        .await
        .with_context(|| format!("Failed to start '{workflow_type}' for project '{project}'"))?;

    if !json {
        println!();
        println!(
            "  {} Started workflow '{}' for project '{}'",
            style("*").green().bold(),
            style(workflow_type).cyan(),
            style(project).cyan()
        );
    }
    print_run(&run, json)
}

pub async fn handle_status(state: &AppState, task_id: &str, json: bool) -> Result<()> {
    let task_id = parse_id(task_id, "task")?;
    let task = state.executor.get_workflow_state(task_id).await?;

    if json {
        let pending = state.executor.get_pending_checkpoints(task_id).await?;
        return print_json(&serde_json::json!({
            "task": task,
            "pending_checkpoints": pending,
        }));
    }

    print_task(&task)?;
    for checkpoint in state.executor.get_pending_checkpoints(task_id).await? {
        crate::cli::output::print_checkpoint(&checkpoint)?;
    }
    Ok(())
}

pub async fn handle_tasks(state: &AppState, project: &str, json: bool) -> Result<()> {
    let tasks = state.executor.list_tasks(project).await?;

    if json {
        return print_json(&tasks);
    }

    if tasks.is_empty() {
        println!();
        println!("  No tasks for project '{project}'.");
        println!();
        return Ok(());
    }

    let mut t = table(&["Task", "Workflow", "Status", "Step", "Started", "Error"]);
    for task in &tasks {
        t.add_row(vec![
            Cell::new(task.id),
            Cell::new(format!("{} v{}", task.definition_id, task.definition_version)),
            status_cell(task.status),
            Cell::new(task.current_step_id.as_deref().unwrap_or("-")),
            Cell::new(task.started_at.format("%Y-%m-%d %H:%M")),
            Cell::new(task.error.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{t}");
    println!();
    Ok(())
}

pub async fn handle_cancel(
    state: &AppState,
    task_id: &str,
    reason: &str,
    actor: &str,
    json: bool,
) -> Result<()> {
    let task_id = parse_id(task_id, "task")?;
    let task = state
        .executor
        .cancel_workflow(task_id, reason, &Actor::user(actor))
        .await?;

    if json {
        return print_json(&task);
    }

    println!();
    println!("  {} Task {} is {}", style("x").red().bold(), task.id, task.status);
    println!();
    Ok(())
}

pub async fn handle_audit(state: &AppState, task_id: &str, json: bool) -> Result<()> {
    let task_id = parse_id(task_id, "task")?;
    // Surface an unknown task as not-found rather than an empty trail.
    state.executor.get_workflow_state(task_id).await?;
    let trail = state.executor.get_audit_trail(task_id).await?;

    if json {
        return print_json(&trail);
    }

    let mut t = table(&["Time", "Action", "Actor", "Details"]);
    for entry in &trail {
        t.add_row(vec![
            Cell::new(entry.created_at.format("%Y-%m-%d %H:%M:%S%.3f")),
            Cell::new(entry.action),
            Cell::new(format!("{}:{}", entry.actor_type, entry.actor_id)),
            Cell::new(entry.details.to_string()),
        ]);
    }

    println!();
    println!("{t}");
    println!();
    Ok(())
}
