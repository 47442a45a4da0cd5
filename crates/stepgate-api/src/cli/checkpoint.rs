//! Checkpoint commands: list, approve, reject, extend, sweep.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use comfy_table::Cell;
use console::style;
use tokio_util::sync::CancellationToken;

use stepgate_core::ErrorKind;
use stepgate_types::audit::Actor;
use stepgate_types::checkpoint::Checkpoint;

use crate::cli::output::{checkpoint_status_cell, parse_id, print_json, print_run, table};
use crate::state::AppState;

pub async fn handle_list(state: &AppState, task_id: &str, pending: bool, json: bool) -> Result<()> {
    let task_id = parse_id(task_id, "task")?;
    state.executor.get_workflow_state(task_id).await?;
    let checkpoints = if pending {
        state.executor.get_pending_checkpoints(task_id).await?
    } else {
        state.executor.list_checkpoints(task_id).await?
    };

    if json {
        return print_json(&checkpoints);
    }

    if checkpoints.is_empty() {
        println!();
        println!("  No checkpoints for task {task_id}.");
        println!();
        return Ok(());
    }

    let mut t = table(&["Checkpoint", "Step", "Type", "Status", "Expires", "Resolved by", "Comment"]);
    for cp in &checkpoints {
        t.add_row(vec![
            Cell::new(cp.id),
            Cell::new(&cp.step_id),
            Cell::new(cp.checkpoint_type),
            checkpoint_status_cell(cp.status),
            Cell::new(cp.expires_at.format("%Y-%m-%d %H:%M")),
            Cell::new(cp.resolved_by.as_deref().unwrap_or("")),
            Cell::new(cp.comment.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{t}");
    println!();
    Ok(())
}

pub async fn handle_approve(
    state: &AppState,
    checkpoint_id: &str,
    comment: Option<&str>,
    actor: &str,
    json: bool,
) -> Result<()> {
    let checkpoint_id = parse_id(checkpoint_id, "checkpoint")?;
    let run = state
        .executor
        .approve_checkpoint(checkpoint_id, &Actor::user(actor), comment)
        .await
        .with_context(|| format!("Failed to approve checkpoint {checkpoint_id}"))?;

    if !json {
        println!();
        println!(
            "  {} Checkpoint {} approved by {}",
            style("ok").green().bold(),
            checkpoint_id,
            style(actor).cyan()
        );
    }
    print_run(&run, json)
}

pub async fn handle_reject(
    state: &AppState,
    checkpoint_id: &str,
    reason: &str,
    actor: &str,
    json: bool,
) -> Result<()> {
    let checkpoint_id = parse_id(checkpoint_id, "checkpoint")?;
    let run = state
        .executor
        .reject_checkpoint(checkpoint_id, &Actor::user(actor), reason)
        .await
        .with_context(|| format!("Failed to reject checkpoint {checkpoint_id}"))?;

    if !json {
        println!();
        println!(
            "  {} Checkpoint {} rejected by {}: {}",
            style("x").red().bold(),
            checkpoint_id,
            style(actor).cyan(),
            reason
        );
    }
    print_run(&run, json)
}

pub async fn handle_extend(
    state: &AppState,
    checkpoint_id: &str,
    hours: u64,
    actor: &str,
    json: bool,
) -> Result<()> {
    if hours == 0 {
        bail!("--hours must be at least 1");
    }
    let checkpoint_id = parse_id(checkpoint_id, "checkpoint")?;
    let extension = Duration::from_secs(hours.saturating_mul(3600));
    let checkpoint = state
        .executor
        .extend_checkpoint(checkpoint_id, &Actor::user(actor), extension)
        .await?;

    if json {
        return print_json(&checkpoint);
    }

    println!();
    println!(
        "  {} Checkpoint {} now expires {}",
        style("+").green().bold(),
        checkpoint.id,
        checkpoint.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();
    Ok(())
}

/// Time out expired checkpoints, then resume their tasks so each one lands
/// in FAILED with a timeout error.
async fn sweep_once(state: &AppState) -> Result<Vec<Checkpoint>> {
    let expired = state.executor.checkpoints().expire_stale(Utc::now()).await?;
    for checkpoint in &expired {
        match state
            .executor
            .resume_workflow(checkpoint.task_id, &Actor::system())
            .await
        {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::Timeout | ErrorKind::InvalidState) => {
                tracing::debug!(task_id = %checkpoint.task_id, error = %e, "task settled after sweep");
            }
            Err(e) => {
                tracing::warn!(task_id = %checkpoint.task_id, error = %e, "could not settle task after sweep");
            }
        }
    }
    Ok(expired)
}

fn report_sweep(expired: &[Checkpoint], json: bool) -> Result<()> {
    if json {
        return print_json(expired);
    }
    if expired.is_empty() {
        println!("  No expired checkpoints.");
        return Ok(());
    }
    for cp in expired {
        println!(
            "  {} Checkpoint {} (task {}, step '{}') timed out",
            style("!").yellow().bold(),
            cp.id,
            cp.task_id,
            cp.step_id
        );
    }
    Ok(())
}

pub async fn handle_sweep(state: &AppState, watch: Option<u64>, json: bool) -> Result<()> {
    let Some(every) = watch else {
        let expired = sweep_once(state).await?;
        return report_sweep(&expired, json);
    };

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
    if !json {
        println!(
            "  Sweeping every {}s. {}",
            every.max(1),
            style("Press Ctrl+C to stop").dim()
        );
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match sweep_once(state).await {
                    Ok(expired) if !expired.is_empty() => report_sweep(&expired, json)?,
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "checkpoint sweep failed"),
                }
            }
        }
    }
    Ok(())
}
