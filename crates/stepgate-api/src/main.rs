//! stepgate CLI entry point.
//!
//! Binary name: `stepgate`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the command handler.

mod builtin;
mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use tokio::sync::broadcast::error::TryRecvError;

use cli::output::exit_code;
use cli::{Cli, Commands};
use state::AppState;
use stepgate_core::EngineError;
use stepgate_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_directive};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.otel, verbosity_directive(cli.verbose)) {
        eprintln!("Warning: tracing setup failed: {e}");
    }

    let json = cli.json;
    let result = run(cli).await;
    shutdown_tracing();

    if let Err(err) = result {
        report_error(&err, json);
        std::process::exit(exit_code(&err));
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepgate", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let mut events = cli.events.then(|| state.events.subscribe());
    let json = cli.json;

    let result = dispatch(cli.command, &state, json).await;

    if let Some(rx) = events.as_mut() {
        loop {
            match rx.try_recv() {
                Ok(event) => eprintln!("{}", serde_json::to_string(&event)?),
                Err(TryRecvError::Lagged(n)) => eprintln!("({n} events dropped)"),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    result
}

async fn dispatch(command: Commands, state: &AppState, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Templates { action } => {
            cli::template::handle_template_command(action, state, json).await
        }
        Commands::Start {
            project,
            workflow_type,
            mode,
            state: initial_state,
            actor,
        } => {
            cli::task::handle_start(
                state,
                &project,
                &workflow_type,
                mode,
                initial_state.as_deref(),
                actor,
                json,
            )
            .await
        }
        Commands::Status { task_id } => cli::task::handle_status(state, &task_id, json).await,
        Commands::Tasks { project } => cli::task::handle_tasks(state, &project, json).await,
        Commands::Checkpoints { task_id, pending } => {
            cli::checkpoint::handle_list(state, &task_id, pending, json).await
        }
        Commands::Approve {
            checkpoint_id,
            comment,
            actor,
        } => {
            cli::checkpoint::handle_approve(state, &checkpoint_id, comment.as_deref(), &actor, json)
                .await
        }
        Commands::Reject {
            checkpoint_id,
            reason,
            actor,
        } => cli::checkpoint::handle_reject(state, &checkpoint_id, &reason, &actor, json).await,
        Commands::Extend {
            checkpoint_id,
            hours,
            actor,
        } => cli::checkpoint::handle_extend(state, &checkpoint_id, hours, &actor, json).await,
        Commands::Cancel {
            task_id,
            reason,
            actor,
        } => cli::task::handle_cancel(state, &task_id, &reason, &actor, json).await,
        Commands::Audit { task_id } => cli::task::handle_audit(state, &task_id, json).await,
        Commands::Sweep { watch } => cli::checkpoint::handle_sweep(state, watch, json).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// Print a failure as `{error: {kind, message}}` in JSON mode, styled otherwise.
fn report_error(err: &anyhow::Error, json: bool) {
    let kind = err
        .downcast_ref::<EngineError>()
        .map(|e| e.kind().to_string())
        .unwrap_or_else(|| "error".to_string());

    if json {
        let out = serde_json::json!({
            "error": { "kind": kind, "message": format!("{err:#}") }
        });
        println!("{out}");
    } else {
        eprintln!("  {} {err:#}", console::style(format!("{kind}:")).red().bold());
    }
}
