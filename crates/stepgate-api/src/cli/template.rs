//! `stepgate templates` subcommands.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::Cell;
use console::style;

use crate::cli::output::{print_json, table};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum TemplateCommand {
    /// List available workflow types.
    #[command(alias = "ls")]
    List,

    /// Show the steps of a workflow type.
    Show {
        /// Workflow type (template file stem).
        workflow_type: String,
    },
}

pub async fn handle_template_command(
    cmd: TemplateCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        TemplateCommand::List => handle_list(state, json),
        TemplateCommand::Show { workflow_type } => handle_show(&workflow_type, state, json),
    }
}

fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let types = state.definitions().list()?;

    // Broken templates still show up, flagged, so operators can find them.
    let mut rows = Vec::with_capacity(types.len());
    for workflow_type in &types {
        rows.push((workflow_type.clone(), state.definitions().load(workflow_type)));
    }

    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|(workflow_type, loaded)| match loaded {
                Ok(def) => serde_json::json!({
                    "workflow_type": workflow_type,
                    "version": def.version,
                    "name": def.name,
                    "steps": def.steps.len(),
                    "supervision_mode": def.supervision_mode,
                }),
                Err(e) => serde_json::json!({
                    "workflow_type": workflow_type,
                    "error": e.to_string(),
                }),
            })
            .collect();
        return print_json(&out);
    }

    if rows.is_empty() {
        let dir = state
            .definitions()
            .dir()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| state.data_dir.display().to_string());
        println!();
        println!("  No workflow templates found.");
        println!("  Add YAML templates under {}", style(dir).dim());
        println!();
        return Ok(());
    }

    let mut t = table(&["Type", "Version", "Name", "Steps", "Default mode"]);
    for (workflow_type, loaded) in &rows {
        match loaded {
            Ok(def) => {
                t.add_row(vec![
                    Cell::new(workflow_type),
                    Cell::new(&def.version),
                    Cell::new(&def.name),
                    Cell::new(def.steps.len()),
                    Cell::new(
                        def.supervision_mode
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                    ),
                ]);
            }
            Err(e) => {
                t.add_row(vec![
                    Cell::new(workflow_type),
                    Cell::new("-"),
                    Cell::new(format!("invalid: {e}")).fg(comfy_table::Color::Red),
                    Cell::new("-"),
                    Cell::new("-"),
                ]);
            }
        }
    }

    println!();
    println!("{t}");
    println!();
    Ok(())
}

fn handle_show(workflow_type: &str, state: &AppState, json: bool) -> Result<()> {
    let def = state.definitions().load(workflow_type)?;

    if json {
        return print_json(def.as_ref());
    }

    println!();
    println!(
        "  {} {} v{}",
        style(&def.name).cyan().bold(),
        style(format!("({})", def.workflow_type)).dim(),
        def.version
    );
    if let Some(description) = &def.description {
        println!("  {description}");
    }
    if let Some(mode) = def.supervision_mode {
        println!("  Default supervision: {mode}");
    }
    println!();

    let mut t = table(&["#", "Step", "Name", "Handler", "Checkpoint", "Inputs", "On reject"]);
    for (i, step) in def.steps.iter().enumerate() {
        t.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&step.id),
            Cell::new(&step.name),
            Cell::new(step.handler_name()),
            Cell::new(if step.checkpoint { "yes" } else { "" }),
            Cell::new(step.required_inputs.join(", ")),
            Cell::new(step.on_reject.as_deref().unwrap_or("")),
        ]);
    }
    println!("{t}");
    println!();
    Ok(())
}
