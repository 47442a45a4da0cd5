//! CLI command definitions for the `stepgate` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! what they operate on: templates, tasks, and checkpoints.

pub mod checkpoint;
pub mod output;
pub mod task;
pub mod template;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Checkpointed workflow engine with human approval gates.
#[derive(Parser)]
#[command(name = "stepgate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Print the engine events a command emitted to stderr.
    #[arg(long, global = true)]
    pub events: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect workflow templates.
    Templates {
        #[command(subcommand)]
        action: template::TemplateCommand,
    },

    /// Start a workflow for a project.
    Start {
        /// Project identifier.
        project: String,

        /// Workflow type (template file stem).
        workflow_type: String,

        /// Supervision mode: full_supervision, approval_required,
        /// confidence_based, or review_checkpoints.
        #[arg(long, value_parser = task::parse_mode)]
        mode: Option<stepgate_types::definition::SupervisionMode>,

        /// Initial task state as a JSON object.
        #[arg(long)]
        state: Option<String>,

        /// Who is starting the workflow.
        #[arg(long, env = "STEPGATE_ACTOR")]
        actor: Option<String>,
    },

    /// Show one task.
    Status {
        /// Task UUID.
        task_id: String,
    },

    /// List the tasks of a project.
    Tasks {
        /// Project identifier.
        project: String,
    },

    /// List the checkpoints of a task.
    Checkpoints {
        /// Task UUID.
        task_id: String,

        /// Only show checkpoints awaiting a decision.
        #[arg(long)]
        pending: bool,
    },

    /// Approve a checkpoint and resume its task.
    Approve {
        /// Checkpoint UUID.
        checkpoint_id: String,

        /// Note recorded with the approval.
        #[arg(long)]
        comment: Option<String>,

        /// Reviewer identity.
        #[arg(long, env = "STEPGATE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Reject a checkpoint.
    Reject {
        /// Checkpoint UUID.
        checkpoint_id: String,

        /// Why the step result was rejected.
        #[arg(long)]
        reason: String,

        /// Reviewer identity.
        #[arg(long, env = "STEPGATE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Push back the deadline of a pending checkpoint.
    Extend {
        /// Checkpoint UUID.
        checkpoint_id: String,

        /// Hours from now until the checkpoint expires.
        #[arg(long)]
        hours: u64,

        /// Reviewer identity.
        #[arg(long, env = "STEPGATE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Cancel a task.
    Cancel {
        /// Task UUID.
        task_id: String,

        /// Recorded in the audit trail.
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,

        /// Who is cancelling.
        #[arg(long, env = "STEPGATE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Show the audit trail of a task.
    Audit {
        /// Task UUID.
        task_id: String,
    },

    /// Time out expired checkpoints and fail their tasks.
    Sweep {
        /// Keep sweeping every N seconds until Ctrl+C.
        #[arg(long)]
        watch: Option<u64>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
