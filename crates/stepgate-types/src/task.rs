//! Workflow task types.
//!
//! A `WorkflowTask` is one execution instance of a workflow definition. It is
//! the single source of truth for execution progress and is mutated only by
//! the executor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::SupervisionMode;

// ---------------------------------------------------------------------------
// Task Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow task.
///
/// `Pending -> Running <-> Paused -> {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are retained forever and never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Pending | Running | Paused, Failed | Cancelled) => true,
            (Running, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Task
// ---------------------------------------------------------------------------

/// One execution instance of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// UUIDv7 task ID.
    pub id: Uuid,
    /// Project this task works on. At most one non-terminal task per project.
    pub project_id: String,
    /// Workflow type of the definition being executed.
    pub definition_id: String,
    /// Definition version captured at start.
    pub definition_version: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Step currently executing, or the step the task is paused at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Accumulated state (merged step deltas). Opaque to the engine.
    pub state: serde_json::Value,
    /// Steps that finished, in execution order. Resume never replays these.
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Supervision policy for this task.
    pub supervision_mode: SupervisionMode,
    /// Checkpoints created for this task, oldest first.
    #[serde(default)]
    pub checkpoint_ids: Vec<Uuid>,
    /// Error detail when the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optimistic concurrency version, bumped on every successful write.
    pub version: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowTask {
    /// The most recently created checkpoint, if any.
    pub fn latest_checkpoint_id(&self) -> Option<Uuid> {
        self.checkpoint_ids.last().copied()
    }
}
