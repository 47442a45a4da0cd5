//! Event types emitted by the workflow engine.
//!
//! Events are abstract notifications for connected clients; transport is the
//! embedder's concern. All types are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    /// A step finished, or the task changed status.
    Progress,
    /// The task paused and a checkpoint awaits a decision.
    CheckpointPending,
    /// A failure the client should render (kind + message in payload).
    Error,
    /// The task completed.
    Completed,
}

/// An event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub kind: WorkflowEventKind,
    pub payload: serde_json::Value,
}

impl WorkflowEvent {
    pub fn new(task_id: Uuid, kind: WorkflowEventKind, payload: serde_json::Value) -> Self {
        Self {
            task_id,
            kind,
            payload,
        }
    }
}
