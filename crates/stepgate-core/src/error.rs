//! Engine error taxonomy.
//!
//! Every failure surfaced by the engine carries a stable [`ErrorKind`] plus a
//! human-readable message. Only step execution and transient persistence
//! failures are retried; everything else propagates immediately.

use std::fmt;

use serde::{Deserialize, Serialize};
use stepgate_types::error::RepositoryError;
use uuid::Uuid;

use crate::workflow::definition::TemplateError;

/// Stable, machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    Conflict,
    NotFound,
    InvalidState,
    Timeout,
    StepExecutionError,
    PersistenceError,
    BoundsError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Timeout => "timeout",
            ErrorKind::StepExecutionError => "step_execution_error",
            ErrorKind::PersistenceError => "persistence_error",
            ErrorKind::BoundsError => "bounds_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by engine entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Structurally invalid workflow template.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Single-active-workflow violation or concurrent modification.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown task, checkpoint, or workflow type.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Operation not allowed in the current status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A checkpoint aged out before it was resolved.
    #[error("checkpoint {0} timed out")]
    Timeout(Uuid),

    /// A step handler kept failing after all retries.
    #[error("step '{step_id}' failed after {attempts} attempt(s): {message}")]
    StepExecution {
        step_id: String,
        attempts: u32,
        message: String,
    },

    /// Storage failure that survived local retries.
    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    /// Checkpoint cap exceeded.
    #[error("task {task_id} reached the limit of {limit} checkpoints")]
    Bounds { task_id: Uuid, limit: u32 },

    /// The task was cancelled while this operation was in flight.
    #[error("workflow cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::Template(_) => ErrorKind::ValidationError,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::InvalidState(_) => ErrorKind::InvalidState,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::StepExecution { .. } => ErrorKind::StepExecutionError,
            EngineError::Persistence(RepositoryError::Conflict(_)) => ErrorKind::Conflict,
            EngineError::Persistence(RepositoryError::NotFound) => ErrorKind::NotFound,
            EngineError::Persistence(_) => ErrorKind::PersistenceError,
            EngineError::Bounds { .. } => ErrorKind::BoundsError,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the executor retries this failure locally with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::StepExecution { .. } => true,
            EngineError::Persistence(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Payload for `error` events: `{kind, message}`.
    pub fn to_event_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(
            EngineError::Validation("x".into()).kind().to_string(),
            "validation_error"
        );
        assert_eq!(
            EngineError::Bounds {
                task_id: Uuid::nil(),
                limit: 100
            }
            .kind(),
            ErrorKind::BoundsError
        );
        assert_eq!(
            EngineError::Persistence(RepositoryError::Conflict("dup".into())).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            EngineError::Persistence(RepositoryError::Connection).kind(),
            ErrorKind::PersistenceError
        );
    }

    #[test]
    fn only_step_and_transient_persistence_errors_retry() {
        let step = EngineError::StepExecution {
            step_id: "calc".into(),
            attempts: 1,
            message: "boom".into(),
        };
        assert!(step.is_retryable());
        assert!(EngineError::Persistence(RepositoryError::Connection).is_retryable());
        assert!(!EngineError::Persistence(RepositoryError::NotFound).is_retryable());
        assert!(!EngineError::Conflict("busy".into()).is_retryable());
        assert!(!EngineError::Timeout(Uuid::nil()).is_retryable());
    }

    #[test]
    fn event_payload_carries_kind_and_message() {
        let err = EngineError::not_found("task", "abc");
        let payload = err.to_event_payload();
        assert_eq!(payload["kind"], "not_found");
        assert_eq!(payload["message"], "task not found: abc");
    }
}
