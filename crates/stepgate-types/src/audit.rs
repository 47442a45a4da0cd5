//! Audit trail types.
//!
//! Audit entries are compliance records: append-only, never mutated or deleted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    System,
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
        }
    }
}

impl FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(ActorType::User),
            "system" => Ok(ActorType::System),
            other => Err(format!("invalid actor type: '{other}'")),
        }
    }
}

/// An actor identity attached to every audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_type: ActorType,
    pub id: String,
}

impl Actor {
    /// The engine itself.
    pub fn system() -> Self {
        Self {
            actor_type: ActorType::System,
            id: "system".to_string(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::User,
            id: id.into(),
        }
    }
}

/// Actions recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    WorkflowStarted,
    StepCompleted,
    StepRetried,
    WorkflowPaused,
    CheckpointApproved,
    CheckpointRejected,
    CheckpointTimedOut,
    CheckpointExtended,
    WorkflowResumed,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowCompleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::WorkflowStarted => "workflow_started",
            AuditAction::StepCompleted => "step_completed",
            AuditAction::StepRetried => "step_retried",
            AuditAction::WorkflowPaused => "workflow_paused",
            AuditAction::CheckpointApproved => "checkpoint_approved",
            AuditAction::CheckpointRejected => "checkpoint_rejected",
            AuditAction::CheckpointTimedOut => "checkpoint_timed_out",
            AuditAction::CheckpointExtended => "checkpoint_extended",
            AuditAction::WorkflowResumed => "workflow_resumed",
            AuditAction::WorkflowFailed => "workflow_failed",
            AuditAction::WorkflowCancelled => "workflow_cancelled",
            AuditAction::WorkflowCompleted => "workflow_completed",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "workflow_started" => Ok(AuditAction::WorkflowStarted),
            "step_completed" => Ok(AuditAction::StepCompleted),
            "step_retried" => Ok(AuditAction::StepRetried),
            "workflow_paused" => Ok(AuditAction::WorkflowPaused),
            "checkpoint_approved" => Ok(AuditAction::CheckpointApproved),
            "checkpoint_rejected" => Ok(AuditAction::CheckpointRejected),
            "checkpoint_timed_out" => Ok(AuditAction::CheckpointTimedOut),
            "checkpoint_extended" => Ok(AuditAction::CheckpointExtended),
            "workflow_resumed" => Ok(AuditAction::WorkflowResumed),
            "workflow_failed" => Ok(AuditAction::WorkflowFailed),
            "workflow_cancelled" => Ok(AuditAction::WorkflowCancelled),
            "workflow_completed" => Ok(AuditAction::WorkflowCompleted),
            other => Err(format!("invalid audit action: '{other}'")),
        }
    }
}

/// An immutable compliance record of a state-changing action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub action: AuditAction,
    pub actor_type: ActorType,
    pub actor_id: String,
    /// Structured context (step, checkpoint, error, reason...).
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_action_roundtrip() {
        for action in [
            AuditAction::WorkflowStarted,
            AuditAction::StepCompleted,
            AuditAction::StepRetried,
            AuditAction::WorkflowPaused,
            AuditAction::CheckpointApproved,
            AuditAction::CheckpointRejected,
            AuditAction::CheckpointTimedOut,
            AuditAction::CheckpointExtended,
            AuditAction::WorkflowResumed,
            AuditAction::WorkflowFailed,
            AuditAction::WorkflowCancelled,
            AuditAction::WorkflowCompleted,
        ] {
            let parsed: AuditAction = action.to_string().parse().unwrap();
            assert_eq!(parsed, action);
            // serde and Display agree
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{action}\""));
        }
    }

    #[test]
    fn test_actor_constructors() {
        let sys = Actor::system();
        assert_eq!(sys.actor_type, ActorType::System);
        let user = Actor::user("alice");
        assert_eq!(user.actor_type, ActorType::User);
        assert_eq!(user.id, "alice");
        assert_eq!("USER".parse::<ActorType>().unwrap(), ActorType::User);
    }
}
