//! Append-only compliance log.
//!
//! Audit writes are mandatory: a write that still fails after the
//! persistence retry policy surfaces as an error to the calling transition.

use std::sync::Arc;

use chrono::Utc;
use stepgate_types::audit::{Actor, AuditAction, AuditLogEntry};
use uuid::Uuid;

use super::retry::{RetryPolicy, with_persistence_retry};
use crate::error::EngineError;
use crate::repository::WorkflowRepository;

pub struct AuditLogger<R: WorkflowRepository> {
    repo: Arc<R>,
    retry: RetryPolicy,
}

impl<R: WorkflowRepository> AuditLogger<R> {
    pub fn new(repo: Arc<R>, retry: RetryPolicy) -> Self {
        Self { repo, retry }
    }

    /// Append one entry for `task_id`.
    pub async fn log_action(
        &self,
        task_id: Uuid,
        action: AuditAction,
        actor: &Actor,
        details: serde_json::Value,
    ) -> Result<AuditLogEntry, EngineError> {
        let entry = AuditLogEntry {
            id: Uuid::now_v7(),
            task_id,
            action,
            actor_type: actor.actor_type,
            actor_id: actor.id.clone(),
            details,
            created_at: Utc::now(),
        };

        with_persistence_retry(&self.retry, "append_audit", || self.repo.append_audit(&entry))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    task_id = %task_id,
                    action = %action,
                    error = %e,
                    "audit write failed"
                );
            })?;

        tracing::debug!(task_id = %task_id, action = %action, actor = %actor.id, "audit entry appended");
        Ok(entry)
    }

    /// Entries of a task in creation order.
    pub async fn get_audit_trail(&self, task_id: &Uuid) -> Result<Vec<AuditLogEntry>, EngineError> {
        Ok(self.repo.list_audit(task_id).await?)
    }
}
