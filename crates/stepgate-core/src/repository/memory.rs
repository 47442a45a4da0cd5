//! In-process implementation of `WorkflowRepository`.
//!
//! Honours the same guarantees as the SQLite adapter (single active task per
//! project, version-checked task writes, pending-only checkpoint resolution,
//! append-only audit) behind a `tokio::sync::RwLock`. Used by tests and by
//! embedders that keep state in memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use stepgate_types::audit::AuditLogEntry;
use stepgate_types::checkpoint::{Checkpoint, CheckpointStatus};
use stepgate_types::error::RepositoryError;
use stepgate_types::task::WorkflowTask;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, WorkflowTask>,
    checkpoints: Vec<Checkpoint>,
    audit: Vec<AuditLogEntry>,
}

/// `RwLock`-guarded in-memory workflow store.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    inner: RwLock<Inner>,
    failing_writes: AtomicU32,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write operations fail with `RepositoryError::Connection`.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), RepositoryError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(RepositoryError::Connection),
            Err(_) => Ok(()),
        }
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create_task(&self, task: &WorkflowTask) -> Result<(), RepositoryError> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(RepositoryError::Conflict(format!("task {} already exists", task.id)));
        }
        if !task.status.is_terminal()
            && inner
                .tasks
                .values()
                .any(|t| t.project_id == task.project_id && !t.status.is_terminal())
        {
            return Err(RepositoryError::Conflict(format!(
                "project '{}' already has an active workflow",
                task.project_id
            )));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<WorkflowTask>, RepositoryError> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn find_active_task(
        &self,
        project_id: &str,
    ) -> Result<Option<WorkflowTask>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .values()
            .find(|t| t.project_id == project_id && !t.status.is_terminal())
            .cloned())
    }

    async fn list_tasks(&self, project_id: &str) -> Result<Vec<WorkflowTask>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<WorkflowTask> = inner
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn compare_and_swap_task(
        &self,
        expected_version: u64,
        task: &WorkflowTask,
    ) -> Result<bool, RepositoryError> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = task.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        if inner.checkpoints.iter().any(|c| c.id == checkpoint.id) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} already exists",
                checkpoint.id
            )));
        }
        inner.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .iter()
            .find(|c| c.id == *id)
            .cloned())
    }

    async fn list_checkpoints(&self, task_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .iter()
            .filter(|c| c.task_id == *task_id)
            .cloned()
            .collect())
    }

    async fn count_checkpoints(&self, task_id: &Uuid) -> Result<u32, RepositoryError> {
        let count = self
            .inner
            .read()
            .await
            .checkpoints
            .iter()
            .filter(|c| c.task_id == *task_id)
            .count();
        Ok(count as u32)
    }

    async fn resolve_checkpoint(
        &self,
        id: &Uuid,
        status: CheckpointStatus,
        resolved_by: Option<&str>,
        comment: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        let Some(cp) = inner.checkpoints.iter_mut().find(|c| c.id == *id) else {
            return Err(RepositoryError::NotFound);
        };
        if cp.status != CheckpointStatus::Pending {
            return Ok(false);
        }
        cp.status = status;
        cp.resolved_by = resolved_by.map(str::to_string);
        cp.comment = comment.map(str::to_string);
        cp.resolved_at = Some(resolved_at);
        Ok(true)
    }

    async fn extend_checkpoint(
        &self,
        id: &Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        let Some(cp) = inner.checkpoints.iter_mut().find(|c| c.id == *id) else {
            return Err(RepositoryError::NotFound);
        };
        if cp.status != CheckpointStatus::Pending {
            return Ok(false);
        }
        cp.expires_at = expires_at;
        Ok(true)
    }

    async fn list_expired_checkpoints(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .iter()
            .filter(|c| c.is_expired(now))
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), RepositoryError> {
        self.check_write()?;
        self.inner.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, task_id: &Uuid) -> Result<Vec<AuditLogEntry>, RepositoryError> {
        Ok(self
            .inner
            .read()
            .await
            .audit
            .iter()
            .filter(|e| e.task_id == *task_id)
            .cloned()
            .collect())
    }
}
