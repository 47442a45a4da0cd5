//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow tasks, checkpoints, and the
//! audit log. The infrastructure layer (stepgate-infra) implements this trait
//! with SQLite persistence; [`super::memory`] provides an in-process version.

use chrono::{DateTime, Utc};
use stepgate_types::audit::AuditLogEntry;
use stepgate_types::checkpoint::{Checkpoint, CheckpointStatus};
use stepgate_types::error::RepositoryError;
use stepgate_types::task::WorkflowTask;
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Tasks:** atomic create / get / compare-and-swap. Implementations must
///   reject a second non-terminal task for the same project.
/// - **Checkpoints:** create, query, and a pending-only conditional resolve.
/// - **Audit:** append-only insert and creation-ordered reads.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Insert a new task.
    ///
    /// Fails with `RepositoryError::Conflict` if the project already has a
    /// task in a non-terminal status.
    fn create_task(
        &self,
        task: &WorkflowTask,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a task by its UUID.
    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowTask>, RepositoryError>> + Send;

    /// The non-terminal task of a project, if any.
    fn find_active_task(
        &self,
        project_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowTask>, RepositoryError>> + Send;

    /// All tasks of a project, ordered by start time (oldest first).
    fn list_tasks(
        &self,
        project_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowTask>, RepositoryError>> + Send;

    /// Replace the stored task only if its version still equals `expected_version`.
    ///
    /// `task.version` carries the new version. Returns `false` when the stored
    /// version differs (another writer got there first).
    fn compare_and_swap_task(
        &self,
        expected_version: u64,
        task: &WorkflowTask,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Insert a new checkpoint.
    fn create_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a checkpoint by its UUID.
    fn get_checkpoint(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// All checkpoints of a task, oldest first.
    fn list_checkpoints(
        &self,
        task_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    /// Number of checkpoints ever created for a task.
    fn count_checkpoints(
        &self,
        task_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    /// Move a checkpoint out of `Pending`.
    ///
    /// Only applies while the checkpoint is still pending; returns `false`
    /// otherwise so that a checkpoint is resolved exactly once.
    fn resolve_checkpoint(
        &self,
        id: &Uuid,
        status: CheckpointStatus,
        resolved_by: Option<&str>,
        comment: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Push back the expiry of a pending checkpoint. Returns `false` if not pending.
    fn extend_checkpoint(
        &self,
        id: &Uuid,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Pending checkpoints whose `expires_at` is at or before `now`.
    fn list_expired_checkpoints(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    /// Append an audit entry. Entries are never updated or deleted.
    fn append_audit(
        &self,
        entry: &AuditLogEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Audit entries of a task in creation order.
    fn list_audit(
        &self,
        task_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<AuditLogEntry>, RepositoryError>> + Send;
}
