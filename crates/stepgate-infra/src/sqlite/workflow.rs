//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from stepgate-core using sqlx with split
//! reader/writer pools. Task writes are version-checked, checkpoint
//! resolution only touches pending rows, and the audit log is insert-only.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use stepgate_core::repository::WorkflowRepository;
use stepgate_types::audit::{ActorType, AuditAction, AuditLogEntry};
use stepgate_types::checkpoint::{Checkpoint, CheckpointStatus, CheckpointType, max_expiry};
use stepgate_types::definition::SupervisionMode;
use stepgate_types::error::RepositoryError;
use stepgate_types::task::{TaskStatus, WorkflowTask};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed workflow repository.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct TaskRow {
    id: String,
    project_id: String,
    definition_id: String,
    definition_version: String,
    status: String,
    current_step_id: Option<String>,
    state: String,
    completed_steps: String,
    supervision_mode: String,
    checkpoint_ids: String,
    error: Option<String>,
    version: i64,
    started_at: String,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            definition_id: row.try_get("definition_id")?,
            definition_version: row.try_get("definition_version")?,
            status: row.try_get("status")?,
            current_step_id: row.try_get("current_step_id")?,
            state: row.try_get("state")?,
            completed_steps: row.try_get("completed_steps")?,
            supervision_mode: row.try_get("supervision_mode")?,
            checkpoint_ids: row.try_get("checkpoint_ids")?,
            error: row.try_get("error")?,
            version: row.try_get("version")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_task(self) -> Result<WorkflowTask, RepositoryError> {
        let status: TaskStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let state = parse_json(&self.state, "state")?;
        let completed_steps: Vec<String> = serde_json::from_str(&self.completed_steps)
            .map_err(|e| RepositoryError::Query(format!("invalid completed_steps: {e}")))?;
        let checkpoint_ids: Vec<Uuid> = serde_json::from_str(&self.checkpoint_ids)
            .map_err(|e| RepositoryError::Query(format!("invalid checkpoint_ids: {e}")))?;
        let completed_at = self.completed_at.as_deref().map(parse_datetime).transpose()?;

        Ok(WorkflowTask {
            id: parse_uuid(&self.id)?,
            project_id: self.project_id,
            definition_id: self.definition_id,
            definition_version: self.definition_version,
            status,
            current_step_id: self.current_step_id,
            state,
            completed_steps,
            supervision_mode: SupervisionMode::from(self.supervision_mode),
            checkpoint_ids,
            error: self.error,
            version: u64::try_from(self.version)
                .map_err(|_| RepositoryError::Query(format!("invalid version: {}", self.version)))?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at,
        })
    }
}

struct CheckpointRow {
    id: String,
    task_id: String,
    step_id: String,
    checkpoint_type: String,
    status: String,
    data: String,
    created_at: String,
    expires_at: String,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    comment: Option<String>,
}

impl CheckpointRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            step_id: row.try_get("step_id")?,
            checkpoint_type: row.try_get("checkpoint_type")?,
            status: row.try_get("status")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            comment: row.try_get("comment")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let checkpoint_type: CheckpointType =
            self.checkpoint_type.parse().map_err(RepositoryError::Query)?;
        let status: CheckpointStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let resolved_at = self.resolved_at.as_deref().map(parse_datetime).transpose()?;

        Ok(Checkpoint {
            id: parse_uuid(&self.id)?,
            task_id: parse_uuid(&self.task_id)?,
            step_id: self.step_id,
            checkpoint_type,
            status,
            data: parse_json(&self.data, "data")?,
            created_at: parse_datetime(&self.created_at)?,
            expires_at: parse_datetime(&self.expires_at)?,
            resolved_at,
            resolved_by: self.resolved_by,
            comment: self.comment,
        })
    }
}

struct AuditRow {
    id: String,
    task_id: String,
    action: String,
    actor_type: String,
    actor_id: String,
    details: String,
    created_at: String,
}

impl AuditRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            action: row.try_get("action")?,
            actor_type: row.try_get("actor_type")?,
            actor_id: row.try_get("actor_id")?,
            details: row.try_get("details")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<AuditLogEntry, RepositoryError> {
        let action: AuditAction = self.action.parse().map_err(RepositoryError::Query)?;
        let actor_type: ActorType = self.actor_type.parse().map_err(RepositoryError::Query)?;

        Ok(AuditLogEntry {
            id: parse_uuid(&self.id)?,
            task_id: parse_uuid(&self.task_id)?,
            action,
            actor_type,
            actor_id: self.actor_id,
            details: parse_json(&self.details, "details")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_json(s: &str, column: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column}: {e}")))
}

/// Fixed-width UTC timestamps so that text comparison in SQL orders correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Deadlines are compared as text, which needs a four-digit year.
fn ensure_storable_deadline(expires_at: &DateTime<Utc>) -> Result<(), RepositoryError> {
    if *expires_at > max_expiry() {
        return Err(RepositoryError::Query(format!(
            "deadline {expires_at} is later than {}",
            max_expiry()
        )));
    }
    Ok(())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

/// Pool exhaustion and I/O failures are transient; everything else is a query error.
fn map_sqlx_error(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        other => RepositoryError::Query(other.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn version_param(version: u64) -> Result<i64, RepositoryError> {
    i64::try_from(version).map_err(|_| RepositoryError::Query(format!("version out of range: {version}")))
}

const TASK_COLUMNS: &str = "id, project_id, definition_id, definition_version, status, \
     current_step_id, state, completed_steps, supervision_mode, checkpoint_ids, error, \
     version, started_at, completed_at";

fn rows_to_tasks(rows: &[SqliteRow]) -> Result<Vec<WorkflowTask>, RepositoryError> {
    rows.iter()
        .map(|row| {
            TaskRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_task()
        })
        .collect()
}

fn rows_to_checkpoints(rows: &[SqliteRow]) -> Result<Vec<Checkpoint>, RepositoryError> {
    rows.iter()
        .map(|row| {
            CheckpointRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_checkpoint()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_task(&self, task: &WorkflowTask) -> Result<(), RepositoryError> {
        let sql = format!(
            "INSERT INTO workflow_tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );

        sqlx::query(&sql)
            .bind(task.id.to_string())
            .bind(&task.project_id)
            .bind(&task.definition_id)
            .bind(&task.definition_version)
            .bind(task.status.as_str())
            .bind(&task.current_step_id)
            .bind(to_json(&task.state)?)
            .bind(to_json(&task.completed_steps)?)
            .bind(task.supervision_mode.as_str())
            .bind(to_json(&task.checkpoint_ids)?)
            .bind(&task.error)
            .bind(version_param(task.version)?)
            .bind(format_datetime(&task.started_at))
            .bind(task.completed_at.as_ref().map(format_datetime))
            .execute(&self.pool.writer)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    RepositoryError::Conflict(format!(
                        "project '{}' already has an active workflow",
                        task.project_id
                    ))
                } else {
                    map_sqlx_error(e)
                }
            })?;

        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<WorkflowTask>, RepositoryError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM workflow_tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn find_active_task(
        &self,
        project_id: &str,
    ) -> Result<Option<WorkflowTask>, RepositoryError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM workflow_tasks \
             WHERE project_id = ? AND status IN ('pending', 'running', 'paused') LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(project_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn list_tasks(&self, project_id: &str) -> Result<Vec<WorkflowTask>, RepositoryError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM workflow_tasks WHERE project_id = ? ORDER BY started_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(project_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)?;

        rows_to_tasks(&rows)
    }

    async fn compare_and_swap_task(
        &self,
        expected_version: u64,
        task: &WorkflowTask,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_tasks SET
                 status = ?, current_step_id = ?, state = ?, completed_steps = ?,
                 supervision_mode = ?, checkpoint_ids = ?, error = ?, version = ?,
                 completed_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(task.status.as_str())
        .bind(&task.current_step_id)
        .bind(to_json(&task.state)?)
        .bind(to_json(&task.completed_steps)?)
        .bind(task.supervision_mode.as_str())
        .bind(to_json(&task.checkpoint_ids)?)
        .bind(&task.error)
        .bind(version_param(task.version)?)
        .bind(task.completed_at.as_ref().map(format_datetime))
        .bind(task.id.to_string())
        .bind(version_param(expected_version)?)
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM workflow_tasks WHERE id = ?")
            .bind(task.id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx_error)?;

        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        ensure_storable_deadline(&checkpoint.expires_at)?;
        sqlx::query(
            r#"INSERT INTO checkpoints
               (id, task_id, step_id, checkpoint_type, status, data, created_at,
                expires_at, resolved_at, resolved_by, comment)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.task_id.to_string())
        .bind(&checkpoint.step_id)
        .bind(checkpoint.checkpoint_type.as_str())
        .bind(checkpoint.status.as_str())
        .bind(to_json(&checkpoint.data)?)
        .bind(format_datetime(&checkpoint.created_at))
        .bind(format_datetime(&checkpoint.expires_at))
        .bind(checkpoint.resolved_at.as_ref().map(format_datetime))
        .bind(&checkpoint.resolved_by)
        .bind(&checkpoint.comment)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("checkpoint {} already exists", checkpoint.id))
            } else {
                map_sqlx_error(e)
            }
        })?;

        Ok(())
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, task_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE task_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        rows_to_checkpoints(&rows)
    }

    async fn count_checkpoints(&self, task_id: &Uuid) -> Result<u32, RepositoryError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM checkpoints WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_one(&self.pool.reader)
            .await
            .map_err(map_sqlx_error)?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn resolve_checkpoint(
        &self,
        id: &Uuid,
        status: CheckpointStatus,
        resolved_by: Option<&str>,
        comment: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE checkpoints SET status = ?, resolved_by = ?, comment = ?, resolved_at = ?
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(status.as_str())
        .bind(resolved_by)
        .bind(comment)
        .bind(format_datetime(&resolved_at))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.checkpoint_exists(id).await.and_then(|exists| {
            if exists { Ok(false) } else { Err(RepositoryError::NotFound) }
        })
    }

    async fn extend_checkpoint(
        &self,
        id: &Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        ensure_storable_deadline(&expires_at)?;
        let result = sqlx::query(
            "UPDATE checkpoints SET expires_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(format_datetime(&expires_at))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.checkpoint_exists(id).await.and_then(|exists| {
            if exists { Ok(false) } else { Err(RepositoryError::NotFound) }
        })
    }

    async fn list_expired_checkpoints(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE status = 'pending' AND expires_at <= ? ORDER BY expires_at ASC",
        )
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        rows_to_checkpoints(&rows)
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO audit_log (id, task_id, action, actor_type, actor_id, details, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.task_id.to_string())
        .bind(entry.action.as_str())
        .bind(entry.actor_type.to_string())
        .bind(&entry.actor_id)
        .bind(to_json(&entry.details)?)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn list_audit(&self, task_id: &Uuid) -> Result<Vec<AuditLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, task_id, action, actor_type, actor_id, details, created_at \
             FROM audit_log WHERE task_id = ? ORDER BY seq ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                AuditRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_entry()
            })
            .collect()
    }
}

impl SqliteWorkflowRepository {
    async fn checkpoint_exists(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM checkpoints WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }
}
