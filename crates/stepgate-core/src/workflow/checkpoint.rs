//! Checkpoint manager: pause decisions and checkpoint lifecycle.
//!
//! A checkpoint starts `pending` and is resolved exactly once, by an actor
//! (`approve` / `reject`) or by the clock (`timeout`). Resolution is a
//! conditional write on the pending status, so concurrent resolvers cannot
//! both win. The manager records checkpoints and audits them; it never
//! touches task status, which the executor reconciles on resume.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use stepgate_types::audit::{Actor, AuditAction};
use stepgate_types::checkpoint::{
    Checkpoint, CheckpointStatus, CheckpointType, expiry_after, max_expiry,
};
use stepgate_types::config::EngineConfig;
use stepgate_types::definition::{StepDefinition, SupervisionMode, WorkflowDefinition};
use stepgate_types::task::WorkflowTask;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::audit::AuditLogger;
use super::handler::StepOutcome;
use super::retry::{RetryPolicy, with_persistence_retry};
use crate::error::EngineError;
use crate::repository::WorkflowRepository;

/// Published whenever a checkpoint leaves `pending`.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointResolution {
    pub checkpoint_id: Uuid,
    pub task_id: Uuid,
    pub status: CheckpointStatus,
    pub resolved_by: String,
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

pub struct CheckpointManager<R: WorkflowRepository> {
    repo: Arc<R>,
    audit: Arc<AuditLogger<R>>,
    retry: RetryPolicy,
    confidence_threshold: f64,
    timeout: TimeDelta,
    max_per_task: u32,
    resolutions: broadcast::Sender<CheckpointResolution>,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>, audit: Arc<AuditLogger<R>>, config: &EngineConfig) -> Self {
        let (resolutions, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            repo,
            audit,
            retry: RetryPolicy::from_settings(&config.retry),
            confidence_threshold: config.confidence_threshold,
            timeout: TimeDelta::from_std(config.checkpoint_timeout()).unwrap_or(TimeDelta::MAX),
            max_per_task: config.max_checkpoints_per_task,
            resolutions,
        }
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Receive every approve / reject / timeout from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CheckpointResolution> {
        self.resolutions.subscribe()
    }

    // -----------------------------------------------------------------------
    // Pause policy
    // -----------------------------------------------------------------------

    /// The checkpoint to create after `step` ran, or `None` to keep going.
    ///
    /// A document request always pauses. Otherwise:
    /// - `full_supervision`: every step
    /// - `approval_required`: steps flagged `checkpoint`
    /// - `confidence_based`: confidence missing or below the threshold
    /// - `review_checkpoints`: the final step only
    pub fn pause_reason(
        &self,
        mode: SupervisionMode,
        step: &StepDefinition,
        is_final: bool,
        outcome: &StepOutcome,
    ) -> Option<CheckpointType> {
        if outcome.needs_document {
            return Some(CheckpointType::DocumentRequest);
        }
        match mode {
            SupervisionMode::FullSupervision => Some(CheckpointType::StepReview),
            SupervisionMode::ApprovalRequired => {
                step.checkpoint.then_some(CheckpointType::StepReview)
            }
            SupervisionMode::ConfidenceBased => {
                let confident = outcome
                    .confidence
                    .is_some_and(|c| c.is_finite() && c >= self.confidence_threshold);
                (!confident).then_some(CheckpointType::DataConfirmation)
            }
            SupervisionMode::ReviewCheckpoints => is_final.then_some(CheckpointType::FinalReview),
        }
    }

    pub fn should_pause(
        &self,
        task: &WorkflowTask,
        def: &WorkflowDefinition,
        step: &StepDefinition,
        outcome: &StepOutcome,
    ) -> bool {
        self.pause_reason(task.supervision_mode, step, def.is_final_step(&step.id), outcome)
            .is_some()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Persist a new pending checkpoint for `task` at `step_id`.
    ///
    /// Fails with a bounds error once the task already has the maximum
    /// number of checkpoints.
    pub async fn create_checkpoint(
        &self,
        task: &WorkflowTask,
        step_id: &str,
        checkpoint_type: CheckpointType,
        data: serde_json::Value,
    ) -> Result<Checkpoint, EngineError> {
        let existing = with_persistence_retry(&self.retry, "count_checkpoints", || {
            self.repo.count_checkpoints(&task.id)
        })
        .await?;
        if existing >= self.max_per_task {
            tracing::error!(
                task_id = %task.id,
                limit = self.max_per_task,
                "checkpoint limit reached"
            );
            return Err(EngineError::Bounds {
                task_id: task.id,
                limit: self.max_per_task,
            });
        }

        let now = Utc::now();
        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            task_id: task.id,
            step_id: step_id.to_string(),
            checkpoint_type,
            status: CheckpointStatus::Pending,
            data,
            created_at: now,
            expires_at: expiry_after(now, self.timeout).unwrap_or_else(max_expiry),
            resolved_at: None,
            resolved_by: None,
            comment: None,
        };
        with_persistence_retry(&self.retry, "create_checkpoint", || {
            self.repo.create_checkpoint(&checkpoint)
        })
        .await?;

        tracing::debug!(
            task_id = %task.id,
            checkpoint_id = %checkpoint.id,
            step_id,
            checkpoint_type = %checkpoint_type,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Approve a pending checkpoint.
    pub async fn approve(
        &self,
        checkpoint_id: Uuid,
        actor: &Actor,
        comment: Option<&str>,
    ) -> Result<Checkpoint, EngineError> {
        self.resolve(
            checkpoint_id,
            CheckpointStatus::Approved,
            AuditAction::CheckpointApproved,
            actor,
            comment.filter(|c| !c.trim().is_empty()),
        )
        .await
    }

    /// Reject a pending checkpoint. `reason` is mandatory.
    pub async fn reject(
        &self,
        checkpoint_id: Uuid,
        actor: &Actor,
        reason: &str,
    ) -> Result<Checkpoint, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::Validation(
                "a rejection reason is required".to_string(),
            ));
        }
        self.resolve(
            checkpoint_id,
            CheckpointStatus::Rejected,
            AuditAction::CheckpointRejected,
            actor,
            Some(reason),
        )
        .await
    }

    async fn resolve(
        &self,
        checkpoint_id: Uuid,
        status: CheckpointStatus,
        action: AuditAction,
        actor: &Actor,
        comment: Option<&str>,
    ) -> Result<Checkpoint, EngineError> {
        let checkpoint = self.get(checkpoint_id).await?;
        if checkpoint.status.is_resolved() {
            return Err(EngineError::InvalidState(format!(
                "checkpoint {checkpoint_id} is already {}",
                checkpoint.status
            )));
        }

        let now = Utc::now();
        if checkpoint.is_expired(now) {
            self.time_out(&checkpoint, now).await?;
            return Err(EngineError::Timeout(checkpoint_id));
        }

        let applied = with_persistence_retry(&self.retry, "resolve_checkpoint", || {
            self.repo
                .resolve_checkpoint(&checkpoint_id, status, Some(actor.id.as_str()), comment, now)
        })
        .await?;
        if !applied {
            return Err(EngineError::InvalidState(format!(
                "checkpoint {checkpoint_id} was resolved concurrently"
            )));
        }

        self.audit
            .log_action(
                checkpoint.task_id,
                action,
                actor,
                serde_json::json!({
                    "checkpoint_id": checkpoint_id,
                    "step_id": checkpoint.step_id,
                    "comment": comment,
                }),
            )
            .await?;

        tracing::info!(
            task_id = %checkpoint.task_id,
            checkpoint_id = %checkpoint_id,
            status = %status,
            actor = %actor.id,
            "checkpoint resolved"
        );
        self.publish(&checkpoint, status, &actor.id);

        Ok(Checkpoint {
            status,
            resolved_at: Some(now),
            resolved_by: Some(actor.id.clone()),
            comment: comment.map(String::from),
            ..checkpoint
        })
    }

    /// Move one pending checkpoint to `timeout`. Returns `false` if it was
    /// resolved by someone else first.
    async fn time_out(&self, checkpoint: &Checkpoint, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let system = Actor::system();
        let applied = with_persistence_retry(&self.retry, "resolve_checkpoint", || {
            self.repo.resolve_checkpoint(
                &checkpoint.id,
                CheckpointStatus::Timeout,
                Some(system.id.as_str()),
                None,
                now,
            )
        })
        .await?;
        if !applied {
            return Ok(false);
        }

        self.audit
            .log_action(
                checkpoint.task_id,
                AuditAction::CheckpointTimedOut,
                &system,
                serde_json::json!({
                    "checkpoint_id": checkpoint.id,
                    "step_id": checkpoint.step_id,
                    "expires_at": checkpoint.expires_at,
                }),
            )
            .await?;

        tracing::warn!(
            task_id = %checkpoint.task_id,
            checkpoint_id = %checkpoint.id,
            "checkpoint timed out"
        );
        self.publish(checkpoint, CheckpointStatus::Timeout, &system.id);
        Ok(true)
    }

    /// Move a pending checkpoint of a cancelled task to `skipped`.
    ///
    /// Not audited on its own: the cancellation entry lists the skipped ids.
    pub(crate) async fn skip(&self, checkpoint: &Checkpoint, actor: &Actor) -> Result<bool, EngineError> {
        let applied = with_persistence_retry(&self.retry, "resolve_checkpoint", || {
            self.repo.resolve_checkpoint(
                &checkpoint.id,
                CheckpointStatus::Skipped,
                Some(actor.id.as_str()),
                Some("task cancelled"),
                Utc::now(),
            )
        })
        .await?;
        if applied {
            tracing::debug!(
                task_id = %checkpoint.task_id,
                checkpoint_id = %checkpoint.id,
                "checkpoint skipped"
            );
            self.publish(checkpoint, CheckpointStatus::Skipped, &actor.id);
        }
        Ok(applied)
    }

    /// Time out every pending checkpoint whose deadline is at or before `now`.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<Checkpoint>, EngineError> {
        let candidates = self.repo.list_expired_checkpoints(now).await?;
        let mut expired = Vec::with_capacity(candidates.len());
        for checkpoint in candidates {
            if self.time_out(&checkpoint, now).await? {
                expired.push(Checkpoint {
                    status: CheckpointStatus::Timeout,
                    resolved_at: Some(now),
                    resolved_by: Some(Actor::system().id),
                    ..checkpoint
                });
            }
        }
        Ok(expired)
    }

    /// Renew a still-pending checkpoint: `expires_at = now + extension`.
    ///
    /// Timed-out checkpoints are final and cannot be extended.
    pub async fn extend(
        &self,
        checkpoint_id: Uuid,
        actor: &Actor,
        extension: Duration,
    ) -> Result<Checkpoint, EngineError> {
        let checkpoint = self.get(checkpoint_id).await?;
        if checkpoint.status != CheckpointStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "checkpoint {checkpoint_id} is {} and cannot be extended",
                checkpoint.status
            )));
        }

        let extension = TimeDelta::from_std(extension)
            .map_err(|_| EngineError::Validation("extension is too long".to_string()))?;
        let expires_at = expiry_after(Utc::now(), extension).ok_or_else(|| {
            EngineError::Validation(format!("extension would run past {}", max_expiry()))
        })?;

        let applied = with_persistence_retry(&self.retry, "extend_checkpoint", || {
            self.repo.extend_checkpoint(&checkpoint_id, expires_at)
        })
        .await?;
        if !applied {
            return Err(EngineError::InvalidState(format!(
                "checkpoint {checkpoint_id} was resolved concurrently"
            )));
        }

        self.audit
            .log_action(
                checkpoint.task_id,
                AuditAction::CheckpointExtended,
                actor,
                serde_json::json!({
                    "checkpoint_id": checkpoint_id,
                    "previous_expires_at": checkpoint.expires_at,
                    "expires_at": expires_at,
                }),
            )
            .await?;

        tracing::info!(checkpoint_id = %checkpoint_id, %expires_at, actor = %actor.id, "checkpoint extended");
        Ok(Checkpoint {
            expires_at,
            ..checkpoint
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, checkpoint_id: Uuid) -> Result<Checkpoint, EngineError> {
        self.repo
            .get_checkpoint(&checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::not_found("checkpoint", checkpoint_id))
    }

    pub async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        Ok(self.repo.list_checkpoints(&task_id).await?)
    }

    pub async fn get_pending_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        let mut checkpoints = self.list_checkpoints(task_id).await?;
        checkpoints.retain(|c| c.status == CheckpointStatus::Pending);
        Ok(checkpoints)
    }

    /// Force a pending checkpoint to `timeout` if its deadline has passed.
    ///
    /// Returns the checkpoint as stored afterwards.
    pub(crate) async fn settle_if_expired(&self, checkpoint: Checkpoint) -> Result<Checkpoint, EngineError> {
        let now = Utc::now();
        if !checkpoint.is_expired(now) {
            return Ok(checkpoint);
        }
        self.time_out(&checkpoint, now).await?;
        self.get(checkpoint.id).await
    }

    fn publish(&self, checkpoint: &Checkpoint, status: CheckpointStatus, resolved_by: &str) {
        let _ = self.resolutions.send(CheckpointResolution {
            checkpoint_id: checkpoint.id,
            task_id: checkpoint.task_id,
            status,
            resolved_by: resolved_by.to_string(),
        });
    }
}

impl<R: WorkflowRepository + 'static> CheckpointManager<R> {
    /// Periodically time out stale checkpoints until `cancel` fires.
    pub fn spawn_timeout_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.expire_stale(Utc::now()).await {
                            Ok(expired) if !expired.is_empty() => {
                                tracing::info!(count = expired.len(), "timed out stale checkpoints");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "checkpoint sweep failed"),
                        }
                    }
                }
            }
            tracing::debug!("checkpoint sweeper stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
