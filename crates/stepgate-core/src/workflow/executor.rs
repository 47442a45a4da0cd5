//! Workflow executor: the step loop and the task state machine.
//!
//! ```text
//! PENDING -> RUNNING <-> PAUSED -> { COMPLETED | FAILED | CANCELLED }
//! ```
//!
//! Entry points (`start_workflow`, `resume_workflow`, `cancel_workflow`)
//! perform one bounded unit of work: they step until the next checkpoint or
//! a terminal status, persist, and return. Every task write is a
//! compare-and-swap on `WorkflowTask.version` followed by exactly one audit
//! entry. Stepping happens under the per-project lock, which is released
//! whenever the task pauses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use stepgate_types::audit::{Actor, AuditAction, AuditLogEntry};
use stepgate_types::checkpoint::{Checkpoint, CheckpointStatus, CheckpointType};
use stepgate_types::config::EngineConfig;
use stepgate_types::definition::{StepDefinition, SupervisionMode, WorkflowDefinition};
use stepgate_types::error::RepositoryError;
use stepgate_types::event::{WorkflowEvent, WorkflowEventKind};
use stepgate_types::task::{TaskStatus, WorkflowTask};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::audit::AuditLogger;
use super::checkpoint::CheckpointManager;
use super::definition::WorkflowDefinitionStore;
use super::handler::{BoxStepHandler, HandlerRegistry, StepContext, StepError, StepOutcome};
use super::lock::ProjectLocks;
use super::retry::{RetryPolicy, with_persistence_retry};
use crate::error::EngineError;
use crate::event::EventSink;
use crate::repository::WorkflowRepository;

/// How many times `cancel_workflow` re-reads a task that keeps changing
/// under it before giving up.
const CANCEL_ATTEMPTS: u32 = 5;

/// Failure kind recorded when a rejection ends a task.
const CHECKPOINT_REJECTED: &str = "checkpoint_rejected";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Caller choices for a new workflow.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Overrides the template default. Falls back to `full_supervision`.
    pub supervision_mode: Option<SupervisionMode>,
    /// Initial task state. Must be a JSON object.
    pub initial_state: Option<serde_json::Value>,
    /// Recorded as the user who started the workflow; the system otherwise.
    pub actor_id: Option<String>,
}

/// Result of an entry point: where the task stands now.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub task: WorkflowTask,
    /// The checkpoint the task is waiting on, when it paused.
    pub checkpoint: Option<Checkpoint>,
}

impl StepRun {
    fn settled(task: WorkflowTask) -> Self {
        Self {
            task,
            checkpoint: None,
        }
    }
}

/// Per-invocation context for the step loop.
struct Run {
    def: Arc<WorkflowDefinition>,
    handlers: Vec<BoxStepHandler>,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Drives workflow tasks through their definitions.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowExecutor<R: WorkflowRepository> {
    repo: Arc<R>,
    definitions: Arc<WorkflowDefinitionStore>,
    handlers: HandlerRegistry,
    checkpoints: Arc<CheckpointManager<R>>,
    audit: Arc<AuditLogger<R>>,
    events: Arc<dyn EventSink>,
    locks: ProjectLocks,
    retry: RetryPolicy,
    step_timeout: Duration,
    /// Cancellation tokens of in-flight step loops, keyed by task id.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<R: WorkflowRepository> WorkflowExecutor<R> {
    pub fn new(
        repo: Arc<R>,
        definitions: Arc<WorkflowDefinitionStore>,
        handlers: HandlerRegistry,
        events: Arc<dyn EventSink>,
        config: &EngineConfig,
    ) -> Self {
        let config = config.clone().normalized();
        let retry = RetryPolicy::from_settings(&config.retry);
        let audit = Arc::new(AuditLogger::new(Arc::clone(&repo), retry.clone()));
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&repo),
            Arc::clone(&audit),
            &config,
        ));
        Self {
            repo,
            definitions,
            handlers,
            checkpoints,
            audit,
            events,
            locks: ProjectLocks::new(),
            retry,
            step_timeout: config.step_timeout(),
            cancellations: DashMap::new(),
        }
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager<R>> {
        &self.checkpoints
    }

    pub fn definitions(&self) -> &Arc<WorkflowDefinitionStore> {
        &self.definitions
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Create a task for `project_id` from the `workflow_type` template and
    /// step it until the first pause or a terminal status.
    ///
    /// Fails with `Conflict` if the project already has a non-terminal task
    /// or another caller is starting one right now.
    pub async fn start_workflow(
        &self,
        project_id: &str,
        workflow_type: &str,
        opts: StartOptions,
    ) -> Result<StepRun, EngineError> {
        if project_id.trim().is_empty() {
            return Err(EngineError::Validation("project id must not be empty".to_string()));
        }
        let _guard = self.locks.try_acquire(project_id)?;

        if let Some(active) = self.repo.find_active_task(project_id).await? {
            return Err(EngineError::Conflict(format!(
                "project '{project_id}' already has active workflow {} ({})",
                active.id, active.status
            )));
        }

        let def = self.definitions.load(workflow_type)?;
        let handlers = self.handlers.resolve(&def)?;
        let state = match opts.initial_state {
            None => serde_json::json!({}),
            Some(state @ serde_json::Value::Object(_)) => state,
            Some(_) => {
                return Err(EngineError::Validation(
                    "initial state must be a JSON object".to_string(),
                ));
            }
        };
        let actor = opts.actor_id.map(Actor::user).unwrap_or_else(Actor::system);
        let supervision_mode = opts
            .supervision_mode
            .or(def.supervision_mode)
            .unwrap_or_default();

        let mut task = WorkflowTask {
            id: Uuid::now_v7(),
            project_id: project_id.to_string(),
            definition_id: def.workflow_type.clone(),
            definition_version: def.version.clone(),
            status: TaskStatus::Pending,
            current_step_id: def.steps.first().map(|s| s.id.clone()),
            state,
            completed_steps: Vec::new(),
            supervision_mode,
            checkpoint_ids: Vec::new(),
            error: None,
            version: 0,
            started_at: Utc::now(),
            completed_at: None,
        };

        with_persistence_retry(&self.retry, "create_task", || self.repo.create_task(&task))
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(msg) => EngineError::Conflict(msg),
                other => EngineError::Persistence(other),
            })?;

        let cancel = CancellationToken::new();
        self.cancellations.insert(task.id, cancel.clone());

        task.status = TaskStatus::Running;
        let started = self
            .commit(
                &mut task,
                AuditAction::WorkflowStarted,
                &actor,
                serde_json::json!({
                    "workflow_type": def.workflow_type,
                    "version": def.version,
                    "supervision_mode": supervision_mode,
                }),
            )
            .await;
        if let Err(e) = started {
            self.cancellations.remove(&task.id);
            return match e {
                EngineError::Cancelled => Ok(StepRun::settled(self.load_task(task.id).await?)),
                other => Err(other),
            };
        }

        tracing::info!(
            task_id = %task.id,
            project_id,
            workflow_type,
            supervision_mode = %supervision_mode,
            actor = %actor.id,
            "workflow started"
        );
        self.emit(
            task.id,
            WorkflowEventKind::Progress,
            serde_json::json!({
                "status": task.status,
                "step_id": task.current_step_id,
                "total_steps": def.steps.len(),
            }),
        );

        let run = Run {
            def,
            handlers,
            cancel,
        };
        self.run_from(task, 0, &run).await
    }

    /// Continue a paused task once its latest checkpoint is resolved.
    ///
    /// - approved / skipped: next step, or the same step again when it asks
    ///   for revalidation
    /// - rejected: the step's `on_reject` target, otherwise the task fails
    ///   with the rejection reason
    /// - timed out: the task fails with a timeout error
    pub async fn resume_workflow(
        &self,
        task_id: Uuid,
        actor: &Actor,
    ) -> Result<StepRun, EngineError> {
        let task = self.load_task(task_id).await?;
        ensure_paused(&task)?;
        let _guard = self.locks.try_acquire(&task.project_id)?;

        // Re-read under the lock; another resume may have won the race.
        let mut task = self.load_task(task_id).await?;
        ensure_paused(&task)?;

        let def = self.definitions.load(&task.definition_id)?;
        if def.version != task.definition_version {
            tracing::warn!(
                task_id = %task.id,
                started_with = %task.definition_version,
                current = %def.version,
                "resuming with a newer template version"
            );
        }
        let handlers = self.handlers.resolve(&def)?;

        let checkpoint_id = task.latest_checkpoint_id().ok_or_else(|| {
            EngineError::InvalidState(format!("paused task {task_id} has no checkpoint"))
        })?;
        let checkpoint = self.checkpoints.get(checkpoint_id).await?;
        let checkpoint = self.checkpoints.settle_if_expired(checkpoint).await?;
        let index = def.step_index(&checkpoint.step_id).ok_or_else(|| {
            EngineError::InvalidState(format!(
                "step '{}' no longer exists in '{}'",
                checkpoint.step_id, def.workflow_type
            ))
        })?;
        let step = &def.steps[index];

        let next_index = match checkpoint.status {
            CheckpointStatus::Pending => {
                return Err(EngineError::InvalidState(format!(
                    "checkpoint {checkpoint_id} is still pending"
                )));
            }
            CheckpointStatus::Approved | CheckpointStatus::Skipped => {
                if step.revalidate_on_resume {
                    index
                } else {
                    index + 1
                }
            }
            CheckpointStatus::Rejected => match step.on_reject.as_deref().and_then(|t| def.step_index(t)) {
                Some(target) => {
                    let rerun: Vec<&str> = def.steps[target..].iter().map(|s| s.id.as_str()).collect();
                    task.completed_steps.retain(|s| !rerun.contains(&s.as_str()));
                    target
                }
                None => {
                    let reason = checkpoint.comment.clone().unwrap_or_default();
                    self.reject_task(&mut task, &checkpoint, &reason, actor).await?;
                    return Ok(StepRun::settled(task));
                }
            },
            CheckpointStatus::Timeout => {
                let err = EngineError::Timeout(checkpoint_id);
                return Err(self.abort(&mut task, err, Some(checkpoint.step_id.as_str())).await);
            }
        };

        let cancel = CancellationToken::new();
        self.cancellations.insert(task.id, cancel.clone());

        let next_step = def.steps.get(next_index).map(|s| s.id.clone());
        task.status = TaskStatus::Running;
        task.current_step_id = next_step.clone().or(task.current_step_id);
        let resumed = self
            .commit(
                &mut task,
                AuditAction::WorkflowResumed,
                actor,
                serde_json::json!({
                    "checkpoint_id": checkpoint_id,
                    "checkpoint_status": checkpoint.status,
                    "next_step_id": next_step,
                }),
            )
            .await;
        if let Err(e) = resumed {
            self.cancellations.remove(&task.id);
            return match e {
                EngineError::Cancelled => Ok(StepRun::settled(self.load_task(task_id).await?)),
                other => Err(other),
            };
        }

        tracing::info!(
            task_id = %task.id,
            checkpoint_id = %checkpoint_id,
            next_step_id = ?next_step,
            actor = %actor.id,
            "workflow resumed"
        );
        self.emit(
            task.id,
            WorkflowEventKind::Progress,
            serde_json::json!({ "status": task.status, "step_id": next_step }),
        );

        let run = Run {
            def,
            handlers,
            cancel,
        };
        self.run_from(task, next_index, &run).await
    }

    /// Cancel a task from any non-terminal status.
    ///
    /// A task that is already terminal is returned unchanged. An in-flight
    /// step loop stops at its next step boundary and keeps its partial state.
    pub async fn cancel_workflow(
        &self,
        task_id: Uuid,
        reason: &str,
        actor: &Actor,
    ) -> Result<WorkflowTask, EngineError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let mut task = self.load_task(task_id).await?;
            if task.status.is_terminal() {
                tracing::debug!(task_id = %task_id, status = %task.status, "cancel on terminal task ignored");
                return Ok(task);
            }

            let token = self.cancellations.get(&task_id).map(|t| t.value().clone());
            if let Some(token) = token {
                token.cancel();
            }

            let pending = self.checkpoints.get_pending_checkpoints(task_id).await?;
            let skipped: Vec<Uuid> = pending.iter().map(|c| c.id).collect();

            let previous = task.status;
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            let details = serde_json::json!({
                "reason": reason,
                "previous_status": previous,
                "skipped_checkpoints": skipped,
            });
            if self
                .try_commit(&mut task, AuditAction::WorkflowCancelled, actor, details)
                .await?
            {
                self.cancellations.remove(&task_id);
                for checkpoint in &pending {
                    if let Err(e) = self.checkpoints.skip(checkpoint, actor).await {
                        tracing::warn!(
                            task_id = %task_id,
                            checkpoint_id = %checkpoint.id,
                            error = %e,
                            "could not skip checkpoint of cancelled task"
                        );
                    }
                }
                tracing::info!(task_id = %task_id, %reason, actor = %actor.id, "workflow cancelled");
                self.emit(
                    task_id,
                    WorkflowEventKind::Progress,
                    serde_json::json!({ "status": task.status, "reason": reason }),
                );
                return Ok(task);
            }
        }
        Err(EngineError::Conflict(format!(
            "task {task_id} kept changing while cancelling"
        )))
    }

    /// Approve a checkpoint and resume its task.
    pub async fn approve_checkpoint(
        &self,
        checkpoint_id: Uuid,
        actor: &Actor,
        comment: Option<&str>,
    ) -> Result<StepRun, EngineError> {
        self.ensure_awaited(checkpoint_id).await?;
        let checkpoint = self.checkpoints.approve(checkpoint_id, actor, comment).await?;
        self.resume_workflow(checkpoint.task_id, actor).await
    }

    /// Reject a checkpoint and resume its task (rewind or fail).
    pub async fn reject_checkpoint(
        &self,
        checkpoint_id: Uuid,
        actor: &Actor,
        reason: &str,
    ) -> Result<StepRun, EngineError> {
        self.ensure_awaited(checkpoint_id).await?;
        let checkpoint = self.checkpoints.reject(checkpoint_id, actor, reason).await?;
        self.resume_workflow(checkpoint.task_id, actor).await
    }

    /// A checkpoint may only be resolved while its task is paused on it.
    async fn ensure_awaited(&self, checkpoint_id: Uuid) -> Result<(), EngineError> {
        let checkpoint = self.checkpoints.get(checkpoint_id).await?;
        let task = self.load_task(checkpoint.task_id).await?;
        ensure_paused(&task)?;
        if task.latest_checkpoint_id() != Some(checkpoint_id) {
            return Err(EngineError::InvalidState(format!(
                "task {} is not waiting on checkpoint {checkpoint_id}",
                task.id
            )));
        }
        Ok(())
    }

    /// Push back a pending checkpoint's deadline.
    pub async fn extend_checkpoint(
        &self,
        checkpoint_id: Uuid,
        actor: &Actor,
        extension: Duration,
    ) -> Result<Checkpoint, EngineError> {
        self.checkpoints.extend(checkpoint_id, actor, extension).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Read-only snapshot of a task.
    pub async fn get_workflow_state(&self, task_id: Uuid) -> Result<WorkflowTask, EngineError> {
        self.load_task(task_id).await
    }

    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<WorkflowTask>, EngineError> {
        Ok(self.repo.list_tasks(project_id).await?)
    }

    pub async fn get_pending_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        self.checkpoints.get_pending_checkpoints(task_id).await
    }

    pub async fn list_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        self.checkpoints.list_checkpoints(task_id).await
    }

    pub async fn get_audit_trail(&self, task_id: Uuid) -> Result<Vec<AuditLogEntry>, EngineError> {
        self.audit.get_audit_trail(&task_id).await
    }

    // -----------------------------------------------------------------------
    // Step loop
    // -----------------------------------------------------------------------

    async fn run_from(
        &self,
        mut task: WorkflowTask,
        index: usize,
        run: &Run,
    ) -> Result<StepRun, EngineError> {
        let span = tracing::info_span!(
            "workflow_run",
            task_id = %task.id,
            project_id = %task.project_id,
            workflow_type = %run.def.workflow_type,
        );
        let result = self.drive(&mut task, index, run).instrument(span).await;
        self.cancellations.remove(&task.id);

        match result {
            Err(EngineError::Cancelled) => {
                tracing::info!(task_id = %task.id, "step loop stopped by cancellation");
                Ok(StepRun::settled(self.load_task(task.id).await?))
            }
            other => other,
        }
    }

    async fn drive(
        &self,
        task: &mut WorkflowTask,
        mut index: usize,
        run: &Run,
    ) -> Result<StepRun, EngineError> {
        let def = &run.def;
        loop {
            let Some(step) = def.steps.get(index) else {
                return self.complete(task).await.map(|()| StepRun::settled(task.clone()));
            };
            if run.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            task.current_step_id = Some(step.id.clone());

            let missing: Vec<&str> = step
                .required_inputs
                .iter()
                .filter(|key| task.state.get(key.as_str()).is_none())
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                let err = EngineError::Validation(format!(
                    "step '{}' is missing required inputs: {}",
                    step.id,
                    missing.join(", ")
                ));
                return Err(self.abort(task, err, Some(step.id.as_str())).await);
            }

            let outcome = match self
                .execute_with_retry(task, step, &run.handlers[index], &run.cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.abort(task, err, Some(step.id.as_str())).await),
            };

            apply_delta(&mut task.state, &step.id, outcome.state_delta.clone());
            if !task.completed_steps.contains(&step.id) {
                task.completed_steps.push(step.id.clone());
            }

            let is_final = def.is_final_step(&step.id);
            if let Some(checkpoint_type) =
                self.checkpoints
                    .pause_reason(task.supervision_mode, step, is_final, &outcome)
            {
                return self.pause(task, step, checkpoint_type, &outcome).await;
            }

            let committed = self
                .commit(
                    task,
                    AuditAction::StepCompleted,
                    &Actor::system(),
                    serde_json::json!({ "step_id": step.id, "confidence": outcome.confidence }),
                )
                .await;
            if let Err(err) = committed {
                return Err(self.abort(task, err, Some(step.id.as_str())).await);
            }

            tracing::debug!(task_id = %task.id, step_id = %step.id, "step completed");
            self.emit(
                task.id,
                WorkflowEventKind::Progress,
                serde_json::json!({
                    "status": "step_completed",
                    "step_id": step.id,
                    "completed_steps": task.completed_steps.len(),
                    "total_steps": def.steps.len(),
                }),
            );
            index += 1;
        }
    }

    /// Run one step's handler under its timeout, retrying failures with backoff.
    async fn execute_with_retry(
        &self,
        task: &WorkflowTask,
        step: &StepDefinition,
        handler: &BoxStepHandler,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.step_timeout);
        let ctx = StepContext {
            task_id: task.id,
            project_id: task.project_id.clone(),
            step: step.clone(),
            state: task.state.clone(),
        };

        let mut retries = 0;
        loop {
            let attempt = retries + 1;
            let result = match tokio::time::timeout(timeout, handler.execute(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::TimedOut(timeout)),
            };

            match result {
                Ok(outcome) => {
                    if retries > 0 {
                        tracing::info!(task_id = %task.id, step_id = %step.id, attempt, "step recovered after retry");
                    }
                    return Ok(outcome);
                }
                Err(e) if self.retry.should_retry(retries) => {
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    retries += 1;
                    let delay = self.retry.delay_for(retries);
                    tracing::warn!(
                        task_id = %task.id,
                        step_id = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "step failed, retrying"
                    );
                    self.audit
                        .log_action(
                            task.id,
                            AuditAction::StepRetried,
                            &Actor::system(),
                            serde_json::json!({
                                "step_id": step.id,
                                "attempt": attempt,
                                "error": e.to_string(),
                                "delay_ms": delay.as_millis() as u64,
                            }),
                        )
                        .await?;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(EngineError::StepExecution {
                        step_id: step.id.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Persist the task as paused behind a new checkpoint.
    async fn pause(
        &self,
        task: &mut WorkflowTask,
        step: &StepDefinition,
        checkpoint_type: CheckpointType,
        outcome: &StepOutcome,
    ) -> Result<StepRun, EngineError> {
        let data = serde_json::json!({
            "step_id": step.id,
            "step_name": step.name,
            "state_delta": outcome.state_delta,
            "confidence": outcome.confidence,
        });
        let checkpoint = match self
            .checkpoints
            .create_checkpoint(task, &step.id, checkpoint_type, data)
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(err) => return Err(self.abort(task, err, Some(step.id.as_str())).await),
        };

        task.checkpoint_ids.push(checkpoint.id);
        task.status = TaskStatus::Paused;
        let committed = self
            .commit(
                task,
                AuditAction::WorkflowPaused,
                &Actor::system(),
                serde_json::json!({
                    "checkpoint_id": checkpoint.id,
                    "checkpoint_type": checkpoint_type,
                    "step_id": step.id,
                    "confidence": outcome.confidence,
                }),
            )
            .await;
        if let Err(err) = committed {
            // The task never paused on it; leave nothing pending behind.
            if let Err(e) = self.checkpoints.skip(&checkpoint, &Actor::system()).await {
                tracing::warn!(checkpoint_id = %checkpoint.id, error = %e, "could not skip orphaned checkpoint");
            }
            return Err(self.abort(task, err, Some(step.id.as_str())).await);
        }

        tracing::info!(
            task_id = %task.id,
            step_id = %step.id,
            checkpoint_id = %checkpoint.id,
            checkpoint_type = %checkpoint_type,
            "workflow paused for approval"
        );
        self.emit(
            task.id,
            WorkflowEventKind::CheckpointPending,
            serde_json::json!({
                "checkpoint_id": checkpoint.id,
                "checkpoint_type": checkpoint_type,
                "step_id": step.id,
                "expires_at": checkpoint.expires_at,
                "data": checkpoint.data,
            }),
        );

        Ok(StepRun {
            task: task.clone(),
            checkpoint: Some(checkpoint),
        })
    }

    async fn complete(&self, task: &mut WorkflowTask) -> Result<(), EngineError> {
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        let committed = self
            .commit(
                task,
                AuditAction::WorkflowCompleted,
                &Actor::system(),
                serde_json::json!({ "completed_steps": task.completed_steps }),
            )
            .await;
        if let Err(err) = committed {
            return Err(self.abort(task, err, None).await);
        }

        tracing::info!(task_id = %task.id, steps = task.completed_steps.len(), "workflow completed");
        self.emit(
            task.id,
            WorkflowEventKind::Completed,
            serde_json::json!({ "state": task.state }),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    /// Mark the task FAILED because of `err` and hand `err` back.
    ///
    /// A task cancelled in the meantime stays cancelled; `Cancelled` is
    /// returned instead.
    async fn abort(
        &self,
        task: &mut WorkflowTask,
        err: EngineError,
        step_id: Option<&str>,
    ) -> EngineError {
        if matches!(err, EngineError::Cancelled) {
            return err;
        }
        tracing::error!(
            task_id = %task.id,
            project_id = %task.project_id,
            step_id = ?step_id,
            kind = %err.kind(),
            error = %err,
            "workflow failed"
        );

        task.status = TaskStatus::Failed;
        task.error = Some(err.to_string());
        task.completed_at = Some(Utc::now());
        let details = serde_json::json!({
            "kind": err.kind(),
            "message": err.to_string(),
            "step_id": step_id,
        });
        match self
            .commit(task, AuditAction::WorkflowFailed, &Actor::system(), details)
            .await
        {
            Ok(()) => {}
            Err(EngineError::Cancelled) => return EngineError::Cancelled,
            Err(write_err) => {
                tracing::error!(task_id = %task.id, error = %write_err, "could not persist workflow failure");
            }
        }

        let mut payload = err.to_event_payload();
        payload["step_id"] = serde_json::json!(step_id);
        self.emit(task.id, WorkflowEventKind::Error, payload);
        err
    }

    /// Fail a task whose checkpoint was rejected without a retry path.
    async fn reject_task(
        &self,
        task: &mut WorkflowTask,
        checkpoint: &Checkpoint,
        reason: &str,
        actor: &Actor,
    ) -> Result<(), EngineError> {
        task.status = TaskStatus::Failed;
        task.error = Some(format!("checkpoint at step '{}' rejected: {reason}", checkpoint.step_id));
        task.completed_at = Some(Utc::now());
        self.commit(
            task,
            AuditAction::WorkflowFailed,
            actor,
            serde_json::json!({
                "kind": CHECKPOINT_REJECTED,
                "checkpoint_id": checkpoint.id,
                "step_id": checkpoint.step_id,
                "reason": reason,
            }),
        )
        .await?;

        tracing::info!(task_id = %task.id, checkpoint_id = %checkpoint.id, %reason, "workflow failed on rejection");
        self.emit(
            task.id,
            WorkflowEventKind::Error,
            serde_json::json!({
                "kind": CHECKPOINT_REJECTED,
                "message": task.error,
                "step_id": checkpoint.step_id,
                "checkpoint_id": checkpoint.id,
            }),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write `task` with a version check and append its audit entry.
    ///
    /// On a lost race the stored task is reloaded: if it was cancelled, the
    /// partial state computed here is merged into it and `Cancelled` is
    /// returned; otherwise the write is a `Conflict`.
    async fn commit(
        &self,
        task: &mut WorkflowTask,
        action: AuditAction,
        actor: &Actor,
        details: serde_json::Value,
    ) -> Result<(), EngineError> {
        if self.try_commit(task, action, actor, details).await? {
            return Ok(());
        }

        let mut stored = self.load_task(task.id).await?;
        if stored.status != TaskStatus::Cancelled {
            return Err(EngineError::Conflict(format!(
                "task {} was modified concurrently",
                task.id
            )));
        }

        let expected = stored.version;
        stored.state = task.state.clone();
        stored.completed_steps = task.completed_steps.clone();
        stored.version += 1;
        match self.repo.compare_and_swap_task(expected, &stored).await {
            Ok(true) => {}
            Ok(false) => stored.version = expected,
            Err(e) => {
                stored.version = expected;
                tracing::warn!(task_id = %task.id, error = %e, "could not keep partial state of cancelled task");
            }
        }
        *task = stored;
        Err(EngineError::Cancelled)
    }

    /// Compare-and-swap `task`, then audit. `Ok(false)` when the stored
    /// version moved on; `task.version` is left untouched in that case.
    async fn try_commit(
        &self,
        task: &mut WorkflowTask,
        action: AuditAction,
        actor: &Actor,
        details: serde_json::Value,
    ) -> Result<bool, EngineError> {
        let expected = task.version;
        task.version = expected + 1;
        let snapshot: &WorkflowTask = task;
        let written = with_persistence_retry(&self.retry, "compare_and_swap_task", || {
            self.repo.compare_and_swap_task(expected, snapshot)
        })
        .await;

        match written {
            Ok(true) => {}
            Ok(false) => {
                task.version = expected;
                return Ok(false);
            }
            Err(e) => {
                task.version = expected;
                return Err(e.into());
            }
        }

        self.audit.log_action(task.id, action, actor, details).await?;
        tracing::debug!(
            task_id = %task.id,
            version = task.version,
            status = %task.status,
            action = %action,
            "task persisted"
        );
        Ok(true)
    }

    async fn load_task(&self, task_id: Uuid) -> Result<WorkflowTask, EngineError> {
        self.repo
            .get_task(&task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))
    }

    fn emit(&self, task_id: Uuid, kind: WorkflowEventKind, payload: serde_json::Value) {
        self.events.emit(WorkflowEvent::new(task_id, kind, payload));
    }
}

fn ensure_paused(task: &WorkflowTask) -> Result<(), EngineError> {
    if task.status == TaskStatus::Paused {
        Ok(())
    } else {
        Err(EngineError::InvalidState(format!(
            "task {} is {}, not paused",
            task.id, task.status
        )))
    }
}

/// Merge a step's output into the task state.
///
/// Object deltas overwrite keys shallowly; any other non-null delta is
/// stored under the step id.
pub fn apply_delta(state: &mut serde_json::Value, step_id: &str, delta: serde_json::Value) {
    if delta.is_null() {
        return;
    }
    if !state.is_object() {
        *state = serde_json::json!({});
    }
    let Some(target) = state.as_object_mut() else {
        return;
    };
    match delta {
        serde_json::Value::Object(fields) => target.extend(fields),
        other => {
            target.insert(step_id.to_string(), other);
        }
    }
}
