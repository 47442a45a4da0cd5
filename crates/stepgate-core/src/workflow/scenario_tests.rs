//! End-to-end engine behaviour against the in-memory repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stepgate_types::audit::{Actor, AuditAction};
use stepgate_types::checkpoint::{CheckpointStatus, CheckpointType};
use stepgate_types::config::EngineConfig;
use stepgate_types::definition::{StepDefinition, SupervisionMode, WorkflowDefinition};
use stepgate_types::event::{WorkflowEvent, WorkflowEventKind};
use stepgate_types::task::TaskStatus;
use tokio::sync::{Notify, broadcast};

use super::definition::WorkflowDefinitionStore;
use super::executor::{StartOptions, WorkflowExecutor};
use super::handler::{HandlerRegistry, StepContext, StepError, StepHandler, StepOutcome};
use crate::error::ErrorKind;
use crate::event::EventBus;
use crate::repository::{InMemoryWorkflowRepository, WorkflowRepository};

type Repo = InMemoryWorkflowRepository;
type Calls = Arc<Mutex<Vec<String>>>;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Records every invocation and behaves according to the step's params:
/// `fail_times`, `confidence`, `needs_document`, `break_writes`.
struct Scripted {
    calls: Calls,
    attempts: Mutex<HashMap<String, u64>>,
    repo: Arc<Repo>,
}

impl StepHandler for Scripted {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        let step_id = ctx.step.id.clone();
        self.calls.lock().unwrap().push(step_id.clone());

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(step_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let params = &ctx.step.params;
        if attempt <= params["fail_times"].as_u64().unwrap_or(0) {
            return Err(StepError::failed(format!("{step_id} attempt {attempt} failed")));
        }
        if let Some(n) = params["break_writes"].as_u64() {
            self.repo.fail_next_writes(n as u32);
        }

        let mut outcome = StepOutcome::new(serde_json::json!({ step_id: true }));
        outcome.confidence = params["confidence"].as_f64();
        outcome.needs_document = params["needs_document"].as_bool().unwrap_or(false);
        Ok(outcome)
    }
}

/// Signals when entered, then waits to be released.
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl StepHandler for Gate {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(StepOutcome::new(serde_json::json!({ ctx.step.id.clone(): true })))
    }
}

struct Sleepy;

impl StepHandler for Sleepy {
    async fn execute(&self, _ctx: &StepContext) -> Result<StepOutcome, StepError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(StepOutcome::default())
    }
}

fn step(id: &str) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: format!("Step {id}"),
        handler: Some("scripted".to_string()),
        checkpoint: false,
        required_inputs: vec![],
        revalidate_on_resume: false,
        on_reject: None,
        timeout_secs: None,
        params: serde_json::Value::Null,
    }
}

fn flagged(id: &str) -> StepDefinition {
    StepDefinition {
        checkpoint: true,
        ..step(id)
    }
}

fn with_params(mut s: StepDefinition, params: serde_json::Value) -> StepDefinition {
    s.params = params;
    s
}

fn definition(workflow_type: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_type: workflow_type.to_string(),
        version: "1".to_string(),
        name: workflow_type.to_string(),
        description: None,
        supervision_mode: None,
        checkpoints: vec![],
        steps,
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter = false;
    config
}

struct Harness {
    repo: Arc<Repo>,
    store: Arc<WorkflowDefinitionStore>,
    registry: HandlerRegistry,
    bus: EventBus,
    calls: Calls,
    config: EngineConfig,
}

impl Harness {
    fn new(defs: Vec<WorkflowDefinition>) -> Self {
        Self::with_config(defs, config())
    }

    fn with_config(defs: Vec<WorkflowDefinition>, config: EngineConfig) -> Self {
        let repo = Arc::new(Repo::new());
        let store = Arc::new(WorkflowDefinitionStore::in_memory());
        for def in defs {
            store.register(def).unwrap();
        }
        let calls: Calls = Arc::default();
        let mut registry = HandlerRegistry::new();
        registry.register(
            "scripted",
            Scripted {
                calls: Arc::clone(&calls),
                attempts: Mutex::default(),
                repo: Arc::clone(&repo),
            },
        );
        Self {
            repo,
            store,
            registry,
            bus: EventBus::new(256),
            calls,
            config,
        }
    }

    fn executor(&self) -> WorkflowExecutor<Repo> {
        WorkflowExecutor::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.store),
            self.registry.clone(),
            Arc::new(self.bus.clone()),
            &self.config,
        )
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn actions(&self, task_id: uuid::Uuid) -> Vec<AuditAction> {
        self.repo
            .list_audit(&task_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect()
    }
}

fn mode(mode: SupervisionMode) -> StartOptions {
    StartOptions {
        supervision_mode: Some(mode),
        ..Default::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn ana() -> Actor {
    Actor::user("ana")
}

// ---------------------------------------------------------------------------
// Supervision scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_required_pauses_once_at_flagged_step() {
    let h = Harness::new(vec![definition("filing", vec![step("a"), flagged("b"), step("c")])]);
    let exec = h.executor();
    let mut rx = h.bus.subscribe();

    let run = exec
        .start_workflow("acme", "filing", mode(SupervisionMode::ApprovalRequired))
        .await
        .unwrap();
    assert_eq!(run.task.status, TaskStatus::Paused);
    assert_eq!(run.task.current_step_id.as_deref(), Some("b"));
    let checkpoint = run.checkpoint.unwrap();
    assert_eq!(checkpoint.step_id, "b");
    assert_eq!(checkpoint.checkpoint_type, CheckpointType::StepReview);
    assert_eq!(checkpoint.status, CheckpointStatus::Pending);
    assert_eq!(h.calls(), vec!["a", "b"]);

    let events = drain(&mut rx);
    let last = events.last().unwrap();
    assert_eq!(last.kind, WorkflowEventKind::CheckpointPending);
    assert_eq!(last.payload["checkpoint_id"], checkpoint.id.to_string());

    let done = exec
        .approve_checkpoint(checkpoint.id, &ana(), Some("figures match"))
        .await
        .unwrap();
    assert_eq!(done.task.status, TaskStatus::Completed);
    assert!(done.task.completed_at.is_some());
    assert!(done.checkpoint.is_none());
    assert_eq!(h.calls(), vec!["a", "b", "c"]);
    assert_eq!(done.task.completed_steps, vec!["a", "b", "c"]);
    assert_eq!(done.task.state, serde_json::json!({"a": true, "b": true, "c": true}));
    assert_eq!(exec.list_checkpoints(done.task.id).await.unwrap().len(), 1);

    assert_eq!(
        h.actions(done.task.id).await,
        vec![
            AuditAction::WorkflowStarted,
            AuditAction::StepCompleted,
            AuditAction::WorkflowPaused,
            AuditAction::CheckpointApproved,
            AuditAction::WorkflowResumed,
            AuditAction::StepCompleted,
            AuditAction::WorkflowCompleted,
        ]
    );
    let events = drain(&mut rx);
    assert_eq!(events.last().unwrap().kind, WorkflowEventKind::Completed);
}

#[tokio::test]
async fn confidence_based_pauses_only_below_threshold() {
    let h = Harness::new(vec![definition(
        "extract",
        vec![
            with_params(step("a"), serde_json::json!({"confidence": 0.95})),
            with_params(step("b"), serde_json::json!({"confidence": 0.50})),
            with_params(step("c"), serde_json::json!({"confidence": 0.99})),
        ],
    )]);
    let exec = h.executor();

    let run = exec
        .start_workflow("acme", "extract", mode(SupervisionMode::ConfidenceBased))
        .await
        .unwrap();
    let checkpoint = run.checkpoint.unwrap();
    assert_eq!(checkpoint.step_id, "b");
    assert_eq!(checkpoint.checkpoint_type, CheckpointType::DataConfirmation);
    assert_eq!(checkpoint.data["confidence"], 0.5);

    let done = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Completed);
    assert_eq!(exec.list_checkpoints(done.task.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn review_checkpoints_pause_at_final_step_only() {
    let h = Harness::new(vec![definition("review", vec![flagged("a"), step("b")])]);
    let exec = h.executor();

    let run = exec
        .start_workflow("acme", "review", mode(SupervisionMode::ReviewCheckpoints))
        .await
        .unwrap();
    let checkpoint = run.checkpoint.unwrap();
    assert_eq!(checkpoint.step_id, "b");
    assert_eq!(checkpoint.checkpoint_type, CheckpointType::FinalReview);

    let done = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Completed);
    assert_eq!(h.calls(), vec!["a", "b"]);
}

#[tokio::test]
async fn template_mode_applies_when_caller_picks_none() {
    let mut def = definition("review", vec![step("a"), step("b")]);
    def.supervision_mode = Some(SupervisionMode::ReviewCheckpoints);
    let h = Harness::new(vec![def, definition("plain", vec![step("a"), step("b")])]);
    let exec = h.executor();

    let run = exec.start_workflow("acme", "review", StartOptions::default()).await.unwrap();
    assert_eq!(run.task.supervision_mode, SupervisionMode::ReviewCheckpoints);
    assert_eq!(run.checkpoint.unwrap().step_id, "b");

    let run = exec.start_workflow("globex", "plain", StartOptions::default()).await.unwrap();
    assert_eq!(run.task.supervision_mode, SupervisionMode::FullSupervision);
    assert_eq!(run.checkpoint.unwrap().step_id, "a");
}

#[tokio::test]
async fn document_request_forces_pause() {
    let h = Harness::new(vec![definition(
        "docs",
        vec![with_params(
            step("upload"),
            serde_json::json!({"confidence": 1.0, "needs_document": true}),
        )],
    )]);
    let exec = h.executor();

    let run = exec
        .start_workflow("acme", "docs", mode(SupervisionMode::ConfidenceBased))
        .await
        .unwrap();
    assert_eq!(
        run.checkpoint.unwrap().checkpoint_type,
        CheckpointType::DocumentRequest
    );
}

// ---------------------------------------------------------------------------
// Retries and failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_step_failures_are_retried() {
    let h = Harness::new(vec![definition(
        "flaky",
        vec![
            with_params(step("a"), serde_json::json!({"fail_times": 2})),
            step("b"),
        ],
    )]);
    let exec = h.executor();

    let run = exec
        .start_workflow("acme", "flaky", mode(SupervisionMode::ApprovalRequired))
        .await
        .unwrap();
    assert_eq!(run.task.status, TaskStatus::Completed);
    assert_eq!(h.calls(), vec!["a", "a", "a", "b"]);

    let actions = h.actions(run.task.id).await;
    assert_eq!(actions.iter().filter(|a| **a == AuditAction::StepRetried).count(), 2);
    assert!(!actions.contains(&AuditAction::WorkflowFailed));
}

#[tokio::test]
async fn exhausted_retries_fail_the_task() {
    let h = Harness::new(vec![definition(
        "broken",
        vec![with_params(step("a"), serde_json::json!({"fail_times": 10})), step("b")],
    )]);
    let exec = h.executor();
    let mut rx = h.bus.subscribe();

    let err = exec
        .start_workflow("acme", "broken", mode(SupervisionMode::ApprovalRequired))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StepExecutionError);
    assert_eq!(h.calls(), vec!["a", "a", "a", "a"]);

    let task = exec.list_tasks("acme").await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("attempt 4 failed"));

    let actions = h.actions(task.id).await;
    assert_eq!(actions.iter().filter(|a| **a == AuditAction::StepRetried).count(), 3);
    assert_eq!(actions.last(), Some(&AuditAction::WorkflowFailed));

    let error = drain(&mut rx)
        .into_iter()
        .find(|e| e.kind == WorkflowEventKind::Error)
        .unwrap();
    assert_eq!(error.payload["kind"], "step_execution_error");
    assert_eq!(error.payload["step_id"], "a");
}

#[tokio::test(start_paused = true)]
async fn handler_timeouts_count_as_step_failures() {
    let mut slow = step("slow");
    slow.handler = Some("sleepy".to_string());
    slow.timeout_secs = Some(1);
    let mut h = Harness::new(vec![definition("slow", vec![slow])]);
    h.registry.register("sleepy", Sleepy);
    let exec = h.executor();

    let err = exec
        .start_workflow("acme", "slow", mode(SupervisionMode::ApprovalRequired))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StepExecutionError);
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn missing_required_input_fails_without_retry() {
    let mut needs = step("calc");
    needs.required_inputs = vec!["invoices".to_string()];
    let h = Harness::new(vec![definition("calc", vec![needs])]);
    let exec = h.executor();

    let err = exec
        .start_workflow("acme", "calc", mode(SupervisionMode::ApprovalRequired))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(h.calls().is_empty());
    let task = exec.list_tasks("acme").await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Failed);

    let opts = StartOptions {
        supervision_mode: Some(SupervisionMode::ApprovalRequired),
        initial_state: Some(serde_json::json!({"invoices": []})),
        actor_id: Some("ana".to_string()),
    };
    let run = exec.start_workflow("acme", "calc", opts).await.unwrap();
    assert_eq!(run.task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn unknown_handler_is_rejected_before_task_creation() {
    let mut odd = step("a");
    odd.handler = Some("ocr".to_string());
    let h = Harness::new(vec![definition("odd", vec![odd])]);
    let exec = h.executor();

    let err = exec.start_workflow("acme", "odd", StartOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(exec.list_tasks("acme").await.unwrap().is_empty());

    let err = exec.start_workflow("acme", "missing", StartOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn transient_persistence_failures_are_absorbed() {
    let h = Harness::new(vec![definition(
        "wobbly",
        vec![with_params(step("a"), serde_json::json!({"break_writes": 2})), step("b")],
    )]);
    let exec = h.executor();

    let run = exec
        .start_workflow("acme", "wobbly", mode(SupervisionMode::ApprovalRequired))
        .await
        .unwrap();
    assert_eq!(run.task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn persistent_storage_failure_escalates_to_failed() {
    let h = Harness::new(vec![definition(
        "outage",
        vec![with_params(step("a"), serde_json::json!({"break_writes": 4})), step("b")],
    )]);
    let exec = h.executor();

    let err = exec
        .start_workflow("acme", "outage", mode(SupervisionMode::ApprovalRequired))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceError);
    assert_eq!(h.calls(), vec!["a"]);

    let task = exec.list_tasks("acme").await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Failed);
    let trail = exec.get_audit_trail(task.id).await.unwrap();
    let failed = trail.last().unwrap();
    assert_eq!(failed.action, AuditAction::WorkflowFailed);
    assert_eq!(failed.details["kind"], "persistence_error");
}

// ---------------------------------------------------------------------------
// Exclusivity and cancellation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_for_one_project_admit_one() {
    let h = Harness::new(vec![definition("filing", vec![step("a"), step("b")])]);
    let exec = Arc::new(h.executor());

    let first = tokio::spawn({
        let exec = Arc::clone(&exec);
        async move { exec.start_workflow("acme", "filing", StartOptions::default()).await }
    });
    let second = tokio::spawn({
        let exec = Arc::clone(&exec);
        async move { exec.start_workflow("acme", "filing", StartOptions::default()).await }
    });
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(exec.list_tasks("acme").await.unwrap().len(), 1);

    // Another project is unaffected.
    assert!(exec.start_workflow("globex", "filing", StartOptions::default()).await.is_ok());
}

#[tokio::test]
async fn paused_task_blocks_new_start_until_terminal() {
    let h = Harness::new(vec![definition("filing", vec![step("a")])]);
    let exec = h.executor();

    let run = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap();
    assert_eq!(run.task.status, TaskStatus::Paused);
    let err = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    exec.cancel_workflow(run.task.id, "superseded", &ana()).await.unwrap();
    assert!(exec.start_workflow("acme", "filing", StartOptions::default()).await.is_ok());
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let h = Harness::new(vec![definition("filing", vec![step("a"), step("b")])]);
    let exec = h.executor();
    let run = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap();

    let first = exec.cancel_workflow(run.task.id, "client withdrew", &ana()).await.unwrap();
    let second = exec.cancel_workflow(run.task.id, "again", &ana()).await.unwrap();
    assert_eq!(first.status, TaskStatus::Cancelled);
    assert_eq!(second.status, TaskStatus::Cancelled);
    assert_eq!(first.version, second.version);

    let actions = h.actions(run.task.id).await;
    assert_eq!(
        actions.iter().filter(|a| **a == AuditAction::WorkflowCancelled).count(),
        1
    );

    let err = exec.resume_workflow(run.task.id, &ana()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn cancelling_a_paused_task_skips_its_checkpoint() {
    let h = Harness::new(vec![definition("filing", vec![step("a"), step("b")])]);
    let exec = h.executor();
    let run = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap();
    let task_id = run.task.id;
    let checkpoint = run.checkpoint.unwrap();

    exec.cancel_workflow(task_id, "client withdrew", &ana()).await.unwrap();
    assert!(exec.get_pending_checkpoints(task_id).await.unwrap().is_empty());
    let stored = exec.checkpoints().get(checkpoint.id).await.unwrap();
    assert_eq!(stored.status, CheckpointStatus::Skipped);

    let err = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = exec.reject_checkpoint(checkpoint.id, &ana(), "too late").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let stored = exec.checkpoints().get(checkpoint.id).await.unwrap();
    assert_eq!(stored.status, CheckpointStatus::Skipped);

    let far_future = chrono::Utc::now() + chrono::TimeDelta::days(365);
    assert!(exec.checkpoints().expire_stale(far_future).await.unwrap().is_empty());

    let trail = exec.get_audit_trail(task_id).await.unwrap();
    assert_eq!(
        trail.iter().map(|e| e.action).collect::<Vec<_>>(),
        vec![
            AuditAction::WorkflowStarted,
            AuditAction::WorkflowPaused,
            AuditAction::WorkflowCancelled,
        ]
    );
    assert_eq!(
        trail[2].details["skipped_checkpoints"],
        serde_json::json!([checkpoint.id])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_in_flight_loop_at_step_boundary() {
    let mut gated = step("a");
    gated.handler = Some("gate".to_string());
    let mut h = Harness::new(vec![definition("gated", vec![gated, step("b")])]);
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    h.registry.register(
        "gate",
        Gate {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        },
    );
    let exec = Arc::new(h.executor());

    let running = tokio::spawn({
        let exec = Arc::clone(&exec);
        async move {
            exec.start_workflow("acme", "gated", mode(SupervisionMode::ApprovalRequired))
                .await
        }
    });
    entered.notified().await;

    let task_id = exec.list_tasks("acme").await.unwrap()[0].id;
    let cancelled = exec.cancel_workflow(task_id, "stop", &ana()).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    release.notify_one();

    let run = running.await.unwrap().unwrap();
    assert_eq!(run.task.status, TaskStatus::Cancelled);
    // Partial state of the step that was in flight survives.
    assert_eq!(run.task.state["a"], true);
    assert!(h.calls().is_empty(), "step b must never run");

    let actions = h.actions(task_id).await;
    assert_eq!(
        actions,
        vec![AuditAction::WorkflowStarted, AuditAction::WorkflowCancelled]
    );
}

// ---------------------------------------------------------------------------
// Resume paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejection_without_retry_path_fails_task() {
    let h = Harness::new(vec![definition("filing", vec![step("a"), step("b")])]);
    let exec = h.executor();
    let run = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap();
    let checkpoint = run.checkpoint.unwrap();
    let mut rx = h.bus.subscribe();

    let err = exec.reject_checkpoint(checkpoint.id, &ana(), "").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let run = exec
        .reject_checkpoint(checkpoint.id, &ana(), "wrong client")
        .await
        .unwrap();
    assert_eq!(run.task.status, TaskStatus::Failed);
    assert!(run.task.error.unwrap().contains("wrong client"));
    assert_eq!(h.calls(), vec!["a"]);

    let actions = h.actions(run.task.id).await;
    assert_eq!(
        &actions[actions.len() - 2..],
        &[AuditAction::CheckpointRejected, AuditAction::WorkflowFailed]
    );

    let events = drain(&mut rx);
    let last = events.last().unwrap();
    assert_eq!(last.kind, WorkflowEventKind::Error);
    assert_eq!(last.payload["kind"], "checkpoint_rejected");
    assert!(last.payload["message"].as_str().unwrap().contains("wrong client"));
}

#[tokio::test]
async fn rejection_with_retry_path_rewinds() {
    let mut b = flagged("b");
    b.on_reject = Some("a".to_string());
    let h = Harness::new(vec![definition("rework", vec![step("a"), b, step("c")])]);
    let exec = h.executor();

    let run = exec
        .start_workflow("acme", "rework", mode(SupervisionMode::ApprovalRequired))
        .await
        .unwrap();
    let first = run.checkpoint.unwrap();

    let run = exec.reject_checkpoint(first.id, &ana(), "recheck inputs").await.unwrap();
    assert_eq!(run.task.status, TaskStatus::Paused);
    let second = run.checkpoint.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.step_id, "b");
    assert_eq!(h.calls(), vec!["a", "b", "a", "b"]);

    let done = exec.approve_checkpoint(second.id, &ana(), None).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Completed);
    assert_eq!(done.task.completed_steps, vec!["a", "b", "c"]);
    assert_eq!(done.task.checkpoint_ids, vec![first.id, second.id]);
}

#[tokio::test]
async fn revalidating_step_runs_again_after_approval() {
    let mut a = step("a");
    a.revalidate_on_resume = true;
    let h = Harness::new(vec![definition("recheck", vec![a, step("b")])]);
    let exec = h.executor();

    let run = exec.start_workflow("acme", "recheck", StartOptions::default()).await.unwrap();
    let run = exec
        .approve_checkpoint(run.checkpoint.unwrap().id, &ana(), None)
        .await
        .unwrap();
    assert_eq!(h.calls(), vec!["a", "a"]);
    assert_eq!(run.checkpoint.unwrap().step_id, "a");
}

#[tokio::test]
async fn resume_requires_resolved_checkpoint() {
    let h = Harness::new(vec![definition("filing", vec![step("a"), step("b")])]);
    let exec = h.executor();
    let run = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap();

    let err = exec.resume_workflow(run.task.id, &ana()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = exec.resume_workflow(uuid::Uuid::now_v7(), &ana()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let checkpoint = run.checkpoint.unwrap();
    exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap();
    let err = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn timed_out_checkpoint_fails_on_resume() {
    let mut config = config();
    config.checkpoint_timeout_secs = 0;
    let h = Harness::with_config(vec![definition("filing", vec![step("a"), step("b")])], config);
    let exec = h.executor();
    let run = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap();
    let checkpoint = run.checkpoint.unwrap();

    let err = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let err = exec.resume_workflow(run.task.id, &ana()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    let task = exec.get_workflow_state(run.task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let actions = h.actions(task.id).await;
    assert!(actions.contains(&AuditAction::CheckpointTimedOut));
    assert_eq!(actions.last(), Some(&AuditAction::WorkflowFailed));
}

#[tokio::test]
async fn extended_checkpoint_can_still_be_approved() {
    let mut config = config();
    config.checkpoint_timeout_secs = 0;
    let h = Harness::with_config(vec![definition("filing", vec![step("a")])], config);
    let exec = h.executor();
    let run = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap();
    let checkpoint = run.checkpoint.unwrap();

    exec.extend_checkpoint(checkpoint.id, &ana(), Duration::from_secs(3600))
        .await
        .unwrap();
    let done = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Completed);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hundredth_checkpoint_succeeds_and_next_one_fails() {
    let mut review = step("review");
    review.revalidate_on_resume = true;
    let h = Harness::new(vec![definition("loop", vec![review])]);
    let exec = h.executor();

    let mut run = exec.start_workflow("acme", "loop", StartOptions::default()).await.unwrap();
    for _ in 1..100 {
        let checkpoint = run.checkpoint.unwrap();
        run = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap();
    }
    let task_id = run.task.id;
    assert_eq!(run.task.checkpoint_ids.len(), 100);

    let last = run.checkpoint.unwrap();
    let err = exec.approve_checkpoint(last.id, &ana(), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BoundsError);

    let task = exec.get_workflow_state(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(exec.list_checkpoints(task_id).await.unwrap().len(), 100);
}

#[tokio::test]
async fn resume_after_restart_matches_uninterrupted_run() {
    let steps = || vec![step("a"), flagged("b"), step("c"), flagged("d"), step("e")];
    let opts = || mode(SupervisionMode::ApprovalRequired);

    // Uninterrupted.
    let straight = Harness::new(vec![definition("long", steps())]);
    let exec = straight.executor();
    let mut run = exec.start_workflow("acme", "long", opts()).await.unwrap();
    while let Some(checkpoint) = run.checkpoint {
        run = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap();
    }
    let expected = run.task;

    // A fresh executor picks up after each pause from persisted state only.
    let restarted = Harness::new(vec![definition("long", steps())]);
    let run = restarted.executor().start_workflow("acme", "long", opts()).await.unwrap();
    let mut task_id = run.task.id;
    let mut pending = run.checkpoint;
    while let Some(checkpoint) = pending {
        let exec = restarted.executor();
        let snapshot = exec.get_workflow_state(task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Paused);
        let run = exec.approve_checkpoint(checkpoint.id, &ana(), None).await.unwrap();
        task_id = run.task.id;
        pending = run.checkpoint;
    }
    let resumed = restarted.executor().get_workflow_state(task_id).await.unwrap();

    assert_eq!(straight.calls(), restarted.calls());
    assert_eq!(resumed.status, TaskStatus::Completed);
    assert_eq!(resumed.completed_steps, expected.completed_steps);
    assert_eq!(resumed.state, expected.state);
    assert_eq!(resumed.checkpoint_ids.len(), expected.checkpoint_ids.len());
}

#[tokio::test]
async fn each_transition_has_one_audit_entry() {
    let h = Harness::new(vec![definition("filing", vec![step("a"), step("b")])]);
    let exec = h.executor();

    let run = exec.start_workflow("acme", "filing", StartOptions::default()).await.unwrap();
    assert_eq!(
        h.actions(run.task.id).await,
        vec![AuditAction::WorkflowStarted, AuditAction::WorkflowPaused]
    );
    // Every persisted task version corresponds to one audited write.
    let writes = h
        .actions(run.task.id)
        .await
        .into_iter()
        .filter(|a| *a != AuditAction::CheckpointApproved)
        .count();
    assert_eq!(run.task.version as usize, writes);
}
