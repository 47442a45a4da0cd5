//! Step handler capability and registry.
//!
//! Domain logic (calculators, extractors, generators) lives outside the
//! engine. Each step names a handler; handlers are resolved once when a
//! workflow starts and invoked through dynamic dispatch.
//!
//! Follows the blanket-impl pattern used for other RPITIT capabilities:
//! 1. `StepHandler` uses native async fn in traits
//! 2. object-safe `StepHandlerDyn` with boxed futures, blanket-impl'd
//! 3. `BoxStepHandler` wraps `Arc<dyn StepHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use stepgate_types::definition::{StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use crate::error::EngineError;

/// Input handed to a step handler.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: Uuid,
    pub project_id: String,
    pub step: StepDefinition,
    /// Snapshot of the task state before this step.
    pub state: serde_json::Value,
}

/// What a step produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Merged into the task state. Objects merge key by key; anything else is
    /// stored under the step id.
    pub state_delta: serde_json::Value,
    /// Self-reported confidence in `[0, 1]`, consulted by `confidence_based`
    /// supervision.
    pub confidence: Option<f64>,
    /// The step cannot finish without a document from the user.
    pub needs_document: bool,
}

impl StepOutcome {
    pub fn new(state_delta: serde_json::Value) -> Self {
        Self {
            state_delta,
            ..Default::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn needing_document(mut self) -> Self {
        self.needs_document = true;
        self
    }
}

/// Failure reported by (or on behalf of) a step handler. Always retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }
}

/// A domain step implementation. Must be safe to retry.
pub trait StepHandler: Send + Sync {
    fn execute(
        &self,
        ctx: &StepContext,
    ) -> impl Future<Output = Result<StepOutcome, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }
}

/// Type-erased, cheaply cloneable step handler.
#[derive(Clone)]
pub struct BoxStepHandler {
    inner: Arc<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.inner.execute_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler").finish_non_exhaustive()
    }
}

/// Adapts a synchronous closure into a [`StepHandler`].
pub struct FnStepHandler<F>(F);

impl<F> StepHandler for FnStepHandler<F>
where
    F: Fn(&StepContext) -> Result<StepOutcome, StepError> + Send + Sync,
{
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        (self.0)(ctx)
    }
}

pub fn from_fn<F>(f: F) -> FnStepHandler<F>
where
    F: Fn(&StepContext) -> Result<StepOutcome, StepError> + Send + Sync,
{
    FnStepHandler(f)
}

/// Handlers keyed by the name steps refer to them by.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxStepHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register<T: StepHandler + 'static>(&mut self, name: impl Into<String>, handler: T) {
        self.handlers.insert(name.into(), BoxStepHandler::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<&BoxStepHandler> {
        self.handlers.get(name)
    }

    /// Sorted handler names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve the handler of every step, in step order.
    ///
    /// Fails with a validation error naming the first step whose handler is
    /// not registered.
    pub fn resolve(&self, def: &WorkflowDefinition) -> Result<Vec<BoxStepHandler>, EngineError> {
        def.steps
            .iter()
            .map(|step| {
                self.handlers.get(step.handler_name()).cloned().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "step '{}' of '{}' uses unregistered handler '{}'",
                        step.id,
                        def.workflow_type,
                        step.handler_name()
                    ))
                })
            })
            .collect()
    }
}
