//! Step handlers shipped with the CLI.
//!
//! Domain handlers live with the embedding application. The CLI only ships
//! `params`, which replays values written into the template so workflows
//! can be exercised end to end from the command line.

use stepgate_core::workflow::handler::{StepContext, StepError, StepOutcome};

/// Handler name templates refer to.
pub const PARAMS_HANDLER: &str = "params";

/// Emits `params.set` as its state delta and `params.confidence` as its
/// confidence. `params.fail` makes every attempt fail with that message and
/// `params.needs_document` requests a document.
///
/// Synchronous; registered through `handler::from_fn`.
pub fn replay_params(ctx: &StepContext) -> Result<StepOutcome, StepError> {
    let params = &ctx.step.params;

    if let Some(message) = params.get("fail").and_then(|v| v.as_str()) {
        return Err(StepError::failed(message));
    }

    let delta = params.get("set").cloned().unwrap_or(serde_json::Value::Null);
    let mut outcome = StepOutcome::new(delta);
    if let Some(confidence) = params.get("confidence").and_then(|v| v.as_f64()) {
        outcome = outcome.with_confidence(confidence);
    }
    if params.get("needs_document").and_then(|v| v.as_bool()) == Some(true) {
        outcome = outcome.needing_document();
    }
    Ok(outcome)
}
