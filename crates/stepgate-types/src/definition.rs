//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the parsed, immutable form of a declarative
//! template: an ordered list of steps plus the supervision defaults that
//! apply to tasks created from it. Definitions are treated strictly as
//! configuration data; the engine never mutates them after load.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A validated workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Type identifier (e.g. "quarterly-vat-return"). Matches the template file stem.
    pub workflow_type: String,
    /// Template version string (e.g. "1.2.0").
    pub version: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Supervision mode for new tasks when the caller does not pick one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervision_mode: Option<SupervisionMode>,
    /// Template-level checkpoint references: step IDs that always carry a checkpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<String>,
    /// Ordered steps. Execution follows this order exactly.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Position of a step in the ordered sequence.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Whether `step_id` is the last step of the sequence.
    pub fn is_final_step(&self, step_id: &str) -> bool {
        self.steps.last().is_some_and(|s| s.id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step ID, unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Name of the domain handler that executes this step. Defaults to the step ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Pause for approval here under `approval_required` supervision.
    #[serde(default)]
    pub checkpoint: bool,
    /// State keys that must exist before the step runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_inputs: Vec<String>,
    /// Re-run this step after its checkpoint is approved instead of moving on.
    #[serde(default)]
    pub revalidate_on_resume: bool,
    /// Step to restart from when this step's checkpoint is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reject: Option<String>,
    /// Handler timeout in seconds (falls back to the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Opaque handler parameters.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl StepDefinition {
    /// The handler name this step resolves to.
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// Supervision Mode
// ---------------------------------------------------------------------------

/// How eagerly the engine pauses for human approval.
///
/// Parsing never fails: an unrecognized mode resolves to
/// [`SupervisionMode::FullSupervision`], the most conservative policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SupervisionMode {
    /// Pause after every step.
    #[default]
    FullSupervision,
    /// Pause only at steps flagged `checkpoint: true`.
    ApprovalRequired,
    /// Pause only when a step reports confidence below the threshold.
    ConfidenceBased,
    /// Pause only at the final step.
    ReviewCheckpoints,
}

impl SupervisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisionMode::FullSupervision => "full_supervision",
            SupervisionMode::ApprovalRequired => "approval_required",
            SupervisionMode::ConfidenceBased => "confidence_based",
            SupervisionMode::ReviewCheckpoints => "review_checkpoints",
        }
    }
}

impl fmt::Display for SupervisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SupervisionMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "approval_required" => SupervisionMode::ApprovalRequired,
            "confidence_based" => SupervisionMode::ConfidenceBased,
            "review_checkpoints" => SupervisionMode::ReviewCheckpoints,
            _ => SupervisionMode::FullSupervision,
        })
    }
}

impl From<String> for SupervisionMode {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(mode) => mode,
            Err(never) => match never {},
        }
    }
}

impl From<SupervisionMode> for String {
    fn from(mode: SupervisionMode) -> Self {
        mode.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
