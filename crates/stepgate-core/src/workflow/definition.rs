//! Workflow template parsing, validation, and the caching definition store.
//!
//! Templates are YAML files named `{workflow_type}.yaml` (or `.yml`) inside a
//! templates directory. A template is validated in full before it is handed
//! out; callers never see a partially valid definition.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use stepgate_types::definition::WorkflowDefinition;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A structural problem in a workflow template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid template {}: field '{field}': {message}", path.display())]
pub struct TemplateError {
    /// Source file (or a `<registered:...>` marker for in-memory definitions).
    pub path: PathBuf,
    /// Dotted path of the failing field, e.g. `steps[2].on_reject`.
    pub field: String,
    pub message: String,
}

impl TemplateError {
    fn new(path: &Path, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            field: field.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML template and validate it.
///
/// `path` is only used for error reporting.
pub fn parse_template(yaml: &str, path: &Path) -> Result<WorkflowDefinition, TemplateError> {
    let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).map_err(|e| {
        let message = e.to_string();
        let field = missing_field(&message).unwrap_or_else(|| "document".to_string());
        TemplateError::new(path, field, message)
    })?;
    validate_definition(def, path)
}

/// Extract the field name from a serde "missing field" message.
///
/// Nested locations come through as `steps[1]: missing field `name` ...`,
/// which maps to `steps[1].name`.
fn missing_field(message: &str) -> Option<String> {
    let marker = "missing field `";
    let start = message.find(marker)?;
    let rest = &message[start + marker.len()..];
    let name = &rest[..rest.find('`')?];

    let prefix = message[..start].trim().trim_end_matches(':').trim();
    if prefix.is_empty() || prefix == "." || prefix.contains(char::is_whitespace) {
        Some(name.to_string())
    } else {
        Some(format!("{prefix}.{name}"))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition and fold template-level checkpoint references into
/// the steps they name.
///
/// Checks:
/// - `workflow_type` and `version` are non-empty
/// - at least one step exists, each with a non-empty id and name
/// - step ids are unique
/// - every `checkpoints` entry names an existing step
/// - `on_reject` names an existing step at or before the rejecting one
/// - `timeout_secs` is greater than zero when set
pub fn validate_definition(
    mut def: WorkflowDefinition,
    path: &Path,
) -> Result<WorkflowDefinition, TemplateError> {
    if def.workflow_type.trim().is_empty() {
        return Err(TemplateError::new(path, "workflow_type", "must not be empty"));
    }
    if def.version.trim().is_empty() {
        return Err(TemplateError::new(path, "version", "must not be empty"));
    }
    if def.steps.is_empty() {
        return Err(TemplateError::new(path, "steps", "workflow must have at least one step"));
    }

    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (i, step) in def.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(TemplateError::new(path, format!("steps[{i}].id"), "must not be empty"));
        }
        if step.name.trim().is_empty() {
            return Err(TemplateError::new(path, format!("steps[{i}].name"), "must not be empty"));
        }
        if step.handler.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(TemplateError::new(
                path,
                format!("steps[{i}].handler"),
                "must not be empty when set",
            ));
        }
        if step.timeout_secs == Some(0) {
            return Err(TemplateError::new(
                path,
                format!("steps[{i}].timeout_secs"),
                "timeout must be > 0",
            ));
        }
        if positions.insert(step.id.as_str(), i).is_some() {
            return Err(TemplateError::new(
                path,
                format!("steps[{i}].id"),
                format!("duplicate step id '{}'", step.id),
            ));
        }
    }

    for (i, step) in def.steps.iter().enumerate() {
        if let Some(target) = &step.on_reject {
            match positions.get(target.as_str()) {
                None => {
                    return Err(TemplateError::new(
                        path,
                        format!("steps[{i}].on_reject"),
                        format!("unknown step '{target}'"),
                    ));
                }
                Some(&pos) if pos > i => {
                    return Err(TemplateError::new(
                        path,
                        format!("steps[{i}].on_reject"),
                        format!("step '{target}' comes after '{}'", step.id),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    let mut flagged = HashSet::new();
    for (j, reference) in def.checkpoints.iter().enumerate() {
        if !positions.contains_key(reference.as_str()) {
            return Err(TemplateError::new(
                path,
                format!("checkpoints[{j}]"),
                format!("checkpoint references unknown step '{reference}'"),
            ));
        }
        flagged.insert(reference.clone());
    }
    for step in &mut def.steps {
        if flagged.contains(&step.id) {
            step.checkpoint = true;
        }
    }

    Ok(def)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Loads, validates, and caches workflow definitions.
///
/// Cached definitions are shared as `Arc` and never mutated; `reload` and
/// `invalidate_all` are the only ways to drop them.
pub struct WorkflowDefinitionStore {
    dir: Option<PathBuf>,
    cache: DashMap<String, Arc<WorkflowDefinition>>,
    registered: DashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowDefinitionStore {
    /// Store backed by a templates directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            cache: DashMap::new(),
            registered: DashMap::new(),
        }
    }

    /// Store holding only registered definitions.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            cache: DashMap::new(),
            registered: DashMap::new(),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Validate and add a definition that does not live on disk.
    ///
    /// Registered definitions take precedence over template files.
    pub fn register(&self, def: WorkflowDefinition) -> Result<(), TemplateError> {
        let marker = PathBuf::from(format!("<registered:{}>", def.workflow_type));
        let def = validate_definition(def, &marker)?;
        self.registered
            .insert(def.workflow_type.clone(), Arc::new(def));
        Ok(())
    }

    /// Load a definition by workflow type, from cache when possible.
    pub fn load(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        check_type_name(workflow_type)?;

        if let Some(def) = self.registered.get(workflow_type) {
            return Ok(Arc::clone(def.value()));
        }
        if let Some(def) = self.cache.get(workflow_type) {
            return Ok(Arc::clone(def.value()));
        }

        let path = self
            .template_path(workflow_type)
            .ok_or_else(|| EngineError::not_found("workflow definition", workflow_type))?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| TemplateError::new(&path, "file", e.to_string()))?;
        let def = parse_template(&content, &path)?;
        if def.workflow_type != workflow_type {
            return Err(TemplateError::new(
                &path,
                "workflow_type",
                format!(
                    "'{}' does not match file name '{workflow_type}'",
                    def.workflow_type
                ),
            )
            .into());
        }

        tracing::debug!(workflow_type, path = %path.display(), "loaded workflow template");
        let def = Arc::new(def);
        self.cache
            .insert(workflow_type.to_string(), Arc::clone(&def));
        Ok(def)
    }

    /// Drop the cached copy of one template and load it again.
    pub fn reload(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.cache.remove(workflow_type);
        self.load(workflow_type)
    }

    /// Drop every cached template. Registered definitions stay.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    /// All available workflow types, sorted.
    pub fn list(&self) -> Result<Vec<String>, EngineError> {
        let mut types: BTreeSet<String> =
            self.registered.iter().map(|e| e.key().clone()).collect();

        if let Some(dir) = self.dir.as_deref().filter(|d| d.is_dir()) {
            let entries = std::fs::read_dir(dir).map_err(|e| {
                EngineError::Validation(format!(
                    "cannot read templates directory {}: {e}",
                    dir.display()
                ))
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                let is_yaml = path
                    .extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml");
                if !is_yaml || !path.is_file() {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    types.insert(stem.to_string());
                }
            }
        }

        Ok(types.into_iter().collect())
    }

    fn template_path(&self, workflow_type: &str) -> Option<PathBuf> {
        let dir = self.dir.as_deref()?;
        ["yaml", "yml"]
            .iter()
            .map(|ext| dir.join(format!("{workflow_type}.{ext}")))
            .find(|p| p.is_file())
    }
}

/// Workflow types double as file stems: alphanumerics, hyphens, underscores.
fn check_type_name(workflow_type: &str) -> Result<(), EngineError> {
    let valid = !workflow_type.is_empty()
        && workflow_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "invalid workflow type '{workflow_type}'"
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
