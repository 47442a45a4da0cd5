//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! supervision thresholds, checkpoint lifetimes, and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for `checkpoint_timeout_secs`: one hundred years.
pub const MAX_CHECKPOINT_TIMEOUT_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.stepgate/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Confidence below which `confidence_based` supervision pauses.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// How long a checkpoint may stay pending before it can time out.
    #[serde(default = "default_checkpoint_timeout_secs")]
    pub checkpoint_timeout_secs: u64,

    /// Maximum number of checkpoints a single task may create.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints_per_task: u32,

    /// Default per-step handler timeout.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Directory holding workflow templates, relative to the data dir.
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,

    /// Capacity of the engine event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Retry policy for step handlers and persistence writes.
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_confidence_threshold() -> f64 {
    0.90
}

fn default_checkpoint_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_checkpoints() -> u32 {
    100
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_templates_dir() -> String {
    "templates".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            checkpoint_timeout_secs: default_checkpoint_timeout_secs(),
            max_checkpoints_per_task: default_max_checkpoints(),
            step_timeout_secs: default_step_timeout_secs(),
            templates_dir: default_templates_dir(),
            event_capacity: default_event_capacity(),
            retry: RetrySettings::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp out-of-range values into their valid domain.
    pub fn normalized(mut self) -> Self {
        if !self.confidence_threshold.is_finite() {
            self.confidence_threshold = default_confidence_threshold();
        }
        self.confidence_threshold = self.confidence_threshold.clamp(0.0, 1.0);
        self.checkpoint_timeout_secs = self.checkpoint_timeout_secs.min(MAX_CHECKPOINT_TIMEOUT_SECS);
        self.max_checkpoints_per_task = self.max_checkpoints_per_task.max(1);
        self.step_timeout_secs = self.step_timeout_secs.max(1);
        self.event_capacity = self.event_capacity.max(1);
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            self.retry.max_delay_ms = self.retry.base_delay_ms;
        }
        self
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoint_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt (3 means up to 4 attempts in total).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add random jitter of up to half the computed delay.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.confidence_threshold, 0.90);
        assert_eq!(config.checkpoint_timeout_secs, 86_400);
        assert_eq!(config.max_checkpoints_per_task, 100);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.retry.jitter);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.confidence_threshold, 0.90);
        assert_eq!(config.templates_dir, "templates");
        assert_eq!(config.retry.base_delay_ms, 500);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
confidence_threshold = 0.75
checkpoint_timeout_secs = 3600

[retry]
max_retries = 5
base_delay_ms = 10
jitter = false
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.confidence_threshold, 0.75);
        assert_eq!(config.checkpoint_timeout(), Duration::from_secs(3600));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert!(!config.retry.jitter);
    }

    #[test]
    fn test_normalized_clamps_values() {
        let mut config = EngineConfig::default();
        config.confidence_threshold = 1.7;
        config.max_checkpoints_per_task = 0;
        config.checkpoint_timeout_secs = u64::MAX;
        config.retry.base_delay_ms = 5_000;
        config.retry.max_delay_ms = 100;

        let config = config.normalized();
        assert_eq!(config.confidence_threshold, 1.0);
        assert_eq!(config.checkpoint_timeout_secs, MAX_CHECKPOINT_TIMEOUT_SECS);
        assert_eq!(config.max_checkpoints_per_task, 1);
        assert_eq!(config.retry.max_delay_ms, 5_000);
    }
}
