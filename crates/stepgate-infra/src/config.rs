//! Engine configuration loader for stepgate.
//!
//! Reads `config.toml` from the data directory (`~/.stepgate/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed, and always returns a normalized config.

use std::path::{Path, PathBuf};

use stepgate_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPGATE_DATA_DIR";

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Resolve the data directory.
///
/// Priority:
/// 1. `STEPGATE_DATA_DIR` if set and non-empty
/// 2. `~/.stepgate`
/// 3. `./.stepgate` when no home directory is known
pub fn resolve_data_dir() -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
}

fn data_dir_from(env_value: Option<PathBuf>) -> PathBuf {
    match env_value {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stepgate"),
    }
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with out-of-range values clamped.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config.normalized(),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Absolute templates directory: `templates_dir` joined onto the data dir
/// unless it is already absolute.
pub fn templates_path(data_dir: &Path, config: &EngineConfig) -> PathBuf {
    let configured = Path::new(&config.templates_dir);
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        data_dir.join(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.confidence_threshold, 0.90);
        assert_eq!(config.checkpoint_timeout_secs, 86_400);
        assert_eq!(config.max_checkpoints_per_task, 100);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
confidence_threshold = 0.75
checkpoint_timeout_secs = 3600
templates_dir = "/srv/workflows"

[retry]
max_retries = 5
base_delay_ms = 100
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.confidence_threshold, 0.75);
        assert_eq!(config.checkpoint_timeout_secs, 3600);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert!(config.retry.jitter);
        assert_eq!(config.step_timeout_secs, 300);
        assert_eq!(templates_path(tmp.path(), &config), PathBuf::from("/srv/workflows"));
    }

    #[tokio::test]
    async fn load_engine_config_clamps_values() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            "confidence_threshold = 1.5\nmax_checkpoints_per_task = 0\n\n[retry]\nbase_delay_ms = 9000\nmax_delay_ms = 10\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.confidence_threshold, 1.0);
        assert_eq!(config.max_checkpoints_per_task, 1);
        assert_eq!(config.retry.max_delay_ms, 9000);
    }

    #[tokio::test]
    async fn load_engine_config_malformed_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "confidence_threshold = [oops")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.confidence_threshold, 0.90);
    }

    #[test]
    fn data_dir_prefers_explicit_value() {
        assert_eq!(
            data_dir_from(Some(PathBuf::from("/data/stepgate"))),
            PathBuf::from("/data/stepgate")
        );
        assert!(data_dir_from(Some(PathBuf::new())).ends_with(".stepgate"));
        assert!(data_dir_from(None).ends_with(".stepgate"));
    }

    #[test]
    fn relative_templates_dir_joins_data_dir() {
        let config = EngineConfig::default();
        assert_eq!(
            templates_path(Path::new("/data"), &config),
            PathBuf::from("/data/templates")
        );
    }
}
