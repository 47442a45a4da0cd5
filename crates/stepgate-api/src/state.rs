//! Application state wiring the engine together.
//!
//! AppState holds the concrete executor used by every CLI command. The engine
//! is generic over its repository; AppState pins it to the SQLite adapter.

use std::path::PathBuf;
use std::sync::Arc;

use stepgate_core::event::EventBus;
use stepgate_core::workflow::definition::WorkflowDefinitionStore;
use stepgate_core::workflow::executor::WorkflowExecutor;
use stepgate_core::workflow::handler::{HandlerRegistry, from_fn};
use stepgate_infra::config::{load_engine_config, resolve_data_dir, templates_path};
use stepgate_infra::sqlite::pool::{DATABASE_FILE, DatabasePool};
use stepgate_infra::sqlite::workflow::SqliteWorkflowRepository;

use crate::builtin::{PARAMS_HANDLER, replay_params};

/// Executor pinned to the SQLite repository.
pub type ConcreteExecutor = WorkflowExecutor<SqliteWorkflowRepository>;

/// Shared application state.
pub struct AppState {
    pub executor: Arc<ConcreteExecutor>,
    pub events: EventBus,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Templates the executor loads workflows from.
    pub fn definitions(&self) -> &Arc<WorkflowDefinitionStore> {
        self.executor.definitions()
    }

    /// Initialize the application state: load config, open the database,
    /// and wire the executor.
    pub async fn init() -> anyhow::Result<Self> {
        Self::init_at(resolve_data_dir()).await
    }

    pub async fn init_at(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;

        let db_url = format!(
            "sqlite://{}?mode=rwc",
            data_dir.join(DATABASE_FILE).display()
        );
        let db_pool = DatabasePool::new(&db_url).await?;
        let repo = Arc::new(SqliteWorkflowRepository::new(db_pool));

        let definitions = Arc::new(WorkflowDefinitionStore::new(templates_path(
            &data_dir, &config,
        )));

        let mut handlers = HandlerRegistry::new();
        handlers.register(PARAMS_HANDLER, from_fn(replay_params));

        let events = EventBus::new(config.event_capacity);
        let executor = WorkflowExecutor::new(
            repo,
            definitions,
            handlers,
            Arc::new(events.clone()),
            &config,
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self {
            executor: Arc::new(executor),
            events,
            data_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgate_core::workflow::executor::StartOptions;
    use stepgate_types::audit::Actor;
    use stepgate_types::task::TaskStatus;

    const TEMPLATE: &str = r#"
workflow_type: payroll
version: "3"
name: Monthly payroll
supervision_mode: confidence_based
steps:
  - id: gather
    name: Gather timesheets
    handler: params
    params:
      set: { hours: 160 }
      confidence: 0.99
  - id: compute
    name: Compute salaries
    handler: params
    required_inputs: [hours]
    params:
      set: { gross: 5200 }
      confidence: 0.6
"#;

    #[tokio::test]
    async fn wires_templates_handlers_and_storage() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        tokio::fs::create_dir_all(&templates).await.unwrap();
        tokio::fs::write(templates.join("payroll.yaml"), TEMPLATE).await.unwrap();

        let state = AppState::init_at(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(state.definitions().list().unwrap(), vec!["payroll".to_string()]);

        let paused = state
            .executor
            .start_workflow("acme", "payroll", StartOptions::default())
            .await
            .unwrap();
        assert_eq!(paused.task.status, TaskStatus::Paused);
        assert_eq!(paused.task.current_step_id.as_deref(), Some("compute"));
        let checkpoint = paused.checkpoint.unwrap();

        let done = state
            .executor
            .approve_checkpoint(checkpoint.id, &Actor::user("controller"), None)
            .await
            .unwrap();
        assert_eq!(done.task.status, TaskStatus::Completed);
        assert_eq!(done.task.state, serde_json::json!({"hours": 160, "gross": 5200}));
        assert!(dir.path().join(DATABASE_FILE).exists());
    }
}
