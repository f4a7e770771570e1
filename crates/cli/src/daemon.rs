//! Wiring of the core services for one project.

use apc_core::agents::{AgentFactory, AgentRunner};
use apc_core::config::{load_config, CONFIG_DIR};
use apc_core::engine::WorkflowEngine;
use apc_core::state::WorkflowCoordinator;
use apc_core::supervisor::{ProcessSupervisor, SupervisorSettings};
use apc_core::workflow::{
    AgentPool, JsonFileStore, SessionStore, WorkflowPauseManager, WorkflowRegistry,
    WorkflowServices,
};
use apc_protocol::ipc::Event;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// Backend, engine and coordinator built from `.apc/`.
pub struct Daemon {
    pub root: PathBuf,
    pub runner: Arc<AgentRunner>,
    pub coordinator: WorkflowCoordinator,
}

impl Daemon {
    /// Load the project configuration and build every service.
    ///
    /// `backend` overrides the configured backend name.
    pub async fn open(root: &Path, backend: Option<&str>) -> Result<(Self, mpsc::Receiver<Event>)> {
        let mut config = load_config(root)
            .await
            .wrap_err_with(|| format!("loading {}", root.join(CONFIG_DIR).display()))?;
        if let Some(backend) = backend {
            config.global.backend = backend.to_string();
        }

        let state_dir = config.state_dir(root);
        let supervisor = ProcessSupervisor::new(SupervisorSettings::from_config(
            &config.global.supervisor,
            Some(state_dir.join("processes")),
        ));
        let backend = AgentFactory::from_config(&config.global, &supervisor)?;
        debug!(backend = %backend.kind(), state_dir = %state_dir.display(), "Opening project");
        let runner = Arc::new(AgentRunner::new(backend));

        let (tx, events) = mpsc::channel(EVENT_CAPACITY);
        let services = WorkflowServices::new(
            Arc::clone(&runner),
            AgentPool::from_config(&config.global.pool),
            root,
        )
        .with_roles(config.role_registry())
        .with_events(tx)
        .with_log_dir(state_dir.join("logs"));
        let store: Arc<dyn SessionStore> = Arc::new(JsonFileStore::new(state_dir.join("workflows")));
        let pause_manager = Arc::new(WorkflowPauseManager::new(
            Arc::clone(&runner),
            Some(store),
            config.global.engine.continuation_tail_chars,
        ));
        let engine = Arc::new(WorkflowEngine::new(
            services,
            pause_manager,
            config.global.engine.max_loop_iterations,
        ));
        let registry = WorkflowRegistry::from_definitions(config.workflows);

        let daemon = Self {
            root: root.to_path_buf(),
            runner,
            coordinator: WorkflowCoordinator::new(engine, registry),
        };
        Ok((daemon, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apc_core::agents::BackendKind;
    use apc_core::state::WorkflowStatus;

    #[tokio::test]
    async fn test_open_and_run_workflow_on_mock() {
        let temp_dir = tempfile::tempdir().unwrap();
        let workflows = temp_dir.path().join(".apc/workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(
            workflows.join("review.yaml"),
            "name: review\nphases:\n  - name: read\n    prompt: \"Review {{task}}\"\n",
        )
        .unwrap();

        let (daemon, mut events) = Daemon::open(temp_dir.path(), Some("mock")).await.unwrap();
        assert_eq!(daemon.runner.active_kind(), BackendKind::Mock);

        let id = daemon
            .coordinator
            .start("review", "s-1", Some("T1".to_string()))
            .await
            .unwrap();
        assert_eq!(daemon.coordinator.wait(&id).await, Some(WorkflowStatus::Completed));
        assert!(matches!(events.recv().await, Some(Event::WorkflowStarted { .. })));
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(Daemon::open(temp_dir.path(), Some("gemini")).await.is_err());
    }
}
