//! The `AgentRunner` facade.
//!
//! Workflows talk to agents only through the runner. It owns the registered
//! backends, knows which one is active, and falls back to a secondary backend
//! when the active CLI is not installed.

use crate::agents::agent_type::BackendKind;
use crate::agents::base::{
    AgentBackend, AgentError, AgentRunResult, DependencyStatus, RunOptions, RunningAgent,
    StopReason,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Uniform run/stop surface over the registered backends.
pub struct AgentRunner {
    backends: Vec<Arc<dyn AgentBackend>>,
    active: RwLock<BackendKind>,
    fallback: Option<BackendKind>,
}

impl AgentRunner {
    /// Create a runner whose only backend is `backend`.
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        let active = backend.kind();
        Self {
            backends: vec![backend],
            active: RwLock::new(active),
            fallback: None,
        }
    }

    /// Register another backend. A backend of the same kind is replaced.
    pub fn with_backend(mut self, backend: Arc<dyn AgentBackend>) -> Self {
        self.backends.retain(|b| b.kind() != backend.kind());
        self.backends.push(backend);
        self
    }

    /// Use `kind` when the active backend is unavailable.
    pub fn with_fallback(mut self, kind: BackendKind) -> Self {
        self.fallback = Some(kind);
        self
    }

    pub fn active_kind(&self) -> BackendKind {
        *self.active.read()
    }

    /// Switch the active backend.
    pub fn set_active(&self, kind: BackendKind) -> Result<(), AgentError> {
        if self.backend(kind).is_none() {
            return Err(AgentError::NotAvailable(format!(
                "backend '{kind}' is not registered"
            )));
        }
        *self.active.write() = kind;
        info!(backend = %kind, "Active backend changed");
        Ok(())
    }

    pub fn backend(&self, kind: BackendKind) -> Option<Arc<dyn AgentBackend>> {
        self.backends.iter().find(|b| b.kind() == kind).cloned()
    }

    pub fn backends(&self) -> &[Arc<dyn AgentBackend>] {
        &self.backends
    }

    /// The active backend. Always registered, since `set_active` checks.
    pub fn active(&self) -> Option<Arc<dyn AgentBackend>> {
        self.backend(self.active_kind())
    }

    /// Run a prompt on the active backend, or the fallback when the active
    /// CLI is missing.
    ///
    /// # Behavior
    ///
    /// 1. Use the active backend if it is available
    /// 2. Otherwise try the fallback backend, if configured and available
    /// 3. Otherwise resolve as failed with the active backend's install hint
    pub async fn run(&self, options: RunOptions) -> AgentRunResult {
        let Some(active) = self.active() else {
            return AgentRunResult::failed(
                options.id,
                AgentError::NotAvailable("no backend registered".to_string()),
            );
        };
        if active.is_available().await {
            return active.run(options).await;
        }

        if let Some(fallback) = self
            .fallback
            .filter(|kind| *kind != active.kind())
            .and_then(|kind| self.backend(kind))
        {
            if fallback.is_available().await {
                warn!(
                    active = %active.kind(),
                    fallback = %fallback.kind(),
                    run_id = %options.id,
                    "Active backend unavailable, using fallback"
                );
                return fallback.run(options).await;
            }
        }

        let status = active.dependency_status().await;
        AgentRunResult::failed(
            options.id,
            AgentError::NotAvailable(format!("{} is not installed. {}", status.name, status.install_hint)),
        )
    }

    /// Stop a run on whichever backend owns it.
    pub async fn stop(&self, run_id: &str, reason: StopReason) -> bool {
        for backend in &self.backends {
            if backend.stop(run_id, reason).await {
                return true;
            }
        }
        false
    }

    pub async fn is_available(&self) -> bool {
        match self.active() {
            Some(active) => active.is_available().await,
            None => false,
        }
    }

    /// Dependency status of every registered backend.
    pub async fn dependency_status(&self) -> Vec<DependencyStatus> {
        let mut statuses = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            statuses.push(backend.dependency_status().await);
        }
        statuses
    }

    pub fn running_agents(&self) -> Vec<RunningAgent> {
        self.backends
            .iter()
            .flat_map(|b| b.running_agents())
            .collect()
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.backends.iter().any(|b| b.is_running(run_id))
    }

    pub fn partial_output(&self, run_id: &str) -> Option<String> {
        self.backends.iter().find_map(|b| b.partial_output(run_id))
    }

    /// Sweep orphaned processes of every backend.
    pub async fn kill_orphan_agents(&self) -> Vec<u32> {
        let mut killed = Vec::new();
        for backend in &self.backends {
            killed.extend(backend.kill_orphan_agents().await);
        }
        killed
    }

    pub async fn dispose(&self) {
        futures::future::join_all(self.backends.iter().map(|b| b.dispose())).await;
    }
}
