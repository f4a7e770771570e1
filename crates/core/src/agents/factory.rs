//! Backend factory for creating backends from configuration.

use crate::agents::adapters::{AgentSettings, CliBackend, MockBackend};
use crate::agents::agent_type::BackendKind;
use crate::agents::base::{AgentBackend, AgentError};
use crate::agents::retry::RetryPolicy;
use crate::supervisor::ProcessSupervisor;
use apc_protocol::config_models::GlobalConfig;
use std::sync::Arc;

/// Builds backends wired to a shared supervisor.
pub struct AgentFactory;

impl AgentFactory {
    /// Create a backend of the given kind.
    ///
    /// CLI backends take their run settings from `[agent]` and their retry
    /// policy from `[retry]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use apc_core::agents::{AgentFactory, BackendKind};
    /// use apc_core::supervisor::ProcessSupervisor;
    /// use apc_protocol::GlobalConfig;
    ///
    /// let backend = AgentFactory::create(
    ///     BackendKind::Mock,
    ///     &GlobalConfig::default(),
    ///     &ProcessSupervisor::default(),
    /// );
    /// assert_eq!(backend.kind(), BackendKind::Mock);
    /// ```
    pub fn create(
        kind: BackendKind,
        config: &GlobalConfig,
        supervisor: &ProcessSupervisor,
    ) -> Arc<dyn AgentBackend> {
        let settings = AgentSettings::from(&config.agent);
        let retry = RetryPolicy::from(&config.retry);
        match kind {
            BackendKind::Cursor => {
                Arc::new(CliBackend::cursor(supervisor.clone(), settings).with_retry(retry))
            }
            BackendKind::Claude => {
                Arc::new(CliBackend::claude(supervisor.clone(), settings).with_retry(retry))
            }
            BackendKind::Mock => Arc::new(MockBackend::new()),
        }
    }

    /// Create the backend named by `config.backend`.
    pub fn from_config(
        config: &GlobalConfig,
        supervisor: &ProcessSupervisor,
    ) -> Result<Arc<dyn AgentBackend>, AgentError> {
        let kind = BackendKind::from_name(&config.backend).ok_or_else(|| {
            let known: Vec<&str> = BackendKind::ALL.iter().map(BackendKind::name).collect();
            AgentError::NotAvailable(format!(
                "unknown backend '{}' (expected one of: {})",
                config.backend,
                known.join(", ")
            ))
        })?;
        Ok(Self::create(kind, config, supervisor))
    }
}
