//! Configuration models that aggregate all settings.

use apc_protocol::agent_models::RoleConfig;
use apc_protocol::config_models::GlobalConfig;
use apc_protocol::workflow_models::WorkflowDefinition;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything loaded from `.apc/`.
///
/// # Example
///
/// ```rust,no_run
/// use apc_core::config::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Loaded {} roles and {} workflows",
///          config.roles.len(),
///          config.workflows.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ApcConfig {
    /// Global settings from `config.toml`.
    pub global: GlobalConfig,

    /// Role definitions from `roles/*.md`.
    pub roles: Vec<RoleConfig>,

    /// Workflow definitions from `workflows/*.yaml`.
    pub workflows: Vec<WorkflowDefinition>,
}

impl ApcConfig {
    pub fn role_registry(&self) -> RoleRegistry {
        RoleRegistry::new(self.roles.clone())
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.iter().find(|w| w.name == name)
    }

    /// State directory, resolved against the project root.
    pub fn state_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.global.state_dir)
    }
}

/// Role lookup for workflow phases: tier, timeout and prompt preamble.
///
/// Unknown roles resolve to a default role so a workflow can name pool roles
/// that have no Markdown definition.
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    roles: HashMap<String, RoleConfig>,
}

impl RoleRegistry {
    pub fn new(roles: Vec<RoleConfig>) -> Self {
        Self {
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    pub fn insert(&mut self, role: RoleConfig) {
        self.roles.insert(role.name.clone(), role);
    }

    pub fn get(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.get(name)
    }

    /// The named role, or a default role of that name.
    pub fn resolve(&self, name: &str) -> RoleConfig {
        self.roles
            .get(name)
            .cloned()
            .unwrap_or_else(|| RoleConfig::new(name))
    }

    pub fn timeout(&self, name: &str) -> Option<Duration> {
        self.roles
            .get(name)
            .and_then(|r| r.timeout_secs)
            .map(Duration::from_secs)
    }

    /// Role names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.roles.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apc_protocol::agent_models::ModelTier;

    #[test]
    fn test_role_registry_resolve() {
        let mut planner = RoleConfig::new("planner");
        planner.tier = ModelTier::High;
        planner.timeout_secs = Some(600);
        let registry = RoleRegistry::new(vec![planner]);

        assert_eq!(registry.resolve("planner").tier, ModelTier::High);
        assert_eq!(registry.timeout("planner"), Some(Duration::from_secs(600)));

        let fallback = registry.resolve("engineer");
        assert_eq!(fallback.name, "engineer");
        assert_eq!(fallback.tier, ModelTier::Mid);
        assert!(registry.timeout("engineer").is_none());
        assert_eq!(registry.names(), vec!["planner".to_string()]);
    }

    #[test]
    fn test_state_dir_is_relative_to_root() {
        let config = ApcConfig::default();
        assert_eq!(
            config.state_dir(Path::new("/work/project")),
            PathBuf::from("/work/project/.apc/state")
        );
    }
}
