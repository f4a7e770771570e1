//! Role configuration models for `.apc/roles/*.md`.
//!
//! Roles are defined as Markdown files with YAML front matter. The front
//! matter carries metadata and the body is the prompt template used when a
//! workflow phase runs an agent in that role.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Capability tier requested by a caller.
///
/// Backends map each tier to a concrete model identifier, so workflows never
/// hard-code model names.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, TS)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheapest model, for mechanical work.
    Low,
    /// General purpose model.
    #[default]
    Mid,
    /// Strongest model, for planning and review.
    High,
}

/// An agent role's configuration and prompt template.
///
/// # Example
///
/// ```markdown
/// ---
/// name: engineer
/// description: Implements tasks from the plan
/// tier: mid
/// timeout_secs: 3600
/// color: cyan
/// ---
///
/// You are a software engineer working on {{task}}.
/// Current phase: {{phase}}.
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct RoleConfig {
    /// Unique identifier for this role.
    ///
    /// Used by workflow phases and as the agent-pool key.
    pub name: String,

    /// Human-readable description of the role's purpose.
    #[serde(default)]
    pub description: String,

    /// Capability tier used for this role's runs.
    #[serde(default)]
    pub tier: ModelTier,

    /// Maximum runtime of one agent run, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Color hint used in transcripts.
    #[serde(default)]
    pub color: String,

    /// The body of the .md file, not part of the front matter.
    ///
    /// Supports `{{task}}` and `{{phase}}` placeholders.
    #[serde(skip)]
    pub prompt_template: String,
}

impl RoleConfig {
    /// Create a role with defaults and an empty template.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tier: ModelTier::default(),
            timeout_secs: None,
            color: String::new(),
            prompt_template: String::new(),
        }
    }

    /// Render the prompt template for a task and phase.
    pub fn render(&self, task: &str, phase: &str) -> String {
        self.prompt_template
            .replace("{{task}}", task)
            .replace("{{phase}}", phase)
    }
}
