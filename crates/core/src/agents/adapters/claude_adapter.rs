//! Claude Code CLI (`claude`).
//!
//! Runs in print mode with `--output-format stream-json --verbose`. Each
//! assistant message arrives whole, so every message after the first starts
//! a new transcript message.

use crate::agents::adapters::cli_backend::{AgentSettings, CliBackend, CliProfile};
use crate::agents::agent_type::BackendKind;
use crate::supervisor::ProcessSupervisor;

pub fn claude_profile() -> CliProfile {
    CliProfile {
        kind: BackendKind::Claude,
        program: "claude",
        args: &[
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
        ],
        model_flag: "--model",
        default_models: ["haiku", "sonnet", "opus"],
        install_command: Some("npm install -g @anthropic-ai/claude-code"),
        install_hint: "Install Claude Code: npm install -g @anthropic-ai/claude-code",
        orphan_signature: "claude -p --output-format stream-json",
        mcp_config: Some(".claude.json"),
    }
}

impl CliBackend {
    /// Backend driving `claude`.
    pub fn claude(supervisor: ProcessSupervisor, settings: AgentSettings) -> Self {
        Self::new(claude_profile(), supervisor, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::base::AgentBackend;
    use apc_protocol::agent_models::ModelTier;

    #[test]
    fn test_claude_args() {
        let mut settings = AgentSettings::default();
        settings.models.mid = "claude-sonnet-4-5".to_string();
        let backend = CliBackend::claude(ProcessSupervisor::default(), settings);

        assert_eq!(backend.kind(), BackendKind::Claude);
        let args = backend.build_args(ModelTier::Mid);
        assert_eq!(args[0], "-p");
        assert_eq!(args[args.len() - 2..], ["--model", "claude-sonnet-4-5"]);
        assert_eq!(backend.model_for(ModelTier::Low), "haiku");
    }

    #[test]
    fn test_orphan_signature_matches_own_command_line() {
        let profile = claude_profile();
        let command_line = format!("node /usr/local/bin/claude {}", profile.args.join(" "));
        assert!(command_line.contains(profile.orphan_signature));
    }
}
