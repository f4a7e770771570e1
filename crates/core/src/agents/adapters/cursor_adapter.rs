//! Cursor Agent CLI (`cursor-agent`).
//!
//! Runs headless with `--print --output-format stream-json`. Assistant text
//! arrives as cumulative snapshots of the current message.

use crate::agents::adapters::cli_backend::{AgentSettings, CliBackend, CliProfile};
use crate::agents::agent_type::BackendKind;
use crate::supervisor::ProcessSupervisor;

pub fn cursor_profile() -> CliProfile {
    CliProfile {
        kind: BackendKind::Cursor,
        program: "cursor-agent",
        args: &["--print", "--force", "--output-format", "stream-json"],
        model_flag: "--model",
        default_models: ["auto", "sonnet-4.5", "gpt-5"],
        install_command: Some("curl https://cursor.com/install -fsS | bash"),
        install_hint: "Install the Cursor Agent CLI: curl https://cursor.com/install -fsS | bash",
        orphan_signature: "cursor-agent",
        mcp_config: Some(".cursor/mcp.json"),
    }
}

impl CliBackend {
    /// Backend driving `cursor-agent`.
    pub fn cursor(supervisor: ProcessSupervisor, settings: AgentSettings) -> Self {
        Self::new(cursor_profile(), supervisor, settings)
    }
}
