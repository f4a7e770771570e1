//! Command-line interface definitions.

use apc_protocol::agent_models::ModelTier;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Coordinate AI coding agents across resumable workflows.
#[derive(Parser, Debug)]
#[command(name = "apc", version, about)]
pub struct Cli {
    /// Project root containing the `.apc/` directory.
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Backend to use instead of the configured one (cursor, claude, mock).
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that the agent CLIs are installed.
    Doctor,

    /// Run one agent on a prompt file.
    Run(RunArgs),

    /// Start, resume and list workflows.
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Kill agent processes left behind by a previous run.
    Sweep,

    /// Install the agent CLI of the active backend.
    InstallCli,

    /// Manage MCP servers of the active backend.
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// File holding the prompt.
    pub prompt_file: PathBuf,

    #[arg(long, value_enum, default_value_t = TierArg::Mid)]
    pub tier: TierArg,

    /// Maximum runtime in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Markdown file receiving the plan section of the answer.
    #[arg(long)]
    pub plan_file: Option<PathBuf>,

    /// Transcript log file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierArg {
    Low,
    Mid,
    High,
}

impl From<TierArg> for ModelTier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Low => ModelTier::Low,
            TierArg::Mid => ModelTier::Mid,
            TierArg::High => ModelTier::High,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum WorkflowAction {
    /// Start a workflow and follow it until it stops.
    Start {
        /// Workflow type, the `name` of a `.apc/workflows/*.yaml` file.
        workflow_type: String,

        /// Task the workflow works on.
        #[arg(long)]
        task: Option<String>,

        #[arg(long, default_value = "default")]
        session: String,
    },

    /// Resume a paused workflow and follow it.
    Resume {
        workflow_id: String,

        #[arg(long, default_value = "default")]
        session: String,
    },

    /// List paused workflows.
    Paused {
        #[arg(long, default_value = "default")]
        session: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum McpAction {
    /// Register an MCP server.
    Add {
        name: String,

        /// Environment variable for the server, as KEY=VALUE.
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        command: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Remove an MCP server.
    Remove { name: String },

    /// Show whether an MCP server is configured.
    Status { name: String },
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, val)| (key.to_string(), val.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{value}'"))
}
