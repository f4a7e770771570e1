//! Base `AgentBackend` trait and supporting types.

use crate::agents::agent_type::BackendKind;
use crate::agents::mcp::McpServer;
use apc_protocol::agent_models::ModelTier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Receives human-readable progress notes (tool use, heartbeats).
pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives newly produced assistant text.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called once the agent process is running, with its run id and pid.
pub type StartCallback = Arc<dyn Fn(&str, Option<u32>) + Send + Sync>;

/// Options for a single agent run.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Run id; also the supervisor process id.
    pub id: String,

    /// Prompt text. Delivered through a private temp file, never as an argument.
    pub prompt: String,

    /// Working directory of the agent.
    pub cwd: PathBuf,

    /// Capability tier, mapped by the backend to a model identifier.
    pub tier: ModelTier,

    /// Colored transcript of the run.
    pub log_file: Option<PathBuf>,

    /// Markdown file receiving everything from the first heading onward.
    pub plan_file: Option<PathBuf>,

    /// Max runtime. Backend default when `None`.
    pub timeout: Option<Duration>,

    pub on_progress: Option<ProgressCallback>,
    pub on_output: Option<OutputCallback>,
    pub on_start: Option<StartCallback>,

    pub metadata: HashMap<String, String>,
}

impl RunOptions {
    /// Create options for a run with the given id, prompt and working directory.
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_plan_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.plan_file = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_output(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_output = Some(Arc::new(callback));
        self
    }

    pub fn on_start(mut self, callback: impl Fn(&str, Option<u32>) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(callback));
        self
    }

    pub(crate) fn progress(&self, message: &str) {
        if let Some(callback) = &self.on_progress {
            callback(message);
        }
    }

    pub(crate) fn output(&self, text: &str) {
        if let Some(callback) = &self.on_output {
            callback(text);
        }
    }

    pub(crate) fn started(&self, run_id: &str, pid: Option<u32>) {
        if let Some(callback) = &self.on_start {
            callback(run_id, pid);
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("id", &self.id)
            .field("prompt_len", &self.prompt.len())
            .field("cwd", &self.cwd)
            .field("tier", &self.tier)
            .field("log_file", &self.log_file)
            .field("plan_file", &self.plan_file)
            .field("timeout", &self.timeout)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Why a caller stopped a run.
///
/// Passed explicitly to [`AgentBackend::stop`] and read by the run when its
/// process exits, so a deliberate stop after a completion signal does not
/// read as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Abandon the run; it resolves as failed.
    Cancelled,
    /// The caller saw a structural completion signal; the run resolves as successful.
    Completed,
    /// The owning workflow is pausing; it resolves as failed and is not retried.
    Paused,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Paused => "paused",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent not available: {0}")]
    NotAvailable(String),
    #[error("Failed to start agent: {0}")]
    SpawnFailed(String),
    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),
    #[error("Agent exited with code {code:?}: {message}")]
    ExitFailure { code: Option<i32>, message: String },
    #[error("Agent reported an error: {0}")]
    Reported(String),
    #[error("Agent process error: {0}")]
    Process(String),
    #[error("Agent run stopped: {0}")]
    Stopped(StopReason),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Installation failed: {0}")]
    InstallFailed(String),
    #[error("MCP configuration error: {0}")]
    Mcp(String),
}

impl AgentError {
    /// Errors the retry loop must never repeat, regardless of classification.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Stopped(_) | Self::Timeout(_) | Self::NotAvailable(_) | Self::SpawnFailed(_)
        )
    }
}

/// Outcome of one agent run. Runs never fail with `Err`; failures land here.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRunResult {
    /// Id of the attempt that produced this result.
    pub run_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Definitive output: the CLI's `result` payload, else the collected text.
    pub output: String,
    pub error: Option<AgentError>,
    pub duration: Duration,
}

impl AgentRunResult {
    /// A failed result that never reached a running process.
    pub fn failed(run_id: impl Into<String>, error: AgentError) -> Self {
        Self {
            run_id: run_id.into(),
            success: false,
            exit_code: None,
            output: String::new(),
            error: Some(error),
            duration: Duration::ZERO,
        }
    }
}

/// Availability of a backend's external CLI, with install guidance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStatus {
    pub name: String,
    pub installed: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub install_hint: String,
}

/// A run currently executing in a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningAgent {
    pub run_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// One driver per external agent CLI.
///
/// Implementations are selected through [`BackendKind`] and used behind the
/// [`AgentRunner`](crate::agents::AgentRunner) facade.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Execute a prompt to completion. Never returns an error; see
    /// [`AgentRunResult::error`].
    async fn run(&self, options: RunOptions) -> AgentRunResult;

    /// Stop a run (or every retry attempt of it). Returns `true` if a run was found.
    async fn stop(&self, run_id: &str, reason: StopReason) -> bool;

    async fn is_available(&self) -> bool;

    async fn dependency_status(&self) -> DependencyStatus;

    fn running_agents(&self) -> Vec<RunningAgent>;

    fn is_running(&self, run_id: &str) -> bool;

    /// Output buffered so far by an in-flight run.
    fn partial_output(&self, run_id: &str) -> Option<String>;

    async fn install_cli(&self) -> Result<(), AgentError> {
        Err(AgentError::InstallFailed(format!(
            "{} has no installer",
            self.kind().name()
        )))
    }

    fn mcp_config_path(&self) -> Option<PathBuf> {
        None
    }

    async fn install_mcp(&self, _server: &McpServer) -> Result<(), AgentError> {
        Err(AgentError::Mcp(format!(
            "{} does not support MCP servers",
            self.kind().name()
        )))
    }

    async fn remove_mcp(&self, _name: &str) -> Result<bool, AgentError> {
        Ok(false)
    }

    async fn is_mcp_configured(&self, _name: &str) -> bool {
        false
    }

    /// Kill processes of this backend's CLI left behind by an earlier daemon.
    async fn kill_orphan_agents(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Stop all runs and release resources.
    async fn dispose(&self);
}
