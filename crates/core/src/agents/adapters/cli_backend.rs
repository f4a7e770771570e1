//! Generic driver for agent CLIs that speak newline-delimited JSON.
//!
//! Each supported CLI is described by a [`CliProfile`]; everything else
//! (prompt delivery, supervision, stream parsing, transcript and plan files,
//! the idle watchdog, retries) is shared.

use crate::agents::agent_type::BackendKind;
use crate::agents::base::{
    AgentBackend, AgentError, AgentRunResult, DependencyStatus, RunOptions, RunningAgent,
    StopReason,
};
use crate::agents::log_file::{EntryKind, Rotation, TranscriptLog};
use crate::agents::mcp::{self, McpServer};
use crate::agents::retry::{run_with_retry, ErrorClassifier, PatternClassifier, RetryPolicy};
use crate::agents::stream::{parse_line, StreamEvent};
use crate::agents::transcript::{PlanWriter, TranscriptCursor, TranscriptDelta};
use crate::supervisor::{
    OutputLine, ProcessExit, ProcessHandlers, ProcessSupervisor, SpawnOptions, SupervisorError,
};
use apc_protocol::agent_models::ModelTier;
use apc_protocol::config_models::{AgentConfig, TierModels};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Characters of stderr kept for failure messages.
const STDERR_TAIL_CHARS: usize = 2_000;

/// Static description of one agent CLI.
#[derive(Debug, Clone)]
pub struct CliProfile {
    pub kind: BackendKind,
    /// Executable name looked up on PATH.
    pub program: &'static str,
    /// Arguments placed before the model flag.
    pub args: &'static [&'static str],
    pub model_flag: &'static str,
    /// Model per tier (low, mid, high) when the configuration leaves it empty.
    pub default_models: [&'static str; 3],
    /// Shell command that installs the CLI.
    pub install_command: Option<&'static str>,
    pub install_hint: &'static str,
    /// Command-line fragment identifying this CLI's processes.
    pub orphan_signature: &'static str,
    /// MCP configuration file, relative to the home directory.
    pub mcp_config: Option<&'static str>,
}

/// Agent run settings in their runtime form.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub default_timeout: Duration,
    pub idle_threshold: Duration,
    pub heartbeat_interval: Duration,
    pub rotation: Rotation,
    /// Executable override.
    pub command: Option<PathBuf>,
    pub models: TierModels,
}

impl From<&AgentConfig> for AgentSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            idle_threshold: Duration::from_secs(config.idle_threshold_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            rotation: Rotation {
                max_bytes: config.log_max_bytes,
                backups: config.log_backups,
            },
            command: config.command.clone(),
            models: config.models.clone(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

/// Bookkeeping for one `run` call, shared by all of its attempts.
struct ActiveRun {
    attempt_id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    output: String,
    stop: watch::Sender<Option<StopReason>>,
}

/// Removes a run's bookkeeping however `run` exits.
struct RunGuard<'a> {
    runs: &'a Mutex<HashMap<String, ActiveRun>>,
    id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.id);
    }
}

/// Per-attempt state while the stream is being consumed.
struct AttemptState {
    cursor: TranscriptCursor,
    log: Option<TranscriptLog>,
    plan: Option<PlanWriter>,
    result: Option<String>,
    reported_error: Option<String>,
    stderr_tail: String,
}

/// Final state of an attempt, reduced to what decides its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttemptEnd {
    pub timed_out: Option<Duration>,
    pub stop: Option<StopReason>,
    pub exit: ProcessExit,
    pub reported_error: Option<String>,
    pub stderr_tail: String,
}

/// Decide success and error for a finished attempt.
///
/// A caller-requested stop after a completion signal wins over everything,
/// then the max-runtime timeout, then any other stop.
pub(crate) fn resolve_outcome(end: &AttemptEnd) -> Option<AgentError> {
    if end.stop == Some(StopReason::Completed) {
        return None;
    }
    if let Some(limit) = end.timed_out {
        return Some(AgentError::Timeout(limit));
    }
    if let Some(reason) = end.stop {
        return Some(AgentError::Stopped(reason));
    }
    if let Some(error) = &end.exit.error {
        return Some(AgentError::Process(error.clone()));
    }
    if let Some(reported) = &end.reported_error {
        return Some(AgentError::Reported(reported.clone()));
    }
    if end.exit.code == Some(0) {
        return None;
    }
    let message = end.stderr_tail.trim();
    Some(AgentError::ExitFailure {
        code: end.exit.code,
        message: if message.is_empty() {
            "no error output".to_string()
        } else {
            message.to_string()
        },
    })
}

/// [`AgentBackend`] over an external CLI described by a [`CliProfile`].
pub struct CliBackend {
    profile: CliProfile,
    supervisor: ProcessSupervisor,
    settings: AgentSettings,
    retry: RetryPolicy,
    classifier: Arc<dyn ErrorClassifier>,
    runs: Mutex<HashMap<String, ActiveRun>>,
}

impl CliBackend {
    pub fn new(profile: CliProfile, supervisor: ProcessSupervisor, settings: AgentSettings) -> Self {
        Self {
            profile,
            supervisor,
            settings,
            retry: RetryPolicy::default(),
            classifier: Arc::new(PatternClassifier::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn profile(&self) -> &CliProfile {
        &self.profile
    }

    /// The executable that is run: the configured override, else the profile's program.
    pub fn program(&self) -> String {
        self.settings
            .command
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.profile.program.to_string())
    }

    /// Model identifier for a tier. Empty means the CLI's own default.
    pub fn model_for(&self, tier: ModelTier) -> String {
        let (configured, fallback) = match tier {
            ModelTier::Low => (&self.settings.models.low, self.profile.default_models[0]),
            ModelTier::Mid => (&self.settings.models.mid, self.profile.default_models[1]),
            ModelTier::High => (&self.settings.models.high, self.profile.default_models[2]),
        };
        if configured.is_empty() {
            fallback.to_string()
        } else {
            configured.clone()
        }
    }

    /// Full argument list for a run.
    pub fn build_args(&self, tier: ModelTier) -> Vec<String> {
        let mut args: Vec<String> = self.profile.args.iter().map(ToString::to_string).collect();
        let model = self.model_for(tier);
        if !model.is_empty() {
            args.push(self.profile.model_flag.to_string());
            args.push(model);
        }
        args
    }

    fn find_run<T>(&self, run_id: &str, f: impl FnOnce(&ActiveRun) -> T) -> Option<T> {
        let runs = self.runs.lock();
        runs.get(run_id)
            .or_else(|| runs.values().find(|r| r.attempt_id == run_id))
            .map(f)
    }

    async fn run_once(
        &self,
        base_id: &str,
        run_id: String,
        options: &RunOptions,
        stop_rx: &watch::Receiver<Option<StopReason>>,
    ) -> AgentRunResult {
        let started = Instant::now();
        if let Some(reason) = *stop_rx.borrow() {
            return AgentRunResult::failed(run_id, AgentError::Stopped(reason));
        }

        // Held until the attempt ends; the process reads it through stdin.
        let prompt_file = match write_prompt(&options.prompt).await {
            Ok(file) => file,
            Err(e) => return AgentRunResult::failed(run_id, AgentError::Io(e.to_string())),
        };

        let mut state = AttemptState {
            cursor: TranscriptCursor::new(),
            log: None,
            plan: options.plan_file.as_ref().map(PlanWriter::new),
            result: None,
            reported_error: None,
            stderr_tail: String::new(),
        };
        if let Some(path) = &options.log_file {
            match TranscriptLog::open(path, self.settings.rotation).await {
                Ok(log) => state.log = Some(log),
                Err(e) => warn!(run_id = %run_id, path = %path.display(), error = %e, "Cannot open transcript log"),
            }
        }

        let program = self.program();
        let args = self.build_args(options.tier);
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        write_entry(
            &mut state.log,
            EntryKind::Header,
            &format!(
                "── {} run {run_id} ({}) at {} ──",
                self.profile.kind,
                self.model_for(options.tier),
                Utc::now().format("%Y-%m-%d %H:%M:%S")
            ),
        )
        .await;

        {
            let mut runs = self.runs.lock();
            if let Some(entry) = runs.get_mut(base_id) {
                entry.attempt_id = run_id.clone();
                entry.pid = None;
                entry.started_at = Utc::now();
                entry.output.clear();
            }
        }

        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&timed_out);
        let mut metadata = options.metadata.clone();
        metadata.insert("backend".to_string(), self.profile.kind.name().to_string());
        metadata.insert("run_id".to_string(), run_id.clone());
        let spawn_options = SpawnOptions {
            cwd: (!options.cwd.as_os_str().is_empty()).then(|| options.cwd.clone()),
            stdin_file: Some(prompt_file.path().to_path_buf()),
            metadata,
            max_runtime: Some(timeout),
            handlers: ProcessHandlers {
                on_timeout: Some(Arc::new(move |_: &str| flag.store(true, Ordering::SeqCst))),
                on_stuck: None,
            },
            ..Default::default()
        };

        let mut handle = match self.supervisor.spawn(&run_id, &program, &args, spawn_options).await {
            Ok(handle) => handle,
            Err(e) => {
                let error = self.spawn_error(e);
                write_entry(&mut state.log, EntryKind::Error, &error.to_string()).await;
                return AgentRunResult {
                    duration: started.elapsed(),
                    ..AgentRunResult::failed(run_id, error)
                };
            }
        };

        if let Some(entry) = self.runs.lock().get_mut(base_id) {
            entry.pid = handle.pid;
        }
        info!(run_id = %run_id, pid = ?handle.pid, backend = %self.profile.kind, "Agent run started");
        options.started(&run_id, handle.pid);

        // A stop that raced the spawn.
        if stop_rx.borrow().is_some() {
            self.supervisor.stop_process(&run_id, false).await;
        }

        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                line = handle.output.recv() => {
                    let Some(line) = line else { break };
                    last_activity = Instant::now();
                    match line {
                        OutputLine::Stdout(line) => {
                            for event in parse_line(&line) {
                                self.handle_event(base_id, &mut state, event, options).await;
                            }
                        }
                        OutputLine::Stderr(line) => {
                            push_tail(&mut state.stderr_tail, &line);
                            write_entry(&mut state.log, EntryKind::Stderr, &line).await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let idle = last_activity.elapsed();
                    if idle >= self.settings.idle_threshold {
                        let note = format!("still working, no output for {}s", idle.as_secs());
                        debug!(run_id = %run_id, idle_secs = idle.as_secs(), "Agent idle");
                        options.progress(&note);
                        write_entry(&mut state.log, EntryKind::Heartbeat, &note).await;
                    }
                }
            }
        }

        let delta = state.cursor.finish();
        self.emit_delta(base_id, &mut state, delta, options).await;

        let exit = handle.wait().await;
        let end = AttemptEnd {
            timed_out: timed_out.load(Ordering::SeqCst).then_some(timeout),
            stop: *stop_rx.borrow(),
            exit,
            reported_error: state.reported_error.take(),
            stderr_tail: std::mem::take(&mut state.stderr_tail),
        };
        let error = resolve_outcome(&end);
        if let Some(error) = &error {
            write_entry(&mut state.log, EntryKind::Error, &error.to_string()).await;
        }
        drop(prompt_file);

        let output = state
            .result
            .take()
            .unwrap_or_else(|| state.cursor.text().to_string());
        debug!(run_id = %run_id, code = ?end.exit.code, success = error.is_none(), "Agent run finished");

        AgentRunResult {
            run_id,
            success: error.is_none(),
            exit_code: end.exit.code,
            output,
            error,
            duration: started.elapsed(),
        }
    }

    async fn handle_event(
        &self,
        base_id: &str,
        state: &mut AttemptState,
        event: StreamEvent,
        options: &RunOptions,
    ) {
        match event {
            StreamEvent::Thinking(text) => write_entry(&mut state.log, EntryKind::Thinking, &text).await,
            StreamEvent::AssistantText(snapshot) => {
                let delta = state.cursor.ingest(&snapshot);
                self.emit_delta(base_id, state, delta, options).await;
            }
            StreamEvent::ToolUse { name, input } => {
                let detail = summarize_input(&input);
                let line = if detail.is_empty() {
                    name
                } else {
                    format!("{name} {detail}")
                };
                options.progress(&line);
                write_entry(&mut state.log, EntryKind::Tool, &line).await;
            }
            StreamEvent::ToolResult(text) => write_entry(&mut state.log, EntryKind::ToolResult, &text).await,
            StreamEvent::Result(text) => {
                write_entry(&mut state.log, EntryKind::Result, &text).await;
                state.result = Some(text);
            }
            StreamEvent::Error(text) => {
                write_entry(&mut state.log, EntryKind::Error, &text).await;
                state.reported_error = Some(text);
            }
            StreamEvent::Info(text) => write_entry(&mut state.log, EntryKind::Info, &text).await,
        }
    }

    async fn emit_delta(
        &self,
        base_id: &str,
        state: &mut AttemptState,
        delta: TranscriptDelta,
        options: &RunOptions,
    ) {
        if delta.is_empty() {
            return;
        }
        if !delta.commentary.is_empty() {
            write_entry(&mut state.log, EntryKind::Commentary, &delta.commentary).await;
            options.output(&delta.commentary);
        }
        if !delta.plan.is_empty() {
            match &mut state.plan {
                Some(plan) => {
                    if let Err(e) = plan.write(&delta.plan).await {
                        warn!(run_id = %base_id, error = %e, "Plan file write failed");
                    }
                }
                None => write_entry(&mut state.log, EntryKind::Commentary, &delta.plan).await,
            }
            options.output(&delta.plan);
        }
        if let Some(entry) = self.runs.lock().get_mut(base_id) {
            entry.output.push_str(&delta.commentary);
            entry.output.push_str(&delta.plan);
        }
    }

    fn spawn_error(&self, error: SupervisorError) -> AgentError {
        match error {
            SupervisorError::SpawnFailed { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                AgentError::NotAvailable(format!(
                    "{} not found. {}",
                    self.program(),
                    self.profile.install_hint
                ))
            }
            SupervisorError::SpawnFailed { command, source } => {
                AgentError::SpawnFailed(format!("{command}: {source}"))
            }
            other => AgentError::Io(other.to_string()),
        }
    }

    fn resolve_program(&self) -> Option<PathBuf> {
        which::which(self.program()).ok()
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    fn kind(&self) -> BackendKind {
        self.profile.kind
    }

    async fn run(&self, options: RunOptions) -> AgentRunResult {
        let base_id = options.id.clone();
        let (stop_tx, stop_rx) = watch::channel(None);
        {
            let mut runs = self.runs.lock();
            if runs.contains_key(&base_id) {
                return AgentRunResult::failed(
                    base_id.clone(),
                    AgentError::Process(format!("run {base_id} is already active")),
                );
            }
            runs.insert(
                base_id.clone(),
                ActiveRun {
                    attempt_id: base_id.clone(),
                    pid: None,
                    started_at: Utc::now(),
                    output: String::new(),
                    stop: stop_tx,
                },
            );
        }
        let _guard = RunGuard {
            runs: &self.runs,
            id: base_id.clone(),
        };

        run_with_retry(&self.retry, self.classifier.as_ref(), &base_id, |run_id| {
            self.run_once(&base_id, run_id, &options, &stop_rx)
        })
        .await
    }

    async fn stop(&self, run_id: &str, reason: StopReason) -> bool {
        let Some(attempt_id) = self.find_run(run_id, |run| {
            run.stop.send_replace(Some(reason));
            run.attempt_id.clone()
        }) else {
            return false;
        };
        info!(run_id = %attempt_id, %reason, "Stopping agent run");
        self.supervisor.stop_process(&attempt_id, false).await;
        true
    }

    async fn is_available(&self) -> bool {
        self.resolve_program().is_some()
    }

    async fn dependency_status(&self) -> DependencyStatus {
        let path = self.resolve_program();
        let version = match &path {
            Some(path) => cli_version(path).await,
            None => None,
        };
        DependencyStatus {
            name: self.program(),
            installed: path.is_some(),
            path,
            version,
            install_hint: self.profile.install_hint.to_string(),
        }
    }

    fn running_agents(&self) -> Vec<RunningAgent> {
        let mut agents: Vec<RunningAgent> = self
            .runs
            .lock()
            .values()
            .map(|run| RunningAgent {
                run_id: run.attempt_id.clone(),
                pid: run.pid,
                started_at: run.started_at,
            })
            .collect();
        agents.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        agents
    }

    fn is_running(&self, run_id: &str) -> bool {
        self.find_run(run_id, |_| ()).is_some()
    }

    fn partial_output(&self, run_id: &str) -> Option<String> {
        self.find_run(run_id, |run| run.output.clone())
    }

    async fn install_cli(&self) -> Result<(), AgentError> {
        let Some(script) = self.profile.install_command else {
            return Err(AgentError::InstallFailed(self.profile.install_hint.to_string()));
        };
        info!(backend = %self.profile.kind, script, "Installing agent CLI");
        let output = shell_command(script)
            .output()
            .await
            .map_err(|e| AgentError::InstallFailed(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::InstallFailed(format!(
                "`{script}` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn mcp_config_path(&self) -> Option<PathBuf> {
        let relative = self.profile.mcp_config?;
        dirs::home_dir().map(|home| home.join(relative))
    }

    async fn install_mcp(&self, server: &McpServer) -> Result<(), AgentError> {
        let path = self.mcp_config_path().ok_or_else(|| {
            AgentError::Mcp(format!("{} has no MCP configuration", self.profile.kind))
        })?;
        mcp::install_server(&path, server).await?;
        info!(backend = %self.profile.kind, server = %server.name, path = %path.display(), "Installed MCP server");
        Ok(())
    }

    async fn remove_mcp(&self, name: &str) -> Result<bool, AgentError> {
        match self.mcp_config_path() {
            Some(path) => mcp::remove_server(&path, name).await,
            None => Ok(false),
        }
    }

    async fn is_mcp_configured(&self, name: &str) -> bool {
        match self.mcp_config_path() {
            Some(path) => mcp::is_configured(&path, name).await,
            None => false,
        }
    }

    async fn kill_orphan_agents(&self) -> Vec<u32> {
        match self
            .supervisor
            .kill_orphan_processes(self.profile.orphan_signature)
            .await
        {
            Ok(killed) => killed,
            Err(e) => {
                warn!(backend = %self.profile.kind, error = %e, "Orphan sweep failed");
                Vec::new()
            }
        }
    }

    async fn dispose(&self) {
        let ids: Vec<String> = self.runs.lock().keys().cloned().collect();
        for id in ids {
            self.stop(&id, StopReason::Cancelled).await;
        }
    }
}

async fn write_prompt(prompt: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix("apc-prompt-")
        .suffix(".md")
        .tempfile()?;
    tokio::fs::write(file.path(), prompt).await?;
    Ok(file)
}

/// Write a transcript entry. A failing log is reported once and dropped.
async fn write_entry(log: &mut Option<TranscriptLog>, kind: EntryKind, text: &str) {
    if let Some(writer) = log {
        if let Err(e) = writer.write(kind, text).await {
            warn!(path = %writer.path().display(), error = %e, "Transcript log write failed; disabling");
            *log = None;
        }
    }
}

fn push_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');
    let excess = tail.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    if excess > 0 {
        let cut = tail.char_indices().nth(excess).map_or(tail.len(), |(i, _)| i);
        tail.drain(..cut);
    }
}

/// One-line summary of a tool input for progress notes.
fn summarize_input(input: &serde_json::Value) -> String {
    const KEYS: [&str; 5] = ["path", "file_path", "command", "pattern", "url"];
    KEYS.iter()
        .find_map(|key| input.get(*key).and_then(serde_json::Value::as_str))
        .map(str::to_string)
        .unwrap_or_default()
}

async fn cli_version(path: &std::path::Path) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new(path).arg("--version").kill_on_drop(true).output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

#[cfg(unix)]
fn shell_command(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

#[cfg(windows)]
fn shell_command(script: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(script);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end(code: Option<i32>) -> AttemptEnd {
        AttemptEnd {
            timed_out: None,
            stop: None,
            exit: ProcessExit { code, error: None },
            reported_error: None,
            stderr_tail: String::new(),
        }
    }

    fn test_profile() -> CliProfile {
        CliProfile {
            kind: BackendKind::Cursor,
            program: "definitely-not-an-agent-cli",
            args: &["--print", "--output-format", "stream-json"],
            model_flag: "--model",
            default_models: ["", "base-model", "big-model"],
            install_command: None,
            install_hint: "Install it first.",
            orphan_signature: "definitely-not-an-agent-cli",
            mcp_config: None,
        }
    }

    #[test]
    fn test_resolve_outcome_exit_codes() {
        assert_eq!(resolve_outcome(&end(Some(0))), None);

        let mut failed = end(Some(2));
        failed.stderr_tail = "boom\n".to_string();
        assert_eq!(
            resolve_outcome(&failed),
            Some(AgentError::ExitFailure {
                code: Some(2),
                message: "boom".to_string()
            })
        );
    }

    #[test]
    fn test_resolve_outcome_completed_stop_wins() {
        let mut stopped = end(None);
        stopped.stop = Some(StopReason::Completed);
        stopped.timed_out = Some(Duration::from_millis(100));
        assert_eq!(resolve_outcome(&stopped), None);

        stopped.stop = Some(StopReason::Paused);
        assert_eq!(
            resolve_outcome(&stopped),
            Some(AgentError::Timeout(Duration::from_millis(100)))
        );

        stopped.timed_out = None;
        assert_eq!(
            resolve_outcome(&stopped),
            Some(AgentError::Stopped(StopReason::Paused))
        );
    }

    #[test]
    fn test_resolve_outcome_reported_error() {
        let mut reported = end(Some(0));
        reported.reported_error = Some("rate limit exceeded".to_string());
        assert_eq!(
            resolve_outcome(&reported),
            Some(AgentError::Reported("rate limit exceeded".to_string()))
        );

        let mut lost = end(None);
        lost.exit.error = Some("exit status lost".to_string());
        assert!(matches!(resolve_outcome(&lost), Some(AgentError::Process(_))));
    }

    #[test]
    fn test_build_args_maps_tiers() {
        let mut settings = AgentSettings::default();
        settings.models.high = "configured-model".to_string();
        let backend = CliBackend::new(test_profile(), ProcessSupervisor::default(), settings);

        assert_eq!(
            backend.build_args(ModelTier::Low),
            vec!["--print", "--output-format", "stream-json"]
        );
        assert_eq!(
            backend.build_args(ModelTier::Mid),
            vec!["--print", "--output-format", "stream-json", "--model", "base-model"]
        );
        assert_eq!(backend.model_for(ModelTier::High), "configured-model");
    }

    #[test]
    fn test_push_tail_is_bounded() {
        let mut tail = String::new();
        for _ in 0..500 {
            push_tail(&mut tail, "ééééé");
        }
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
        assert!(tail.ends_with("ééééé\n"));
    }

    #[tokio::test]
    async fn test_missing_cli_is_not_available() {
        let backend = CliBackend::new(
            test_profile(),
            ProcessSupervisor::default(),
            AgentSettings::default(),
        )
        .with_retry(RetryPolicy::none());

        assert!(!backend.is_available().await);
        let status = backend.dependency_status().await;
        assert!(!status.installed);
        assert_eq!(status.install_hint, "Install it first.");

        let result = backend
            .run(RunOptions::new("missing-1", "hello", std::env::temp_dir()))
            .await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(AgentError::NotAvailable(_))));
        assert!(!backend.is_running("missing-1"));
    }

    #[tokio::test]
    async fn test_stop_unknown_run() {
        let backend = CliBackend::new(
            test_profile(),
            ProcessSupervisor::default(),
            AgentSettings::default(),
        );
        assert!(!backend.stop("nope", StopReason::Cancelled).await);
        assert!(backend.partial_output("nope").is_none());
    }

    #[test]
    fn test_summarize_input() {
        assert_eq!(summarize_input(&serde_json::json!({"path": "src/lib.rs"})), "src/lib.rs");
        assert_eq!(summarize_input(&serde_json::json!({"other": 1})), "");
    }
}
