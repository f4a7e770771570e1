//! Process supervisor: owns the lifecycle of every spawned or adopted OS process.
//!
//! The `ProcessSupervisor` is responsible for:
//! - Spawning processes in their own process group (last writer wins per id)
//! - Draining stdout/stderr and keeping a trailing output sample
//! - A max-runtime timer and a periodic health check per process
//! - Graceful-then-forced termination of whole process groups
//! - Pause snapshots and resumption from them
//! - Sweeping orphaned agent processes left by a previous daemon

use super::error::{SupervisorError, SupervisorResult};
use super::platform::{self, ProcessPlatform, TerminateMode};
use super::snapshot::SnapshotStore;
use apc_protocol::config_models::SupervisorConfig;
use apc_protocol::process_models::{OsProcess, PausedProcessSnapshot, ProcessState, ProcessStatus};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long output readers may keep draining after the process exits.
///
/// A grandchild that inherited the pipes can keep them open indefinitely.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Called when a process exceeds its max runtime, before it is force-stopped.
pub type TimeoutHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Called by the health check when a process has been silent too long.
pub type StuckHandler = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Optional per-process callbacks.
#[derive(Clone, Default)]
pub struct ProcessHandlers {
    pub on_timeout: Option<TimeoutHandler>,
    pub on_stuck: Option<StuckHandler>,
}

impl std::fmt::Debug for ProcessHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandlers")
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_stuck", &self.on_stuck.is_some())
            .finish()
    }
}

/// Options for [`ProcessSupervisor::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Working directory. Defaults to the daemon's current directory.
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// File redirected to stdin. Stdin is null otherwise.
    pub stdin_file: Option<PathBuf>,
    pub metadata: HashMap<String, String>,
    /// Force-stop the process after this long.
    pub max_runtime: Option<Duration>,
    /// Override for the health-check period.
    pub health_check_interval: Option<Duration>,
    pub handlers: ProcessHandlers,
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessExit {
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    /// Set when the exit status could not be observed.
    pub error: Option<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.error.is_none()
    }

    fn lost() -> Self {
        Self {
            code: None,
            error: Some("exit status lost".to_string()),
        }
    }
}

/// Caller's view of a supervised process: its output lines and its exit.
///
/// Output lines are all delivered before the exit is published.
#[derive(Debug)]
pub struct ProcessHandle {
    pub id: String,
    pub pid: Option<u32>,
    pub output: mpsc::UnboundedReceiver<OutputLine>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> ProcessExit {
        wait_exit(&mut self.exit).await
    }

    /// An independent receiver for the exit notification.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    match rx.wait_for(Option::is_some).await {
        Ok(exit) => (*exit).clone().unwrap_or_else(ProcessExit::lost),
        Err(_) => ProcessExit::lost(),
    }
}

/// Supervisor timings in their runtime form.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub stuck_threshold: Duration,
    pub health_check_interval: Duration,
    pub grace_period: Duration,
    pub kill_wait: Duration,
    pub output_tail_bytes: usize,
    /// Where paused-process snapshots are written. Memory only when `None`.
    pub snapshot_dir: Option<PathBuf>,
}

impl SupervisorSettings {
    pub fn from_config(config: &SupervisorConfig, snapshot_dir: Option<PathBuf>) -> Self {
        Self {
            stuck_threshold: Duration::from_secs(config.stuck_threshold_secs),
            health_check_interval: Duration::from_secs(config.health_check_interval_secs.max(1)),
            grace_period: Duration::from_millis(config.grace_period_ms),
            kill_wait: Duration::from_millis(config.kill_wait_ms),
            output_tail_bytes: config.output_tail_bytes,
            snapshot_dir,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default(), None)
    }
}

/// Bounded trailing sample of a process's output.
#[derive(Debug, Default)]
struct OutputTail {
    buf: String,
    cap: usize,
}

impl OutputTail {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }
}

struct TrackedProcess {
    state: ProcessState,
    generation: u64,
    max_runtime: Option<Duration>,
    health_check_interval: Option<Duration>,
    tail: OutputTail,
    exit: watch::Receiver<Option<ProcessExit>>,
    timers: Vec<JoinHandle<()>>,
}

impl TrackedProcess {
    fn abort_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

struct Inner {
    settings: SupervisorSettings,
    platform: Arc<dyn ProcessPlatform>,
    snapshots: SnapshotStore,
    processes: Mutex<HashMap<String, TrackedProcess>>,
    paused: Mutex<HashMap<String, PausedProcessSnapshot>>,
    next_generation: AtomicU64,
}

impl Inner {
    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.processes
            .lock()
            .get(id)
            .is_some_and(|p| p.generation == generation)
    }

    fn record_output(&self, id: &str, generation: u64, line: &str) {
        let mut processes = self.processes.lock();
        if let Some(process) = processes.get_mut(id) {
            if process.generation == generation {
                process.state.last_output = Utc::now();
                process.tail.push_line(line);
            }
        }
    }

    fn remove_if_current(&self, id: &str, generation: u64) -> Option<TrackedProcess> {
        let mut processes = self.processes.lock();
        if processes.get(id).is_some_and(|p| p.generation == generation) {
            let mut process = processes.remove(id)?;
            process.abort_timers();
            return Some(process);
        }
        None
    }
}

/// Tracks and controls supervised OS processes.
///
/// Cheap to clone; clones share the same process table.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorSettings::default())
    }
}

impl ProcessSupervisor {
    /// Create a supervisor for the current platform.
    pub fn new(settings: SupervisorSettings) -> Self {
        Self::with_platform(settings, platform::native())
    }

    /// Create a supervisor with an explicit platform implementation.
    pub fn with_platform(settings: SupervisorSettings, platform: Arc<dyn ProcessPlatform>) -> Self {
        let snapshots = SnapshotStore::new(settings.snapshot_dir.clone());
        Self {
            inner: Arc::new(Inner {
                settings,
                platform,
                snapshots,
                processes: Mutex::new(HashMap::new()),
                paused: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Start a process in its own process group and track it under `id`.
    ///
    /// An already tracked process with the same id is stopped first.
    pub async fn spawn(
        &self,
        id: &str,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> SupervisorResult<ProcessHandle> {
        if self.is_running(id) {
            debug!(process_id = %id, "Replacing tracked process");
            self.stop_process(id, true).await;
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(&options.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        match &options.stdin_file {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|source| SupervisorError::StdinFile {
                    path: path.clone(),
                    source,
                })?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        self.inner.platform.start_group(&mut cmd);

        let child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            command: command.to_string(),
            source,
        })?;
        info!(process_id = %id, pid = ?child.id(), command, "Spawned process");

        Ok(self.track(id, child, command, args, options))
    }

    /// Adopt a process started elsewhere, e.g. through a shell wrapper.
    ///
    /// Tracking is identical to [`spawn`](Self::spawn). The child's stdout
    /// and stderr should be piped for output to be observed.
    pub async fn register_external_process(
        &self,
        id: &str,
        child: Child,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> ProcessHandle {
        if self.is_running(id) {
            self.stop_process(id, true).await;
        }
        info!(process_id = %id, pid = ?child.id(), command, "Adopted external process");
        self.track(id, child, command, args, options)
    }

    fn track(
        &self,
        id: &str,
        mut child: Child,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> ProcessHandle {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let now = Utc::now();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let state = ProcessState {
            id: id.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            cwd: options
                .cwd
                .clone()
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_default(),
            env: options.env.clone(),
            stdin_file: options.stdin_file.clone(),
            pid,
            status: ProcessStatus::Running,
            start_time: now,
            last_output: now,
            metadata: options.metadata.clone(),
        };

        self.inner.processes.lock().insert(
            id.to_string(),
            TrackedProcess {
                state,
                generation,
                max_runtime: options.max_runtime,
                health_check_interval: options.health_check_interval,
                tail: OutputTail::new(self.inner.settings.output_tail_bytes),
                exit: exit_rx.clone(),
                timers: Vec::new(),
            },
        );

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(id, generation, stdout, out_tx.clone(), OutputLine::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(id, generation, stderr, out_tx, OutputLine::Stderr));
        }

        let mut timers = Vec::new();
        if let Some(max_runtime) = options.max_runtime {
            timers.push(self.spawn_runtime_timer(id, generation, max_runtime, options.handlers.on_timeout.clone()));
        }
        let interval = options
            .health_check_interval
            .unwrap_or(self.inner.settings.health_check_interval);
        timers.push(self.spawn_health_check(id, generation, interval, options.handlers.on_stuck));

        {
            let mut processes = self.inner.processes.lock();
            match processes.get_mut(id) {
                Some(process) if process.generation == generation => process.timers = timers,
                // Already exited; the timers notice and stop on their own.
                _ => timers.iter().for_each(JoinHandle::abort),
            }
        }

        let inner = Arc::clone(&self.inner);
        let waiter_id = id.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;

            let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
            if tokio::time::timeout(READER_DRAIN, futures::future::join_all(readers))
                .await
                .is_err()
            {
                debug!(process_id = %waiter_id, "Output still open after exit; closing readers");
                aborts.iter().for_each(tokio::task::AbortHandle::abort);
            }

            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    error: None,
                },
                Err(e) => ProcessExit {
                    code: None,
                    error: Some(e.to_string()),
                },
            };
            if inner.remove_if_current(&waiter_id, generation).is_some() {
                debug!(process_id = %waiter_id, code = ?exit.code, "Process exited");
            }
            let _ = exit_tx.send(Some(exit));
        });

        ProcessHandle {
            id: id.to_string(),
            pid,
            output: out_rx,
            exit: exit_rx,
        }
    }

    fn spawn_reader<R>(
        &self,
        id: &str,
        generation: u64,
        stream: R,
        tx: mpsc::UnboundedSender<OutputLine>,
        wrap: fn(String) -> OutputLine,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']);
                        inner.record_output(&id, generation, line);
                        let _ = tx.send(wrap(line.to_string()));
                    }
                    Err(e) => {
                        debug!(process_id = %id, error = %e, "Output read failed");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_runtime_timer(
        &self,
        id: &str,
        generation: u64,
        max_runtime: Duration,
        on_timeout: Option<TimeoutHandler>,
    ) -> JoinHandle<()> {
        let supervisor = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(max_runtime).await;
            if !supervisor.inner.is_current(&id, generation) {
                return;
            }
            warn!(process_id = %id, ?max_runtime, "Process exceeded max runtime");
            if let Some(handler) = on_timeout {
                handler(&id);
            }
            supervisor.stop_generation(&id, generation, true).await;
        })
    }

    fn spawn_health_check(
        &self,
        id: &str,
        generation: u64,
        period: Duration,
        on_stuck: Option<StuckHandler>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let last_output = {
                    let processes = inner.processes.lock();
                    match processes.get(&id) {
                        Some(p) if p.generation == generation => p.state.last_output,
                        _ => break,
                    }
                };
                let silent = (Utc::now() - last_output).to_std().unwrap_or_default();
                if silent > inner.settings.stuck_threshold {
                    warn!(process_id = %id, silent_secs = silent.as_secs(), "Process appears stuck");
                    if let Some(handler) = &on_stuck {
                        handler(&id, silent);
                    }
                }
            }
        })
    }

    /// Stop a process. Idempotent, and always `true`: the id is untracked
    /// once this returns, whether or not it was tracked before.
    ///
    /// The graceful path terminates the group, waits the grace period, then
    /// escalates to a hard kill. `force` skips straight to the hard kill. A
    /// process whose exit is not observed after the kill is logged and
    /// dropped from the table.
    pub async fn stop_process(&self, id: &str, force: bool) -> bool {
        let generation = self.inner.processes.lock().get(id).map(|p| p.generation);
        match generation {
            Some(generation) => self.stop_generation(id, generation, force).await,
            None => true,
        }
    }

    async fn stop_generation(&self, id: &str, generation: u64, force: bool) -> bool {
        let target = {
            let mut processes = self.inner.processes.lock();
            match processes.get_mut(id) {
                Some(p) if p.generation == generation => {
                    p.state.status = ProcessStatus::Stopped;
                    Some((p.state.pid, p.exit.clone()))
                }
                _ => None,
            }
        };
        let Some((pid, mut exit)) = target else {
            return true;
        };

        let mut exited = exit.borrow().is_some();
        if let (Some(pid), false) = (pid, exited) {
            if !force {
                self.terminate(id, pid, TerminateMode::Graceful).await;
                exited = wait_exit_for(&mut exit, self.inner.settings.grace_period).await;
                if !exited {
                    warn!(process_id = %id, pid, "Grace period elapsed, escalating to kill");
                }
            }
            if !exited {
                self.terminate(id, pid, TerminateMode::Force).await;
                exited = wait_exit_for(&mut exit, self.inner.settings.kill_wait).await;
            }
            if !exited {
                warn!(process_id = %id, pid, "Exit not observed after kill");
            }
        }

        self.inner.remove_if_current(id, generation);
        info!(process_id = %id, force, "Stopped process");
        true
    }

    async fn terminate(&self, id: &str, pid: u32, mode: TerminateMode) {
        if let Err(e) = self.inner.platform.terminate_group(pid, mode).await {
            warn!(process_id = %id, pid, ?mode, error = %e, "Failed to signal process group");
        }
    }

    /// Snapshot a process, persist the snapshot, then stop it gracefully.
    ///
    /// Returns `Ok(false)` when `id` is not tracked.
    pub async fn pause_process(&self, id: &str) -> SupervisorResult<bool> {
        let snapshot = {
            let processes = self.inner.processes.lock();
            let Some(process) = processes.get(id) else {
                return Ok(false);
            };
            PausedProcessSnapshot {
                state: ProcessState {
                    status: ProcessStatus::Paused,
                    ..process.state.clone()
                },
                output_tail: process.tail.buf.clone(),
                paused_at: Utc::now(),
                max_runtime_ms: process.max_runtime.map(duration_ms),
                health_check_interval_ms: process.health_check_interval.map(duration_ms),
            }
        };

        self.inner.snapshots.save(&snapshot).await?;
        self.inner.paused.lock().insert(id.to_string(), snapshot);
        self.stop_process(id, false).await;
        info!(process_id = %id, "Paused process");
        Ok(true)
    }

    /// Re-spawn a paused process from its snapshot, consuming the snapshot.
    pub async fn resume_process(
        &self,
        id: &str,
        handlers: ProcessHandlers,
    ) -> SupervisorResult<ProcessHandle> {
        let in_memory = self.inner.paused.lock().remove(id);
        let snapshot = match in_memory {
            Some(snapshot) => snapshot,
            None => self
                .inner
                .snapshots
                .load(id)
                .await?
                .ok_or_else(|| SupervisorError::SnapshotNotFound(id.to_string()))?,
        };
        self.inner.snapshots.delete(id).await?;

        let state = snapshot.state;
        info!(process_id = %id, command = %state.command, "Resuming process");
        let options = SpawnOptions {
            cwd: Some(state.cwd),
            env: state.env,
            stdin_file: state.stdin_file,
            metadata: state.metadata,
            max_runtime: snapshot.max_runtime_ms.map(Duration::from_millis),
            health_check_interval: snapshot.health_check_interval_ms.map(Duration::from_millis),
            handlers,
        };
        self.spawn(id, &state.command, &state.args, options).await
    }

    /// Ids that currently have a paused snapshot in memory.
    pub fn paused_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.paused.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Force-stop every process silent for longer than the stuck threshold.
    pub async fn kill_stuck_processes(&self) -> Vec<String> {
        let now = Utc::now();
        let threshold = self.inner.settings.stuck_threshold;
        let stuck: Vec<String> = self
            .inner
            .processes
            .lock()
            .values()
            .filter(|p| p.state.status == ProcessStatus::Running)
            .filter(|p| (now - p.state.last_output).to_std().unwrap_or_default() > threshold)
            .map(|p| p.state.id.clone())
            .collect();

        for id in &stuck {
            warn!(process_id = %id, "Killing stuck process");
            self.stop_process(id, true).await;
        }
        stuck
    }

    /// Force-kill OS processes whose command line contains `signature` and
    /// that are neither tracked here nor this daemon itself.
    pub async fn kill_orphan_processes(&self, signature: &str) -> SupervisorResult<Vec<u32>> {
        let listed = self
            .inner
            .platform
            .list_processes()
            .await
            .map_err(SupervisorError::ProcessList)?;
        let tracked: HashSet<u32> = self
            .inner
            .processes
            .lock()
            .values()
            .filter_map(|p| p.state.pid)
            .collect();

        let orphans = select_orphans(&listed, signature, std::process::id(), &tracked);
        for pid in &orphans {
            warn!(pid, signature, "Killing orphaned process");
            if let Err(e) = self
                .inner
                .platform
                .terminate_group(*pid, TerminateMode::Force)
                .await
            {
                warn!(pid, error = %e, "Failed to kill orphaned process");
            }
        }
        Ok(orphans)
    }

    /// Ids of all tracked processes, sorted.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.processes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner.processes.lock().contains_key(id)
    }

    pub fn get_process(&self, id: &str) -> Option<ProcessState> {
        self.inner.processes.lock().get(id).map(|p| p.state.clone())
    }

    /// Trailing output of a tracked process.
    pub fn output_tail(&self, id: &str) -> Option<String> {
        self.inner.processes.lock().get(id).map(|p| p.tail.buf.clone())
    }

    /// Gracefully stop every tracked process, concurrently.
    pub async fn stop_all(&self) {
        let ids = self.running_ids();
        futures::future::join_all(ids.iter().map(|id| self.stop_process(id, false))).await;
    }
}

async fn wait_exit_for(rx: &mut watch::Receiver<Option<ProcessExit>>, window: Duration) -> bool {
    tokio::time::timeout(window, wait_exit(rx)).await.is_ok()
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Pids from `listed` that look like orphaned agent processes.
///
/// Excludes this daemon's pid, tracked pids, and processes whose group (or
/// parent, on Windows) is a tracked pid.
pub fn select_orphans(
    listed: &[OsProcess],
    signature: &str,
    own_pid: u32,
    tracked: &HashSet<u32>,
) -> Vec<u32> {
    listed
        .iter()
        .filter(|p| p.command_line.contains(signature))
        .filter(|p| p.pid != own_pid && !tracked.contains(&p.pid))
        .filter(|p| p.group_id.map_or(true, |g| g != own_pid && !tracked.contains(&g)))
        .map(|p| p.pid)
        .collect()
}
