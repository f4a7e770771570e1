//! Supervised process state models.
//!
//! This module defines the structures the process supervisor keeps for every
//! spawned or adopted OS process, and the snapshot persisted when a process
//! is paused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use ts_rs::TS;

/// Lifecycle status of a supervised OS process.
///
/// A tracked process is normally `Running` until it exits (`Completed` or
/// `Error`) or is stopped on request (`Stopped`). `Paused` only appears in
/// persisted snapshots, since a paused process has already been killed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Process is alive and tracked.
    Running,

    /// Process state was captured and the process killed for later resumption.
    Paused,

    /// Process was stopped on request.
    Stopped,

    /// Process exited with code 0.
    Completed,

    /// Process exited abnormally or could not be waited on.
    Error,
}

impl ProcessStatus {
    /// Whether the process can no longer produce output.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Runtime state of one supervised process.
///
/// Owned exclusively by the supervisor; consumers receive clones.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ProcessState {
    /// Caller-chosen identifier. At most one tracked process per id.
    pub id: String,

    /// Program that was executed.
    pub command: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Working directory of the process.
    pub cwd: PathBuf,

    /// Extra environment variables set for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// File redirected to the process stdin, if any.
    #[serde(default)]
    pub stdin_file: Option<PathBuf>,

    /// OS process id, when known.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Current lifecycle status.
    pub status: ProcessStatus,

    /// When the process was started or adopted.
    pub start_time: DateTime<Utc>,

    /// When the process last wrote to stdout or stderr.
    pub last_output: DateTime<Utc>,

    /// Free-form metadata carried across pause/resume.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A paused process: its state plus the trailing output it produced.
///
/// Persisted when a process is paused and consumed exactly once on resume.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct PausedProcessSnapshot {
    /// Process state at pause time, with `status` set to `Paused`.
    pub state: ProcessState,

    /// Trailing sample of the process output.
    pub output_tail: String,

    /// When the snapshot was taken.
    pub paused_at: DateTime<Utc>,

    /// Runtime budget the process was started with, in milliseconds.
    #[serde(default)]
    pub max_runtime_ms: Option<u64>,

    /// Health check interval the process was started with, in milliseconds.
    #[serde(default)]
    pub health_check_interval_ms: Option<u64>,
}

/// A process visible to the operating system, as seen by an orphan sweep.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct OsProcess {
    /// OS process id.
    pub pid: u32,

    /// Process group (POSIX) or parent process (Windows), when known.
    #[serde(default)]
    pub group_id: Option<u32>,

    /// Full command line.
    pub command_line: String,
}
