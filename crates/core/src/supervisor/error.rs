//! Error types for process supervision.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the process supervisor.
///
/// Kill failures are never surfaced here: termination is best-effort and
/// only logged.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The OS refused to start the process.
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    /// The stdin redirect file could not be opened.
    #[error("Failed to open stdin file {path}: {source}")]
    StdinFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Resume was requested for an id with no stored snapshot.
    #[error("No paused snapshot for process {0}")]
    SnapshotNotFound(String),

    /// A snapshot could not be written, read or removed.
    #[error("Snapshot storage failed for process {id}: {reason}")]
    Snapshot { id: String, reason: String },

    /// The OS process table could not be listed.
    #[error("Failed to list OS processes: {0}")]
    ProcessList(std::io::Error),
}

/// Type alias for Result with SupervisorError.
pub type SupervisorResult<T> = Result<T, SupervisorError>;
