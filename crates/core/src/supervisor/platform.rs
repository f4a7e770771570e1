//! Platform abstraction for process-group spawning and termination.
//!
//! Orchestration code never branches on the target OS. A [`ProcessPlatform`]
//! is chosen once (usually via [`native`]) and handed to the supervisor.

use apc_protocol::process_models::OsProcess;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;

/// How hard to terminate a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Ask the group to exit (SIGTERM / `taskkill /T`).
    Graceful,
    /// Kill the group immediately (SIGKILL / `taskkill /T /F`).
    Force,
}

/// OS-specific process-group operations.
#[async_trait]
pub trait ProcessPlatform: Send + Sync {
    /// Configure a command so the spawned process leads its own group.
    fn start_group(&self, command: &mut Command);

    /// Signal the whole group (or tree) rooted at `pid`.
    async fn terminate_group(&self, pid: u32, mode: TerminateMode) -> std::io::Result<()>;

    /// Snapshot of every process visible to the OS.
    async fn list_processes(&self) -> std::io::Result<Vec<OsProcess>>;
}

/// The platform implementation for the current target.
pub fn native() -> Arc<dyn ProcessPlatform> {
    #[cfg(windows)]
    {
        Arc::new(WindowsPlatform)
    }
    #[cfg(not(windows))]
    {
        Arc::new(UnixPlatform)
    }
}

/// POSIX process groups.
///
/// Children are started with `setpgid(0, 0)` so the agent CLI and any
/// grandchildren spawned by shell wrappers share one group. Termination
/// signals the negative pid, falling back to the single pid when the
/// group no longer exists.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixPlatform;

#[cfg(unix)]
#[async_trait]
impl ProcessPlatform for UnixPlatform {
    fn start_group(&self, command: &mut Command) {
        command.process_group(0);
    }

    async fn terminate_group(&self, pid: u32, mode: TerminateMode) -> std::io::Result<()> {
        let signal = match mode {
            TerminateMode::Graceful => libc::SIGTERM,
            TerminateMode::Force => libc::SIGKILL,
        };
        let pid = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;

        // SAFETY: kill(2) has no memory-safety preconditions.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(-pid, signal) };
        if ret == 0 {
            return Ok(());
        }

        let group_err = std::io::Error::last_os_error();
        if group_err.raw_os_error() != Some(libc::ESRCH) {
            return Err(group_err);
        }

        // No such group: the child may have been adopted without one.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, signal) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone.
            return Ok(());
        }
        Err(err)
    }

    async fn list_processes(&self) -> std::io::Result<Vec<OsProcess>> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,pgid=,args="])
            .output()
            .await?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "ps exited with {}",
                output.status
            )));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Windows process trees.
///
/// Children are created with `CREATE_NEW_PROCESS_GROUP`; termination uses
/// `taskkill /T`, which walks the parent/child tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsPlatform;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[async_trait]
impl ProcessPlatform for WindowsPlatform {
    fn start_group(&self, _command: &mut Command) {
        #[cfg(windows)]
        _command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    async fn terminate_group(&self, pid: u32, mode: TerminateMode) -> std::io::Result<()> {
        let pid = pid.to_string();
        let mut args = vec!["/PID", pid.as_str(), "/T"];
        if mode == TerminateMode::Force {
            args.push("/F");
        }
        let output = Command::new("taskkill").args(&args).output().await?;
        if output.status.success() {
            return Ok(());
        }
        // taskkill exits 128 when the process is already gone.
        if output.status.code() == Some(128) {
            return Ok(());
        }
        Err(std::io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    async fn list_processes(&self) -> std::io::Result<Vec<OsProcess>> {
        let output = Command::new("wmic")
            .args([
                "process",
                "get",
                "ProcessId,ParentProcessId,CommandLine",
                "/format:csv",
            ])
            .output()
            .await?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "wmic exited with {}",
                output.status
            )));
        }
        Ok(parse_wmic_csv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `ps -eo pid=,pgid=,args=` output.
pub fn parse_ps_output(text: &str) -> Vec<OsProcess> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse::<u32>().ok()?;
            let group_id = parts.next()?.parse::<u32>().ok();
            let command_line = parts.collect::<Vec<_>>().join(" ");
            if command_line.is_empty() {
                return None;
            }
            Some(OsProcess {
                pid,
                group_id,
                command_line,
            })
        })
        .collect()
}

/// Parse `wmic ... /format:csv` output.
///
/// Columns are `Node,CommandLine,ParentProcessId,ProcessId`; the command line
/// itself may contain commas, so the numeric columns are taken from the end.
pub fn parse_wmic_csv(text: &str) -> Vec<OsProcess> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Node,"))
        .filter_map(|line| {
            let mut fields = line.rsplitn(3, ',');
            let pid = fields.next()?.trim().parse::<u32>().ok()?;
            let parent = fields.next()?.trim().parse::<u32>().ok();
            let rest = fields.next()?;
            let command_line = rest.split_once(',').map_or("", |(_, cmd)| cmd).trim();
            if command_line.is_empty() {
                return None;
            }
            Some(OsProcess {
                pid,
                group_id: parent,
                command_line: command_line.to_string(),
            })
        })
        .collect()
}
