//! Per-run transcript log.
//!
//! An append-only, ANSI-colored record of what an agent did. It is meant for
//! humans tailing the file and is never parsed back. When the file grows past
//! a size threshold it is rotated into numbered backups (`run.log.1` is the
//! newest).

use colored::Colorize;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Kinds of transcript entries, each with its own styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Header,
    Thinking,
    Commentary,
    Tool,
    ToolResult,
    Result,
    Error,
    Info,
    Stderr,
    Heartbeat,
}

/// Size-based rotation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    /// Rotate when a write would grow the file past this size. 0 disables rotation.
    pub max_bytes: u64,
    /// Number of numbered backups kept.
    pub backups: usize,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            backups: 3,
        }
    }
}

/// Append-only transcript writer. Owned by exactly one run.
#[derive(Debug)]
pub struct TranscriptLog {
    path: PathBuf,
    rotation: Rotation,
    file: File,
    written: u64,
}

impl TranscriptLog {
    pub async fn open(path: impl Into<PathBuf>, rotation: Rotation) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = open_append(&path).await?;
        let written = file.metadata().await?.len();
        Ok(Self {
            path,
            rotation,
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one styled entry.
    pub async fn write(&mut self, kind: EntryKind, text: &str) -> std::io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let rendered = render(kind, text);
        let len = rendered.len() as u64;
        if self.rotation.max_bytes > 0
            && self.written > 0
            && self.written + len > self.rotation.max_bytes
        {
            self.rotate().await?;
        }
        self.file.write_all(rendered.as_bytes()).await?;
        self.file.flush().await?;
        self.written += len;
        Ok(())
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        if self.rotation.backups == 0 {
            fs::remove_file(&self.path).await?;
        } else {
            let oldest = backup_path(&self.path, self.rotation.backups);
            if fs::try_exists(&oldest).await? {
                fs::remove_file(&oldest).await?;
            }
            for n in (1..self.rotation.backups).rev() {
                let from = backup_path(&self.path, n);
                if fs::try_exists(&from).await? {
                    fs::rename(&from, backup_path(&self.path, n + 1)).await?;
                }
            }
            fs::rename(&self.path, backup_path(&self.path, 1)).await?;
        }
        self.file = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

/// `run.log` -> `run.log.N`
pub fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn render(kind: EntryKind, text: &str) -> String {
    match kind {
        EntryKind::Header => format!("{}\n", text.bold().blue()),
        EntryKind::Thinking => format!("{}\n", text.dimmed().italic()),
        // Commentary arrives as raw deltas of a larger message.
        EntryKind::Commentary => text.to_string(),
        EntryKind::Tool => format!("\n{} {}\n", "▶".cyan(), text.cyan()),
        EntryKind::ToolResult => format!("{}\n", truncate(text, 500).dimmed()),
        EntryKind::Result => format!("\n{}\n{}\n", "── result ──".green().bold(), text),
        EntryKind::Error => format!("\n{} {}\n", "✖".red().bold(), text.red()),
        EntryKind::Info => format!("{text}\n"),
        EntryKind::Stderr => format!("{}\n", text.yellow()),
        EntryKind::Heartbeat => format!("{}\n", text.dimmed().yellow()),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

/// Next free session log for an agent: `<dir>/<agent>_session_<NNNN>.log`.
pub async fn next_session_log(dir: &Path, agent: &str) -> std::io::Result<PathBuf> {
    let pattern = format!(r"^{}_session_(\d+)\.log$", regex::escape(agent));
    let re = Regex::new(&pattern).map_err(|e| std::io::Error::other(e.to_string()))?;

    let mut highest = 0u32;
    match fs::read_dir(dir).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(n) = re
                    .captures(name)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                {
                    highest = highest.max(n);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(dir.join(format!("{agent}_session_{:04}.log", highest + 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs/run.log");

        let mut log = TranscriptLog::open(&path, Rotation::default()).await.unwrap();
        log.write(EntryKind::Commentary, "hello ").await.unwrap();
        log.write(EntryKind::Commentary, "world").await.unwrap();
        log.write(EntryKind::Info, "").await.unwrap();
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "hello world");

        // Reopening appends.
        let mut log = TranscriptLog::open(&path, Rotation::default()).await.unwrap();
        log.write(EntryKind::Commentary, "!").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world!");
    }

    #[tokio::test]
    async fn test_rotation_keeps_numbered_backups() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.log");
        let rotation = Rotation {
            max_bytes: 10,
            backups: 2,
        };

        let mut log = TranscriptLog::open(&path, rotation).await.unwrap();
        for chunk in ["aaaaaaaa", "bbbbbbbb", "cccccccc", "dddddddd"] {
            log.write(EntryKind::Commentary, chunk).await.unwrap();
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "dddddddd");
        assert_eq!(std::fs::read_to_string(backup_path(&path, 1)).unwrap(), "cccccccc");
        assert_eq!(std::fs::read_to_string(backup_path(&path, 2)).unwrap(), "bbbbbbbb");
        assert!(!backup_path(&path, 3).exists());
    }

    #[tokio::test]
    async fn test_next_session_log_numbering() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        let first = next_session_log(dir, "Alex").await.unwrap();
        assert_eq!(first, dir.join("Alex_session_0001.log"));

        std::fs::write(dir.join("Alex_session_0001.log"), "").unwrap();
        std::fs::write(dir.join("Alex_session_0007.log"), "").unwrap();
        std::fs::write(dir.join("Betty_session_0042.log"), "").unwrap();

        let next = next_session_log(dir, "Alex").await.unwrap();
        assert_eq!(next, dir.join("Alex_session_0008.log"));

        let missing = next_session_log(&dir.join("nope"), "Cleo").await.unwrap();
        assert!(missing.ends_with("Cleo_session_0001.log"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé…");
    }
}
