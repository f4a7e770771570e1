//! On-disk storage for paused-process snapshots.
//!
//! One JSON document per process id, written atomically and consumed once.

use super::error::{SupervisorError, SupervisorResult};
use apc_protocol::process_models::PausedProcessSnapshot;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Directory-backed snapshot store. A store without a directory keeps
/// nothing on disk (snapshots then live only in supervisor memory).
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    dir: Option<PathBuf>,
}

impl SnapshotStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", sanitize_id(id))))
    }

    /// Persist a snapshot, replacing any previous one for the same id.
    pub async fn save(&self, snapshot: &PausedProcessSnapshot) -> SupervisorResult<()> {
        let id = &snapshot.state.id;
        let Some(path) = self.path_for(id) else {
            return Ok(());
        };
        let persist_err = |reason: String| SupervisorError::Snapshot {
            id: id.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| persist_err(e.to_string()))?;
        }
        let json =
            serde_json::to_vec_pretty(snapshot).map_err(|e| persist_err(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| persist_err(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| persist_err(e.to_string()))?;
        Ok(())
    }

    /// Load a snapshot if one exists.
    pub async fn load(&self, id: &str) -> SupervisorResult<Option<PausedProcessSnapshot>> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SupervisorError::Snapshot {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SupervisorError::Snapshot {
                id: id.to_string(),
                reason: format!("corrupt snapshot {}: {e}", path.display()),
            })
    }

    /// Remove a snapshot. Missing files are not an error.
    pub async fn delete(&self, id: &str) -> SupervisorResult<()> {
        let Some(path) = self.path_for(id) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::Snapshot {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Map an arbitrary id onto a safe file stem.
pub(crate) fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
