//! Snapshot store — one JSON file per change under
//! `sessions/<sessionId>/snapshots/<changeId>.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use fm_domain::{Error, Result};

use crate::FileChange;

pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    /// `root` is the state directory; snapshots land under
    /// `<root>/sessions/...`.
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn snapshots_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id).join("snapshots")
    }

    fn snapshot_path(&self, session_id: &str, change_id: &str) -> PathBuf {
        self.snapshots_dir(session_id).join(format!("{change_id}.json"))
    }

    /// Persist a change snapshot. The `before` state must have been
    /// captured before the write it records began.
    pub fn record(&self, change: &FileChange) -> Result<()> {
        let dir = self.snapshots_dir(&change.session_id);
        std::fs::create_dir_all(&dir)?;
        let path = self.snapshot_path(&change.session_id, &change.change_id);
        let json = serde_json::to_string_pretty(change)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// All snapshots of one session, ordered by timestamp ascending.
    pub fn session_changes(&self, session_id: &str) -> Result<Vec<FileChange>> {
        let dir = self.snapshots_dir(session_id);
        let mut changes = Vec::new();
        if !dir.exists() {
            return Ok(changes);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(entry.path())
                .map_err(Error::from)
                .and_then(|raw| serde_json::from_str::<FileChange>(&raw).map_err(Error::from))
            {
                Ok(change) => changes.push(change),
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "skipping malformed snapshot");
                }
            }
        }
        changes.sort_by_key(|c| c.timestamp);
        Ok(changes)
    }

    /// All snapshots across all sessions, ordered by timestamp ascending.
    pub fn all_changes(&self) -> Result<Vec<FileChange>> {
        let mut changes = Vec::new();
        let sessions = self.sessions_dir();
        if !sessions.exists() {
            return Ok(changes);
        }
        for entry in std::fs::read_dir(&sessions)? {
            let entry = entry?;
            if entry.path().is_dir() {
                let session_id = entry.file_name().to_string_lossy().to_string();
                changes.extend(self.session_changes(&session_id)?);
            }
        }
        changes.sort_by_key(|c| c.timestamp);
        Ok(changes)
    }

    /// Find a single change by id, across sessions.
    pub fn find(&self, change_id: &str) -> Result<FileChange> {
        self.all_changes()?
            .into_iter()
            .find(|c| c.change_id == change_id)
            .ok_or_else(|| Error::Other(format!("no snapshot with change id {change_id}")))
    }

    pub fn by_file(&self, file_path: &str) -> Result<Vec<FileChange>> {
        Ok(self
            .all_changes()?
            .into_iter()
            .filter(|c| c.file_path == file_path)
            .collect())
    }

    pub fn by_agent(&self, agent_id: &str) -> Result<Vec<FileChange>> {
        Ok(self
            .all_changes()?
            .into_iter()
            .filter(|c| c.agent_id == agent_id)
            .collect())
    }

    /// Snapshots taken at or after `cutoff`. Inclusive: rolling back
    /// "after" a snapshot's own timestamp undoes that snapshot too.
    pub fn after(&self, cutoff: DateTime<Utc>) -> Result<Vec<FileChange>> {
        Ok(self
            .all_changes()?
            .into_iter()
            .filter(|c| c.timestamp >= cutoff)
            .collect())
    }
}
