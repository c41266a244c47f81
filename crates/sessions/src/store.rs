//! Session store — groups runs belonging to the same conversation.
//!
//! Persisted as `sessions.json` under the state path. Sessions are
//! mutated only by appending runs and accumulating usage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use fm_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Run ids in submission order.
    #[serde(default)]
    pub run_ids: Vec<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON-file backed session store.
pub struct SessionStore {
    sessions_path: PathBuf,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    /// Load or create the store at `state_path/sessions/sessions.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let sessions_path = dir.join("sessions.json");
        let sessions = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Resolve or create a session. Returns `(entry, is_new)`.
    pub fn resolve_or_create(&self, session_id: Option<&str>) -> (SessionEntry, bool) {
        if let Some(id) = session_id {
            if let Some(entry) = self.sessions.read().get(id) {
                return (entry.clone(), false);
            }
        }

        let now = Utc::now();
        let id = session_id
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let entry = SessionEntry {
            session_id: id.clone(),
            created_at: now,
            updated_at: now,
            run_ids: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
        };
        self.sessions.write().insert(id, entry.clone());
        self.persist();
        (entry, true)
    }

    /// Append a run id to a session's history.
    pub fn record_run(&self, session_id: &str, run_id: &str) {
        {
            let mut sessions = self.sessions.write();
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.run_ids.push(run_id.to_owned());
                entry.updated_at = Utc::now();
            }
        }
        self.persist();
    }

    pub fn record_usage(&self, session_id: &str, input_tokens: u64, output_tokens: u64) {
        {
            let mut sessions = self.sessions.write();
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.input_tokens += input_tokens;
                entry.output_tokens += output_tokens;
                entry.total_tokens += input_tokens + output_tokens;
                entry.updated_at = Utc::now();
            }
        }
        self.persist();
    }

    pub fn list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self.sessions.read().values().cloned().collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries
    }

    fn persist(&self) {
        let sessions = self.sessions.read();
        match serde_json::to_string_pretty(&*sessions) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.sessions_path, json) {
                    tracing::warn!(error = %e, "failed to persist session store");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize session store"),
        }
    }
}
