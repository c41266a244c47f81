//! File history — per-session snapshots of filesystem changes and
//! rollback by change, file, agent, session, or time.
//!
//! Every mutation a worker tool performs is snapshotted as a JSON file
//! under `sessions/<sessionId>/snapshots/<changeId>.json`, capturing the
//! `before` and `after` states. `before` is absent iff the file was
//! newly created.

pub mod retention;
pub mod rollback;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content snapshot of one side of a change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub content: String,
    pub hash: String,
    pub size: u64,
}

impl FileState {
    pub fn of(content: impl Into<String>) -> Self {
        let content = content.into();
        let hash = hex::encode(Sha256::digest(content.as_bytes()));
        let size = content.len() as u64;
        Self { content, hash, size }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Write,
    Patch,
    Delete,
}

/// One recorded filesystem change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub change_id: String,
    pub session_id: String,
    pub agent_id: String,
    /// Path relative to the workspace root.
    pub file_path: String,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<FileState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<FileState>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl FileChange {
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        file_path: impl Into<String>,
        operation: Operation,
        before: Option<FileState>,
        after: Option<FileState>,
    ) -> Self {
        Self {
            change_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            file_path: file_path.into(),
            operation,
            timestamp: Utc::now(),
            before,
            after,
            metadata: serde_json::Value::Null,
        }
    }
}

pub use retention::RetentionPolicy;
pub use rollback::{RestoreAction, RollbackPlan, RollbackTarget};
pub use store::HistoryStore;
