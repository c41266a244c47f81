//! Rollback — restore files to earlier states from snapshots.
//!
//! Restore rules per target:
//! - change id: that change's `before`; no `before` ⇒ delete the file.
//! - file path: `before` of the **earliest** snapshot for the path
//!   (the pre-session state).
//! - agent / session / after-timestamp (inclusive): group matching
//!   snapshots by file, then apply the earliest-per-file rule within
//!   the group.
//!
//! A dry run produces the plan without touching disk. Application is
//! all-or-nothing per file (temp file + rename). Rolling back an
//! already-rolled-back tree is a no-op.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use fm_domain::{Error, Result};

use crate::store::HistoryStore;
use crate::{FileChange, FileState};

#[derive(Debug, Clone)]
pub enum RollbackTarget {
    Change(String),
    File(String),
    Agent(String),
    Session(String),
    After(DateTime<Utc>),
}

/// What to do with one file.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RestoreAction {
    Restore {
        file_path: String,
        content: String,
        hash: String,
        source_change_id: String,
    },
    Delete {
        file_path: String,
        source_change_id: String,
    },
}

impl RestoreAction {
    pub fn file_path(&self) -> &str {
        match self {
            RestoreAction::Restore { file_path, .. } | RestoreAction::Delete { file_path, .. } => {
                file_path
            }
        }
    }

    fn from_change(change: &FileChange) -> Self {
        match &change.before {
            Some(FileState { content, hash, .. }) => RestoreAction::Restore {
                file_path: change.file_path.clone(),
                content: content.clone(),
                hash: hash.clone(),
                source_change_id: change.change_id.clone(),
            },
            None => RestoreAction::Delete {
                file_path: change.file_path.clone(),
                source_change_id: change.change_id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackPlan {
    pub actions: Vec<RestoreAction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub restored: Vec<String>,
    pub deleted: Vec<String>,
    /// Files already in the target state.
    pub unchanged: Vec<String>,
    pub failed: Vec<String>,
}

/// Group changes by file and keep the earliest snapshot per file.
fn earliest_per_file(changes: Vec<FileChange>) -> Vec<FileChange> {
    let mut by_file: BTreeMap<String, FileChange> = BTreeMap::new();
    for change in changes {
        match by_file.get(&change.file_path) {
            Some(existing) if existing.timestamp <= change.timestamp => {}
            _ => {
                by_file.insert(change.file_path.clone(), change);
            }
        }
    }
    by_file.into_values().collect()
}

/// Compute the restore plan for a target without touching disk.
pub fn plan(store: &HistoryStore, target: &RollbackTarget) -> Result<RollbackPlan> {
    let changes = match target {
        RollbackTarget::Change(id) => vec![store.find(id)?],
        RollbackTarget::File(path) => {
            let matches = store.by_file(path)?;
            if matches.is_empty() {
                return Err(Error::Other(format!("no snapshots for file {path}")));
            }
            earliest_per_file(matches)
        }
        RollbackTarget::Agent(agent_id) => earliest_per_file(store.by_agent(agent_id)?),
        RollbackTarget::Session(session_id) => earliest_per_file(store.session_changes(session_id)?),
        RollbackTarget::After(cutoff) => earliest_per_file(store.after(*cutoff)?),
    };

    Ok(RollbackPlan {
        actions: changes.iter().map(RestoreAction::from_change).collect(),
    })
}

/// Apply a plan against the workspace root. Each file is restored
/// atomically (temp + rename); one file's failure does not abort the
/// others.
pub fn apply(plan: &RollbackPlan, workspace_root: &Path) -> RollbackOutcome {
    let mut outcome = RollbackOutcome {
        restored: Vec::new(),
        deleted: Vec::new(),
        unchanged: Vec::new(),
        failed: Vec::new(),
    };

    for action in &plan.actions {
        let target = workspace_root.join(action.file_path());
        match action {
            RestoreAction::Restore { file_path, content, .. } => {
                if let Ok(current) = std::fs::read_to_string(&target) {
                    if current == *content {
                        outcome.unchanged.push(file_path.clone());
                        continue;
                    }
                }
                let result = (|| -> Result<()> {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let tmp = target.with_extension("fm-rollback.tmp");
                    std::fs::write(&tmp, content.as_bytes())?;
                    std::fs::rename(&tmp, &target)?;
                    Ok(())
                })();
                match result {
                    Ok(()) => outcome.restored.push(file_path.clone()),
                    Err(e) => {
                        tracing::warn!(file = %file_path, error = %e, "rollback restore failed");
                        outcome.failed.push(file_path.clone());
                    }
                }
            }
            RestoreAction::Delete { file_path, .. } => {
                if !target.exists() {
                    outcome.unchanged.push(file_path.clone());
                    continue;
                }
                match std::fs::remove_file(&target) {
                    Ok(()) => outcome.deleted.push(file_path.clone()),
                    Err(e) => {
                        tracing::warn!(file = %file_path, error = %e, "rollback delete failed");
                        outcome.failed.push(file_path.clone());
                    }
                }
            }
        }
    }

    outcome
}
