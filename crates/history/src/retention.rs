//! Retention — bound the snapshot store by session count, age, and
//! total size.

use std::path::PathBuf;

use chrono::Utc;

use fm_domain::config::HistoryConfig;
use fm_domain::Result;

use crate::store::HistoryStore;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_sessions: usize,
    pub max_age_days: u32,
    pub max_total_size_mb: u64,
}

impl From<&HistoryConfig> for RetentionPolicy {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            max_age_days: config.max_age_days,
            max_total_size_mb: config.max_total_size_mb,
        }
    }
}

#[derive(Debug)]
struct SessionDir {
    path: PathBuf,
    /// Newest snapshot timestamp in the session, from file mtimes.
    newest: std::time::SystemTime,
    size_bytes: u64,
}

fn dir_size(path: &PathBuf) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_dir() {
                    total += dir_size(&entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
    }
    total
}

fn newest_mtime(path: &PathBuf) -> std::time::SystemTime {
    let mut newest = std::time::SystemTime::UNIX_EPOCH;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_dir() {
                    newest = newest.max(newest_mtime(&entry.path()));
                } else if let Ok(modified) = meta.modified() {
                    newest = newest.max(modified);
                }
            }
        }
    }
    newest
}

/// Remove whole session directories until the policy holds. Returns the
/// number of sessions pruned. Oldest sessions go first.
pub fn prune(store: &HistoryStore, policy: &RetentionPolicy) -> Result<usize> {
    let sessions_root = store.sessions_dir();
    if !sessions_root.exists() {
        return Ok(0);
    }

    let mut sessions: Vec<SessionDir> = Vec::new();
    for entry in std::fs::read_dir(&sessions_root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        sessions.push(SessionDir {
            newest: newest_mtime(&path),
            size_bytes: dir_size(&path),
            path,
        });
    }
    // Oldest first.
    sessions.sort_by_key(|s| s.newest);

    let mut pruned = 0;
    let now = std::time::SystemTime::now();
    let max_age = std::time::Duration::from_secs(policy.max_age_days as u64 * 24 * 3600);

    // Age bound.
    sessions.retain(|session| {
        let too_old = now
            .duration_since(session.newest)
            .map(|age| age > max_age)
            .unwrap_or(false);
        if too_old {
            if std::fs::remove_dir_all(&session.path).is_ok() {
                pruned += 1;
            }
            false
        } else {
            true
        }
    });

    // Count bound.
    while sessions.len() > policy.max_sessions {
        let oldest = sessions.remove(0);
        if std::fs::remove_dir_all(&oldest.path).is_ok() {
            pruned += 1;
        }
    }

    // Size bound.
    let mut total: u64 = sessions.iter().map(|s| s.size_bytes).sum();
    let limit = policy.max_total_size_mb * 1024 * 1024;
    while total > limit && !sessions.is_empty() {
        let oldest = sessions.remove(0);
        total = total.saturating_sub(oldest.size_bytes);
        if std::fs::remove_dir_all(&oldest.path).is_ok() {
            pruned += 1;
        }
    }

    if pruned > 0 {
        tracing::info!(pruned, at = %Utc::now(), "pruned file-history sessions");
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileChange, FileState, Operation};

    fn seed_session(store: &HistoryStore, session: &str, payload_len: usize) {
        let change = FileChange::new(
            session,
            "a",
            "f.txt",
            Operation::Write,
            None,
            Some(FileState::of("x".repeat(payload_len))),
        );
        store.record(&change).unwrap();
    }

    #[test]
    fn prunes_to_session_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        for i in 0..5 {
            seed_session(&store, &format!("s{i}"), 10);
        }

        let policy = RetentionPolicy {
            max_sessions: 2,
            max_age_days: 365,
            max_total_size_mb: 1024,
        };
        let pruned = prune(&store, &policy).unwrap();
        assert_eq!(pruned, 3);

        let remaining = std::fs::read_dir(store.sessions_dir()).unwrap().count();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn size_bound_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        // Two sessions of ~1MiB+ each against a 1MB cap.
        seed_session(&store, "old", 1_200_000);
        seed_session(&store, "new", 1_200_000);

        let policy = RetentionPolicy {
            max_sessions: 10,
            max_age_days: 365,
            max_total_size_mb: 1,
        };
        let pruned = prune(&store, &policy).unwrap();
        assert!(pruned >= 1);
    }

    #[test]
    fn empty_store_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let policy = RetentionPolicy {
            max_sessions: 1,
            max_age_days: 1,
            max_total_size_mb: 1,
        };
        assert_eq!(prune(&store, &policy).unwrap(), 0);
    }
}
