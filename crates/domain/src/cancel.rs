//! Cancellation tokens with group fan-out.
//!
//! Each run gets a `CancelToken`; the iteration loop checks it at the top
//! of every iteration and in-flight tools observe the same token.
//!
//! **Groups** support cascading cancellation: stopping an orchestrator run
//! cancels every delegated worker registered in its group.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation token that can be checked by the runtime loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks active cancellation tokens per run id, with group support for
/// cascading orchestrator→worker cancellation.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    /// group key (orchestrator run) → set of child run ids.
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new cancel token for a run.
    pub fn register(&self, run_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id.to_owned(), token.clone());
        token
    }

    /// Cancel a run. Also cancels all children in the run's cancel group.
    /// Returns true if a token was found.
    pub fn cancel(&self, run_id: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(run_id) {
            token.cancel();
            true
        } else {
            false
        };

        // Cascade to children.
        if let Some(children) = self.groups.lock().get(run_id) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(token) = tokens.get(child) {
                    token.cancel();
                }
            }
        }

        found
    }

    /// Remove the token for a run (called when the run completes).
    pub fn remove(&self, run_id: &str) {
        self.tokens.lock().remove(run_id);
        self.groups.lock().remove(run_id);
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.tokens.lock().contains_key(run_id)
    }

    /// Register a child run in a parent's cancel group.
    pub fn add_to_group(&self, parent: &str, child: &str) {
        self.groups
            .lock()
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
    }

    pub fn remove_from_group(&self, parent: &str, child: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                groups.remove(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn register_and_cancel() {
        let map = CancelMap::new();
        let token = map.register("r1");
        assert!(map.is_running("r1"));

        assert!(map.cancel("r1"));
        assert!(token.is_cancelled());

        map.remove("r1");
        assert!(!map.is_running("r1"));
        assert!(!map.cancel("r1"));
    }

    #[test]
    fn cancel_cascades_to_group_children() {
        let map = CancelMap::new();
        let parent = map.register("orc");
        let child_a = map.register("w1");
        let child_b = map.register("w2");

        map.add_to_group("orc", "w1");
        map.add_to_group("orc", "w2");

        map.cancel("orc");
        assert!(parent.is_cancelled());
        assert!(child_a.is_cancelled());
        assert!(child_b.is_cancelled());
    }

    #[test]
    fn removed_child_does_not_cascade() {
        let map = CancelMap::new();
        let _parent = map.register("p");
        let child = map.register("c");

        map.add_to_group("p", "c");
        map.remove_from_group("p", "c");

        map.cancel("p");
        assert!(!child.is_cancelled());
    }

    #[test]
    fn remove_is_idempotent() {
        let map = CancelMap::new();
        map.register("r1");
        map.remove("r1");
        map.remove("r1");
        assert!(!map.is_running("r1"));
    }
}
