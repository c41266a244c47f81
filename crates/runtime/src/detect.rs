//! Progress tracking and loop detection.
//!
//! A sliding window of the last six `(tool, canonical(args))` signatures
//! is kept; a loop is declared when the last three equal the previous
//! three (period-3 repetition, which also catches shorter periods).
//! `iterations_since_progress` increments every iteration and resets on
//! any successful tool call with non-empty output; at the stuck
//! threshold a stuck signal is surfaced.

use std::collections::VecDeque;

use serde_json::Value;

use fm_trace::canonical_json;

const WINDOW: usize = 6;

#[derive(Debug)]
pub struct ProgressTracker {
    signatures: VecDeque<String>,
    iterations_since_progress: u32,
    stuck_threshold: u32,
}

impl ProgressTracker {
    pub fn new(stuck_threshold: u32) -> Self {
        Self {
            signatures: VecDeque::with_capacity(WINDOW),
            iterations_since_progress: 0,
            stuck_threshold,
        }
    }

    /// Record one tool call's signature.
    pub fn record_call(&mut self, tool: &str, args: &Value) {
        let signature = format!("{tool}:{}", canonical_json(args));
        if self.signatures.len() == WINDOW {
            self.signatures.pop_front();
        }
        self.signatures.push_back(signature);
    }

    /// A successful tool call that produced non-empty output.
    pub fn record_progress(&mut self) {
        self.iterations_since_progress = 0;
    }

    /// Called once per completed iteration.
    pub fn record_iteration(&mut self) {
        self.iterations_since_progress += 1;
    }

    /// Period-3 repetition over the six-entry window.
    pub fn loop_detected(&self) -> bool {
        if self.signatures.len() < WINDOW {
            return false;
        }
        let items: Vec<&String> = self.signatures.iter().collect();
        items[0..3] == items[3..6]
    }

    pub fn is_stuck(&self) -> bool {
        self.iterations_since_progress >= self.stuck_threshold
    }

    pub fn iterations_since_progress(&self) -> u32 {
        self.iterations_since_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn six_identical_calls_trip_the_detector() {
        let mut tracker = ProgressTracker::new(4);
        for _ in 0..5 {
            tracker.record_call("grep", &json!({"pattern": "a"}));
            assert!(!tracker.loop_detected());
        }
        tracker.record_call("grep", &json!({"pattern": "a"}));
        assert!(tracker.loop_detected());
    }

    #[test]
    fn period_three_cycle_is_detected() {
        let mut tracker = ProgressTracker::new(4);
        for _ in 0..2 {
            tracker.record_call("a", &json!(1));
            tracker.record_call("b", &json!(2));
            tracker.record_call("c", &json!(3));
        }
        assert!(tracker.loop_detected());
    }

    #[test]
    fn varied_calls_do_not_trip() {
        let mut tracker = ProgressTracker::new(4);
        for i in 0..10 {
            tracker.record_call("grep", &json!({ "pattern": i }));
        }
        assert!(!tracker.loop_detected());
    }

    #[test]
    fn signature_uses_canonical_args() {
        let mut tracker = ProgressTracker::new(4);
        // Same args, different key order: same signature.
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        for _ in 0..3 {
            tracker.record_call("t", &a);
        }
        for _ in 0..3 {
            tracker.record_call("t", &b);
        }
        assert!(tracker.loop_detected());
    }

    #[test]
    fn stuck_threshold_and_reset() {
        let mut tracker = ProgressTracker::new(4);
        for _ in 0..3 {
            tracker.record_iteration();
        }
        assert!(!tracker.is_stuck());
        tracker.record_iteration();
        assert!(tracker.is_stuck());

        tracker.record_progress();
        assert!(!tracker.is_stuck());
        assert_eq!(tracker.iterations_since_progress(), 0);
    }
}
