//! The Foreman execution engine.
//!
//! Composes the event bus, the middleware pipeline, the iteration loop,
//! the built-in middlewares, the output verifier, workers, the
//! orchestrator, and the run manager. Supporting infrastructure (REST,
//! WebSocket, CLI) lives in the gateway and cli crates and consumes this
//! crate's types.

pub mod bus;
pub mod correction;
pub mod detect;
pub mod factsheet;
pub mod iteration;
pub mod manager;
pub mod middlewares;
pub mod orchestrator;
pub mod pipeline;
pub mod snapshots;
pub mod verifier;
pub mod worker;

pub use bus::EventBus;
pub use correction::{CorrectionBox, CorrectionRouter, DeepestAgentRouter};
pub use iteration::{IterationLoop, LoopResult, StopCode};
pub use manager::RunManager;
pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use pipeline::{
    FailPolicy, HookConfig, IterationAction, IterationCtx, LlmCall, Middleware, Pipeline,
    ToolDecision,
};
pub use verifier::{VerificationResult, Verifier};
pub use worker::{ToolGroup, ToolStrategy, Worker, WorkerConfig};

/// Truncate a string on a char boundary, appending `...` when cut.
pub(crate) fn truncate_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_is_unicode_safe() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
        let t = truncate_str("héllo", 2);
        assert!(t.ends_with("..."));
        assert!(t.len() <= 5);
    }
}
