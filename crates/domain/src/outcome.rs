//! Structured outcomes for workers and the orchestrator.
//!
//! The runtime prefers returned unions over exceptions: a worker always
//! hands back a [`SpecialistOutcome`], and the orchestrator folds those
//! into an [`OrchestratorResult`].

use serde::{Deserialize, Serialize};

use crate::claim::SpecialistOutput;

/// Failure taxonomy. Drives retry and escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A tool returned failure.
    ToolError,
    /// Middleware, tool, or LLM timed out.
    Timeout,
    /// Output failed verification.
    ValidationFailed,
    /// Loop detector tripped, no progress.
    Stuck,
    /// Tool permission / budget denied.
    PolicyDenied,
    /// Unexpected exception.
    Unknown,
}

impl FailureKind {
    /// Whether a failure of this kind may be retried at all.
    /// `ValidationFailed` retries only after reformulation, which the
    /// orchestrator handles by injecting the verification errors.
    pub fn retryable(self) -> bool {
        match self {
            FailureKind::ToolError | FailureKind::Timeout | FailureKind::Stuck => true,
            FailureKind::ValidationFailed => true,
            FailureKind::PolicyDenied | FailureKind::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReport {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// What a worker execution produced, as a tagged union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpecialistOutcome {
    Success {
        output: SpecialistOutput,
        tokens_used: u64,
        duration_ms: u64,
    },
    Failure {
        report: FailureReport,
        /// Partial output preserved for synthesis on unrecoverable failure.
        #[serde(skip_serializing_if = "Option::is_none")]
        partial: Option<SpecialistOutput>,
        tokens_used: u64,
        duration_ms: u64,
    },
    /// The worker asked its caller to retry at a higher tier. The
    /// iteration loop never retries on its own.
    Escalate {
        reason: String,
        tokens_used: u64,
        duration_ms: u64,
    },
}

impl SpecialistOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SpecialistOutcome::Success { .. })
    }

    pub fn tokens_used(&self) -> u64 {
        match self {
            SpecialistOutcome::Success { tokens_used, .. }
            | SpecialistOutcome::Failure { tokens_used, .. }
            | SpecialistOutcome::Escalate { tokens_used, .. } => *tokens_used,
        }
    }

    pub fn output(&self) -> Option<&SpecialistOutput> {
        match self {
            SpecialistOutcome::Success { output, .. } => Some(output),
            SpecialistOutcome::Failure { partial, .. } => partial.as_ref(),
            SpecialistOutcome::Escalate { .. } => None,
        }
    }
}

/// A decomposed unit of work produced by the orchestrator's planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub description: String,
    pub agent_id: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_complexity: f64,
}

/// Result of delegating one subtask to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedResult {
    pub subtask_id: String,
    pub agent_id: String,
    pub success: bool,
    pub output: String,
    pub tokens_used: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcome: SpecialistOutcome,
}

/// Terminal result of one orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub success: bool,
    pub answer: String,
    pub plan: Vec<SubTask>,
    pub delegated_results: Vec<DelegatedResult>,
    pub tokens_used: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_retryability() {
        assert!(FailureKind::ToolError.retryable());
        assert!(FailureKind::Timeout.retryable());
        assert!(FailureKind::Stuck.retryable());
        assert!(FailureKind::ValidationFailed.retryable());
        assert!(!FailureKind::PolicyDenied.retryable());
        assert!(!FailureKind::Unknown.retryable());
    }

    #[test]
    fn outcome_tag_on_wire() {
        let outcome = SpecialistOutcome::Escalate {
            reason: "stuck".into(),
            tokens_used: 10,
            duration_ms: 5,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "escalate");
        assert!(!outcome.is_success());
    }

    #[test]
    fn failure_preserves_partial_output() {
        let partial = SpecialistOutput::new("half done", "trace:t1");
        let outcome = SpecialistOutcome::Failure {
            report: FailureReport::new(FailureKind::Timeout, "tool timed out"),
            partial: Some(partial),
            tokens_used: 42,
            duration_ms: 100,
        };
        assert_eq!(outcome.output().unwrap().summary, "half done");
        assert_eq!(outcome.tokens_used(), 42);
    }
}
