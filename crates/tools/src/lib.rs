//! Tool execution contract and built-in tools.
//!
//! Tools are named `namespace:operation` (`fs:read`, `shell:exec`). The
//! runtime consumes them through [`ToolExecutor`]; the registry enforces
//! glob deny/allow permissions before any tool runs.

pub mod fs_ops;
pub mod permissions;
pub mod registry;
pub mod shell;

use fm_domain::cancel::CancelToken;
use fm_domain::message::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reserved tool names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal-answer tool intercepted by the iteration loop.
pub const TOOL_REPORT: &str = "report";
/// Delegation tool, available only to orchestrators.
pub const TOOL_SPAWN_AGENT: &str = "spawn_agent";
pub const TOOL_ASK_ORCHESTRATOR: &str = "ask_orchestrator";
pub const TOOL_ARCHIVE_RECALL: &str = "archive_recall";
pub const TOOL_REFLECT: &str = "reflect_on_progress";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structured tool error, surfaced to the LLM rather than thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Result of one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolOutcome {
    pub fn ok(output: Value) -> Self {
        Self { success: true, output: Some(output), error: None, metadata: None }
    }

    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(ToolError::new(code, message)),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Render the outcome as text for the conversation history.
    pub fn to_content(&self) -> String {
        if let Some(err) = &self.error {
            return format!("[{}] {}", err.code, err.message);
        }
        match &self.output {
            Some(Value::String(s)) => s.clone(),
            Some(other) => serde_json::to_string_pretty(other).unwrap_or_default(),
            None => String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single named tool.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, input: Value, cancel: &CancelToken) -> ToolOutcome;
}

/// What the runtime consumes: dispatch by name plus definition listing.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, input: &Value, cancel: &CancelToken) -> ToolOutcome;

    fn definitions(&self) -> Vec<ToolDefinition>;
}

pub use permissions::PermissionGate;
pub use registry::ToolRegistry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_content_rendering() {
        let ok = ToolOutcome::ok(Value::String("hello".into()));
        assert_eq!(ok.to_content(), "hello");

        let err = ToolOutcome::fail("not_found", "no such file");
        assert_eq!(err.to_content(), "[not_found] no such file");

        let structured = ToolOutcome::ok(serde_json::json!({"entries": 2}));
        assert!(structured.to_content().contains("entries"));
    }
}
