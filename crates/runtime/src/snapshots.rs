//! File-history capture around mutating filesystem tools.
//!
//! Wraps a tool executor; for `fs:write`, `fs:edit`, and `fs:delete`
//! the `before` state is read before the tool runs, the `after` state
//! once it succeeds, and the pair is persisted as a snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use fm_domain::cancel::CancelToken;
use fm_domain::message::ToolDefinition;
use fm_history::{FileChange, FileState, HistoryStore, Operation};
use fm_tools::{ToolExecutor, ToolOutcome};

pub struct SnapshottingExecutor {
    inner: Arc<dyn ToolExecutor>,
    store: Arc<HistoryStore>,
    workspace_root: PathBuf,
    session_id: String,
    agent_id: String,
}

impl SnapshottingExecutor {
    pub fn new(
        inner: Arc<dyn ToolExecutor>,
        store: Arc<HistoryStore>,
        workspace_root: PathBuf,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            store,
            workspace_root,
            session_id: session_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

fn operation_for(tool: &str) -> Option<Operation> {
    match tool {
        "fs:write" => Some(Operation::Write),
        "fs:edit" => Some(Operation::Patch),
        "fs:delete" => Some(Operation::Delete),
        _ => None,
    }
}

#[async_trait::async_trait]
impl ToolExecutor for SnapshottingExecutor {
    async fn execute(&self, name: &str, input: &Value, cancel: &CancelToken) -> ToolOutcome {
        let Some(operation) = operation_for(name) else {
            return self.inner.execute(name, input, cancel).await;
        };
        let Some(rel_path) = input.get("path").and_then(Value::as_str).map(str::to_owned) else {
            return self.inner.execute(name, input, cancel).await;
        };

        // Capture before the write begins.
        let abs = self.workspace_root.join(&rel_path);
        let before = std::fs::read_to_string(&abs).ok().map(FileState::of);

        let outcome = self.inner.execute(name, input, cancel).await;
        if !outcome.success {
            return outcome;
        }

        let after = match operation {
            Operation::Delete => None,
            Operation::Write | Operation::Patch => std::fs::read_to_string(&abs).ok().map(FileState::of),
        };

        let change = FileChange::new(
            &self.session_id,
            &self.agent_id,
            rel_path,
            operation,
            before,
            after,
        );
        if let Err(e) = self.store.record(&change) {
            tracing::warn!(error = %e, "file-history snapshot failed");
        }
        outcome
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.inner.definitions()
    }
}
