//! Tool registry — name → tool dispatch behind the permission gate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use fm_domain::cancel::CancelToken;
use fm_domain::config::ToolsConfig;
use fm_domain::message::ToolDefinition;

use crate::fs_ops::{FsDelete, FsEdit, FsList, FsRead, FsWrite};
use crate::permissions::PermissionGate;
use crate::shell::ShellExec;
use crate::{Tool, ToolExecutor, ToolOutcome, TOOL_REPORT};

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    gate: PermissionGate,
}

impl ToolRegistry {
    pub fn new(gate: PermissionGate) -> Self {
        Self { tools: HashMap::new(), gate }
    }

    /// Registry with the built-in filesystem and shell tools rooted at
    /// `workspace_root`.
    pub fn builtin(workspace_root: &Path, config: &ToolsConfig) -> Self {
        let ws = workspace_root.to_path_buf();
        let mut registry = Self::new(PermissionGate::from_config(config));
        registry.register(Arc::new(FsRead { workspace_root: ws.clone() }));
        registry.register(Arc::new(FsWrite { workspace_root: ws.clone() }));
        registry.register(Arc::new(FsEdit { workspace_root: ws.clone() }));
        registry.register(Arc::new(FsDelete { workspace_root: ws.clone() }));
        registry.register(Arc::new(FsList { workspace_root: ws.clone() }));
        registry.register(Arc::new(ShellExec {
            workdir: ws,
            default_timeout_secs: config.shell_timeout_secs,
        }));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

/// Definition of the terminal `report` tool. The iteration loop
/// intercepts calls to it; it never executes through the registry.
pub fn report_definition() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_REPORT.into(),
        description: "Finish the task and report the final answer. Call this exactly once, when the task is complete.".into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "answer": {"type": "string", "description": "The final synthesized answer."},
                "claims": {
                    "type": "array",
                    "description": "Verifiable side-effect claims (file-write, file-edit, file-delete, command-executed, code-inserted).",
                    "items": {"type": "object"}
                }
            },
            "required": ["answer"]
        }),
    }
}

/// The `report` tool itself is a no-op acknowledgement: the iteration
/// loop extracts the answer from the call arguments; executing the tool
/// records the invocation in the trace.
pub struct ReportTool;

#[async_trait::async_trait]
impl Tool for ReportTool {
    fn definition(&self) -> ToolDefinition {
        report_definition()
    }

    async fn execute(&self, _input: Value, _cancel: &CancelToken) -> ToolOutcome {
        ToolOutcome::ok(json!({"received": true}))
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, input: &Value, cancel: &CancelToken) -> ToolOutcome {
        if !self.gate.tool_permitted(name) {
            return ToolOutcome::fail("policy_denied", format!("tool '{name}' is not permitted"));
        }
        // Filesystem tools get a second gate on the target path.
        if name.starts_with("fs:") {
            if let Some(path) = input.get("path").and_then(Value::as_str) {
                if !self.gate.path_permitted(path) {
                    return ToolOutcome::fail(
                        "policy_denied",
                        format!("path '{path}' is not permitted"),
                    );
                }
            }
        }
        match self.tools.get(name) {
            Some(tool) => tool.execute(input.clone(), cancel).await,
            None => ToolOutcome::fail("unknown_tool", format!("no tool named '{name}'")),
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| t.definition())
            .filter(|d| self.gate.tool_permitted(&d.name))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builtin_registry_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), "hello").unwrap();
        let registry = ToolRegistry::builtin(dir.path(), &ToolsConfig::default());

        let out = registry
            .execute("fs:read", &json!({"path": "x.txt"}), &CancelToken::new())
            .await;
        assert!(out.success);
        assert_eq!(out.to_content(), "hello");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::builtin(dir.path(), &ToolsConfig::default());
        let out = registry
            .execute("mind:rag-query", &json!({}), &CancelToken::new())
            .await;
        assert!(!out.success);
        assert_eq!(out.error.unwrap().code, "unknown_tool");
    }

    #[tokio::test]
    async fn denied_tool_is_policy_denied() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ToolsConfig::default();
        config.deny = vec!["shell:*".into()];
        let registry = ToolRegistry::builtin(dir.path(), &config);

        let out = registry
            .execute("shell:exec", &json!({"command": "ls"}), &CancelToken::new())
            .await;
        assert_eq!(out.error.unwrap().code, "policy_denied");

        // Denied tools are absent from the advertised definitions.
        assert!(registry.definitions().iter().all(|d| d.name != "shell:exec"));
    }

    #[tokio::test]
    async fn denied_path_is_policy_denied() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::builtin(dir.path(), &ToolsConfig::default());
        let out = registry
            .execute(
                "fs:write",
                &json!({"path": "repo/.git/hooks/pre-commit", "content": "x"}),
                &CancelToken::new(),
            )
            .await;
        assert_eq!(out.error.unwrap().code, "policy_denied");
    }

    #[test]
    fn definitions_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::builtin(dir.path(), &ToolsConfig::default());
        let names: Vec<String> = registry.definitions().iter().map(|d| d.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
