//! Filesystem tools — safe, auditable file I/O constrained to a
//! workspace root.
//!
//! Paths containing `..`, absolute paths, or paths resolving outside the
//! workspace are rejected before any I/O happens. All tools return
//! structured JSON results.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use fm_domain::cancel::CancelToken;
use fm_domain::message::ToolDefinition;
use fm_domain::{Error, Result};

use crate::{Tool, ToolOutcome};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn refuse(requested: &str, why: impl Into<String>) -> Error {
    Error::Tool {
        tool: "fs".into(),
        message: format!("'{requested}': {}", why.into()),
    }
}

/// Resolve a tool-supplied path against the workspace root.
///
/// Only plain relative paths are accepted: `..`, absolute paths, and
/// drive prefixes are refused outright. The path is then grown one
/// component at a time from the canonicalized root, and every prefix
/// that exists on disk is re-canonicalized and checked for containment,
/// so a symlinked directory inside the workspace cannot lead a later
/// component outside it. Trailing components that do not exist yet
/// (the target of a pending write) stay lexical.
pub fn resolve_in_workspace(workspace_root: &Path, requested: &str) -> Result<PathBuf> {
    let root = workspace_root
        .canonicalize()
        .map_err(|e| refuse(requested, format!("workspace root is not resolvable: {e}")))?;

    let mut resolved = root.clone();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => continue,
            Component::ParentDir => {
                return Err(refuse(requested, "'..' components are not allowed"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(refuse(
                    requested,
                    "absolute paths are not allowed; use a path relative to the workspace root",
                ));
            }
        }
        if resolved.exists() {
            resolved = resolved
                .canonicalize()
                .map_err(|e| refuse(requested, format!("cannot resolve: {e}")))?;
            if !resolved.starts_with(&root) {
                return Err(refuse(requested, "path leaves the workspace root"));
            }
        }
    }

    Ok(resolved)
}

fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> std::result::Result<T, ToolOutcome> {
    serde_json::from_value(input)
        .map_err(|e| ToolOutcome::fail("invalid_args", format!("bad tool arguments: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fs:read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ReadRequest {
    path: String,
    /// Line number to start from (0-indexed).
    #[serde(default)]
    offset: Option<usize>,
    /// Maximum number of lines to return.
    #[serde(default)]
    limit: Option<usize>,
}

pub struct FsRead {
    pub workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl Tool for FsRead {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fs:read".into(),
            description: "Read a file from the workspace. Optionally a line range.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer"},
                    "limit": {"type": "integer"}
                },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, input: Value, _cancel: &CancelToken) -> ToolOutcome {
        let req: ReadRequest = match parse_input(input) {
            Ok(r) => r,
            Err(out) => return out,
        };
        let path = match resolve_in_workspace(&self.workspace_root, &req.path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::fail("invalid_path", e.to_string()),
        };
        match fs::read_to_string(&path).await {
            Ok(content) => {
                let content = match (req.offset, req.limit) {
                    (None, None) => content,
                    (offset, limit) => {
                        let start = offset.unwrap_or(0);
                        let lines: Vec<&str> = content.lines().collect();
                        let end = limit.map_or(lines.len(), |l| (start + l).min(lines.len()));
                        if start >= lines.len() {
                            String::new()
                        } else {
                            lines[start..end].join("\n")
                        }
                    }
                };
                ToolOutcome::ok(Value::String(content))
                    .with_metadata(json!({"path": req.path, "operation": "read"}))
            }
            Err(e) => ToolOutcome::fail("read_failed", format!("{}: {e}", req.path)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fs:write
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct WriteRequest {
    path: String,
    content: String,
}

pub struct FsWrite {
    pub workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl Tool for FsWrite {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fs:write".into(),
            description: "Write (create or overwrite) a file in the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    async fn execute(&self, input: Value, _cancel: &CancelToken) -> ToolOutcome {
        let req: WriteRequest = match parse_input(input) {
            Ok(r) => r,
            Err(out) => return out,
        };
        let path = match resolve_in_workspace(&self.workspace_root, &req.path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::fail("invalid_path", e.to_string()),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolOutcome::fail("write_failed", format!("creating {}: {e}", parent.display()));
            }
        }
        match fs::write(&path, req.content.as_bytes()).await {
            Ok(()) => ToolOutcome::ok(json!({
                "path": req.path,
                "bytes_written": req.content.len(),
            }))
            .with_metadata(json!({"path": req.path, "operation": "write"})),
            Err(e) => ToolOutcome::fail("write_failed", format!("{}: {e}", req.path)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fs:edit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct EditRequest {
    path: String,
    /// Exact text to replace. Must occur exactly once.
    old_text: String,
    new_text: String,
}

pub struct FsEdit {
    pub workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl Tool for FsEdit {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fs:edit".into(),
            description: "Replace an exact text snippet in a file. The snippet must occur exactly once.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_text": {"type": "string"},
                    "new_text": {"type": "string"}
                },
                "required": ["path", "old_text", "new_text"]
            }),
        }
    }

    async fn execute(&self, input: Value, _cancel: &CancelToken) -> ToolOutcome {
        let req: EditRequest = match parse_input(input) {
            Ok(r) => r,
            Err(out) => return out,
        };
        let path = match resolve_in_workspace(&self.workspace_root, &req.path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::fail("invalid_path", e.to_string()),
        };
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolOutcome::fail("read_failed", format!("{}: {e}", req.path)),
        };
        let occurrences = content.matches(&req.old_text).count();
        if occurrences == 0 {
            return ToolOutcome::fail("no_match", format!("snippet not found in {}", req.path));
        }
        if occurrences > 1 {
            return ToolOutcome::fail(
                "ambiguous_match",
                format!("snippet occurs {occurrences} times in {}; make it unique", req.path),
            );
        }
        let updated = content.replacen(&req.old_text, &req.new_text, 1);
        match fs::write(&path, updated.as_bytes()).await {
            Ok(()) => ToolOutcome::ok(json!({"path": req.path, "replacements": 1}))
                .with_metadata(json!({"path": req.path, "operation": "patch"})),
            Err(e) => ToolOutcome::fail("write_failed", format!("{}: {e}", req.path)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fs:delete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    path: String,
}

pub struct FsDelete {
    pub workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl Tool for FsDelete {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fs:delete".into(),
            description: "Delete a file from the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, input: Value, _cancel: &CancelToken) -> ToolOutcome {
        let req: DeleteRequest = match parse_input(input) {
            Ok(r) => r,
            Err(out) => return out,
        };
        let path = match resolve_in_workspace(&self.workspace_root, &req.path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::fail("invalid_path", e.to_string()),
        };
        match fs::remove_file(&path).await {
            Ok(()) => ToolOutcome::ok(json!({"path": req.path, "deleted": true}))
                .with_metadata(json!({"path": req.path, "operation": "delete"})),
            Err(e) => ToolOutcome::fail("delete_failed", format!("{}: {e}", req.path)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// fs:list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ListRequest {
    #[serde(default = "default_dot")]
    path: String,
}

fn default_dot() -> String {
    ".".into()
}

pub struct FsList {
    pub workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl Tool for FsList {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fs:list".into(),
            description: "List directory entries in the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}}
            }),
        }
    }

    async fn execute(&self, input: Value, _cancel: &CancelToken) -> ToolOutcome {
        let req: ListRequest = match parse_input(input) {
            Ok(r) => r,
            Err(out) => return out,
        };
        let path = match resolve_in_workspace(&self.workspace_root, &req.path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::fail("invalid_path", e.to_string()),
        };
        let mut reader = match fs::read_dir(&path).await {
            Ok(r) => r,
            Err(e) => return ToolOutcome::fail("list_failed", format!("{}: {e}", req.path)),
        };
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let meta = entry.metadata().await.ok();
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "is_dir": meta.as_ref().map(|m| m.is_dir()).unwrap_or(false),
                "size": meta.as_ref().map(|m| m.len()).unwrap_or(0),
            }));
        }
        entries.sort_by(|a, b| {
            a["name"].as_str().unwrap_or("").cmp(b["name"].as_str().unwrap_or(""))
        });
        ToolOutcome::ok(json!({"path": req.path, "entries": entries}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        (dir, path)
    }

    #[test]
    fn resolve_rejects_escape_attempts() {
        let (_guard, root) = root();
        assert!(resolve_in_workspace(&root, "../outside").is_err());
        assert!(resolve_in_workspace(&root, "/etc/passwd").is_err());
        assert!(resolve_in_workspace(&root, "a/../../b").is_err());
        assert!(resolve_in_workspace(&root, "sub/file.txt").is_ok());
        assert!(resolve_in_workspace(&root, "./sub/file.txt").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_refuses_symlink_escapes() {
        let (_outside_guard, outside) = root();
        let (_guard, root) = root();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        // The symlinked prefix resolves outside the root, even though
        // the requested path is lexically relative.
        let err = resolve_in_workspace(&root, "link/escape.txt").unwrap_err();
        assert!(err.to_string().contains("leaves the workspace"));

        // A symlink that stays inside the workspace is fine.
        std::fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();
        assert!(resolve_in_workspace(&root, "alias/new.txt").is_ok());
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let (_guard, ws) = root();
        let cancel = CancelToken::new();

        let write = FsWrite { workspace_root: ws.clone() };
        let out = write
            .execute(json!({"path": "notes/a.txt", "content": "hello"}), &cancel)
            .await;
        assert!(out.success, "{:?}", out.error);

        let read = FsRead { workspace_root: ws.clone() };
        let out = read.execute(json!({"path": "notes/a.txt"}), &cancel).await;
        assert_eq!(out.output, Some(Value::String("hello".into())));
    }

    #[tokio::test]
    async fn edit_requires_unique_match() {
        let (_guard, ws) = root();
        let cancel = CancelToken::new();
        std::fs::write(ws.join("f.txt"), "aaa bbb aaa").unwrap();

        let edit = FsEdit { workspace_root: ws.clone() };
        let out = edit
            .execute(json!({"path": "f.txt", "old_text": "aaa", "new_text": "x"}), &cancel)
            .await;
        assert!(!out.success);
        assert_eq!(out.error.unwrap().code, "ambiguous_match");

        let out = edit
            .execute(json!({"path": "f.txt", "old_text": "bbb", "new_text": "yyy"}), &cancel)
            .await;
        assert!(out.success);
        assert_eq!(std::fs::read_to_string(ws.join("f.txt")).unwrap(), "aaa yyy aaa");
    }

    #[tokio::test]
    async fn delete_then_read_fails() {
        let (_guard, ws) = root();
        let cancel = CancelToken::new();
        std::fs::write(ws.join("gone.txt"), "x").unwrap();

        let delete = FsDelete { workspace_root: ws.clone() };
        let out = delete.execute(json!({"path": "gone.txt"}), &cancel).await;
        assert!(out.success);
        assert!(!ws.join("gone.txt").exists());
    }

    #[tokio::test]
    async fn read_with_offset_and_limit() {
        let (_guard, ws) = root();
        let cancel = CancelToken::new();
        std::fs::write(ws.join("lines.txt"), "one\ntwo\nthree\nfour").unwrap();

        let read = FsRead { workspace_root: ws.clone() };
        let out = read
            .execute(json!({"path": "lines.txt", "offset": 1, "limit": 2}), &cancel)
            .await;
        assert_eq!(out.output, Some(Value::String("two\nthree".into())));
    }
}
