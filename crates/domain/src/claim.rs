//! Claims — explicit, verifiable statements by a worker about side
//! effects it performed. The verifier checks each claim against the tool
//! trace and the real filesystem.

use serde::{Deserialize, Serialize};

/// Pair of short code snippets located before/after a change. Anchors
/// are preferred over line numbers because they survive later edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub before_snippet: String,
    pub after_snippet: String,
    pub content_hash: String,
}

/// A verifiable side-effect claim, discriminated by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Claim {
    FileWrite {
        file_path: String,
        content_hash: String,
    },
    FileEdit {
        file_path: String,
        anchor: Anchor,
        #[serde(skip_serializing_if = "Option::is_none")]
        edited_region: Option<String>,
    },
    FileDelete {
        file_path: String,
    },
    CommandExecuted {
        command: String,
        exit_code: i32,
    },
    CodeInserted {
        file_path: String,
        anchor: Anchor,
    },
}

impl Claim {
    /// The file path this claim refers to, if any.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            Claim::FileWrite { file_path, .. }
            | Claim::FileEdit { file_path, .. }
            | Claim::FileDelete { file_path }
            | Claim::CodeInserted { file_path, .. } => Some(file_path),
            Claim::CommandExecuted { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Claim::FileWrite { .. } => "file-write",
            Claim::FileEdit { .. } => "file-edit",
            Claim::FileDelete { .. } => "file-delete",
            Claim::CommandExecuted { .. } => "command-executed",
            Claim::CodeInserted { .. } => "code-inserted",
        }
    }
}

/// Small named artifact attached to a specialist output. Content is
/// bounded (1 KiB) and checked by the structural verifier level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub content: String,
}

/// The structured output a worker hands back for verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistOutput {
    pub summary: String,
    /// Opaque reference of the form `trace:<traceId>`.
    pub trace_ref: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claims: Vec<Claim>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl SpecialistOutput {
    pub fn new(summary: impl Into<String>, trace_ref: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            trace_ref: trace_ref.into(),
            claims: Vec::new(),
            artifacts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_serializes_kebab_case_tag() {
        let claim = Claim::FileWrite {
            file_path: "out.txt".into(),
            content_hash: "abc".into(),
        };
        let value = serde_json::to_value(&claim).unwrap();
        assert_eq!(value["type"], "file-write");
        assert_eq!(value["file_path"], "out.txt");
    }

    #[test]
    fn kind_name_matches_tag() {
        let anchor = Anchor {
            before_snippet: "fn a() {".into(),
            after_snippet: "}".into(),
            content_hash: "h".into(),
        };
        let claims = vec![
            Claim::FileDelete { file_path: "x".into() },
            Claim::CommandExecuted { command: "ls".into(), exit_code: 0 },
            Claim::CodeInserted { file_path: "y".into(), anchor },
        ];
        for claim in claims {
            let value = serde_json::to_value(&claim).unwrap();
            assert_eq!(value["type"], claim.kind_name());
        }
    }

    #[test]
    fn command_claim_has_no_path() {
        let claim = Claim::CommandExecuted { command: "make".into(), exit_code: 2 };
        assert!(claim.file_path().is_none());
    }
}
