//! Trace data model: invocations, evidence refs, digests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a tool was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Execution,
    Verification,
}

/// Terminal status of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Failed,
    Timeout,
    Error,
}

/// Structured proof attached to an invocation: a file touched (with an
/// optional content hash), a log line, or an opaque receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceRef {
    File {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_hash: Option<String>,
    },
    Log {
        reference: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Receipt {
        tool: String,
        args_hash: String,
    },
}

/// Compressed record of what an invocation did, designed for fast
/// verification without parsing the full output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Digest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_events: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub counters: HashMap<String, u64>,
}

impl Digest {
    pub fn event(&mut self, name: &str) {
        if !self.key_events.iter().any(|e| e == name) {
            self.key_events.push(name.to_owned());
        }
    }

    pub fn count(&mut self, counter: &str) {
        *self.counters.entry(counter.to_owned()).or_insert(0) += 1;
    }
}

/// One recorded tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub invocation_id: String,
    pub tool: String,
    /// SHA-256 of the canonical-JSON arguments.
    pub args_hash: String,
    pub args: Value,
    pub timestamp: DateTime<Utc>,
    pub purpose: Purpose,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<EvidenceRef>,
    #[serde(default)]
    pub digest: Digest,
}

/// Append-only, ordered log of a worker's tool invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTrace {
    pub trace_id: String,
    pub session_id: String,
    pub specialist_id: String,
    pub invocations: Vec<ToolInvocation>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolTrace {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Find invocations by tool name, successful ones only.
    pub fn successful<'a>(&'a self, tool: &'a str) -> impl Iterator<Item = &'a ToolInvocation> + 'a {
        self.invocations
            .iter()
            .filter(move |inv| inv.tool == tool && inv.status == InvocationStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_dedupes_events_and_counts() {
        let mut digest = Digest::default();
        digest.event("file_created");
        digest.event("file_created");
        digest.count("files_written");
        digest.count("files_written");
        assert_eq!(digest.key_events, vec!["file_created"]);
        assert_eq!(digest.counters["files_written"], 2);
    }

    #[test]
    fn evidence_ref_wire_shape() {
        let evidence = EvidenceRef::Log {
            reference: "shell:ls".into(),
            exit_code: Some(0),
        };
        let value = serde_json::to_value(&evidence).unwrap();
        assert_eq!(value["kind"], "log");
        assert_eq!(value["reference"], "shell:ls");
    }
}
