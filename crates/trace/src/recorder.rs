//! Recorder — wraps a [`ToolExecutor`] so every call lands in the trace.
//!
//! Protocol: before execution a placeholder invocation is appended (args
//! hash computed, no output); after execution the same invocation is
//! finalized in place with status, output, duration, evidence refs and a
//! digest.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use fm_domain::cancel::CancelToken;
use fm_domain::message::ToolDefinition;
use fm_tools::{ToolExecutor, ToolOutcome};

use crate::canonical::{args_hash, sha256_hex};
use crate::invocation::{Digest, EvidenceRef, InvocationStatus, Purpose, ToolInvocation};
use crate::store::TraceStore;

pub struct ToolRecorder {
    store: Arc<TraceStore>,
    trace_id: String,
    inner: Arc<dyn ToolExecutor>,
    purpose: Purpose,
}

impl ToolRecorder {
    pub fn new(store: Arc<TraceStore>, trace_id: impl Into<String>, inner: Arc<dyn ToolExecutor>) -> Self {
        Self {
            store,
            trace_id: trace_id.into(),
            inner,
            purpose: Purpose::Execution,
        }
    }

    pub fn for_verification(mut self) -> Self {
        self.purpose = Purpose::Verification;
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Evidence & digest synthesis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn evidence_for(tool: &str, args: &Value, hash: &str, outcome: &ToolOutcome) -> Vec<EvidenceRef> {
    let path = args.get("path").and_then(Value::as_str);
    match tool {
        "fs:read" | "fs:list" => path
            .map(|p| {
                vec![EvidenceRef::File {
                    path: p.to_owned(),
                    content_hash: None,
                }]
            })
            .unwrap_or_default(),
        "fs:write" | "fs:edit" | "fs:delete" => path
            .map(|p| {
                // For writes the full new content travels in the args.
                let content_hash = args
                    .get("content")
                    .and_then(Value::as_str)
                    .map(|c| sha256_hex(c.as_bytes()));
                vec![EvidenceRef::File {
                    path: p.to_owned(),
                    content_hash,
                }]
            })
            .unwrap_or_default(),
        "shell:exec" => {
            let command = args.get("command").and_then(Value::as_str).unwrap_or("");
            let exit_code = outcome
                .output
                .as_ref()
                .and_then(|o| o.get("exit_code"))
                .and_then(Value::as_i64)
                .map(|c| c as i32);
            vec![EvidenceRef::Log {
                reference: format!("shell:{command}"),
                exit_code,
            }]
        }
        other => vec![EvidenceRef::Receipt {
            tool: other.to_owned(),
            args_hash: hash.to_owned(),
        }],
    }
}

fn digest_for(tool: &str, outcome: &ToolOutcome) -> Digest {
    let mut digest = Digest::default();
    if !outcome.success {
        digest.event("failed");
        digest.count("errors");
        return digest;
    }
    match tool {
        "fs:read" => digest.event("file_read"),
        "fs:list" => digest.event("dir_listed"),
        "fs:write" => {
            digest.event("file_created");
            digest.count("files_written");
        }
        "fs:edit" => {
            digest.event("file_edited");
            digest.count("files_written");
        }
        "fs:delete" => digest.event("file_deleted"),
        "shell:exec" => {
            digest.event("command_executed");
            digest.count("commands_executed");
        }
        _ => digest.event("tool_completed"),
    }
    if outcome
        .metadata
        .as_ref()
        .and_then(|m| m.get("from_cache"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        digest.event("from_cache");
    }
    digest
}

fn status_for(outcome: &ToolOutcome) -> InvocationStatus {
    if outcome.success {
        return InvocationStatus::Success;
    }
    match outcome.error.as_ref().map(|e| e.code.as_str()) {
        Some("timeout") => InvocationStatus::Timeout,
        Some("unknown_tool") | Some("invalid_args") => InvocationStatus::Error,
        _ => InvocationStatus::Failed,
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ToolRecorder {
    async fn execute(&self, name: &str, input: &Value, cancel: &CancelToken) -> ToolOutcome {
        let hash = args_hash(input);
        let invocation = ToolInvocation {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            tool: name.to_owned(),
            args_hash: hash.clone(),
            args: input.clone(),
            timestamp: Utc::now(),
            purpose: self.purpose,
            status: InvocationStatus::Success, // placeholder until finalized
            output: None,
            duration_ms: None,
            error: None,
            evidence_refs: Vec::new(),
            digest: Digest::default(),
        };
        if let Err(e) = self.store.append(&self.trace_id, invocation) {
            tracing::warn!(error = %e, tool = name, "failed to append trace invocation");
        }

        let started = Instant::now();
        let outcome = self.inner.execute(name, input, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let evidence = evidence_for(name, input, &hash, &outcome);
        let digest = digest_for(name, &outcome);
        let status = status_for(&outcome);
        let error = outcome.error.as_ref().map(|e| e.message.clone());
        let output = outcome.output.clone();

        if let Err(e) = self.store.finalize_last(&self.trace_id, move |inv| {
            inv.status = status;
            inv.output = output;
            inv.duration_ms = Some(duration_ms);
            inv.error = error;
            inv.evidence_refs = evidence;
            inv.digest = digest;
        }) {
            tracing::warn!(error = %e, tool = name, "failed to finalize trace invocation");
        }

        outcome
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.inner.definitions()
    }
}
