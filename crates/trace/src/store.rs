//! Trace store — in-memory map of live traces plus NDJSON persistence.
//!
//! Each trace gets a `<traceId>.ndjsonl` file under the traces directory:
//! a header line with the trace metadata, one line per finalized
//! invocation, and a footer line stamping `completed_at`. Readers (the
//! verifier) access a trace only after `complete`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use fm_domain::{Error, Result};

use crate::invocation::{ToolInvocation, ToolTrace};
use crate::parse_trace_ref;

#[derive(Debug, Serialize, Deserialize)]
struct HeaderLine {
    trace_id: String,
    session_id: String,
    specialist_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FooterLine {
    completed_at: DateTime<Utc>,
}

pub struct TraceStore {
    dir: PathBuf,
    traces: RwLock<HashMap<String, ToolTrace>>,
}

impl TraceStore {
    pub fn new(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("traces");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            traces: RwLock::new(HashMap::new()),
        })
    }

    fn path_for(&self, trace_id: &str) -> PathBuf {
        self.dir.join(format!("{trace_id}.ndjsonl"))
    }

    fn append_line<T: Serialize>(&self, trace_id: &str, line: &T) -> Result<()> {
        let json = serde_json::to_string(line)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(trace_id))?;
        writeln!(file, "{json}")?;
        Ok(())
    }

    /// Open a new trace for a specialist. Returns the trace id.
    pub fn create(&self, session_id: &str, specialist_id: &str) -> Result<String> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let trace = ToolTrace {
            trace_id: trace_id.clone(),
            session_id: session_id.to_owned(),
            specialist_id: specialist_id.to_owned(),
            invocations: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.append_line(
            &trace_id,
            &HeaderLine {
                trace_id: trace_id.clone(),
                session_id: trace.session_id.clone(),
                specialist_id: trace.specialist_id.clone(),
                created_at: trace.created_at,
            },
        )?;
        self.traces.write().insert(trace_id.clone(), trace);
        Ok(trace_id)
    }

    /// Append an invocation (typically a pre-execution placeholder).
    /// Appending to a completed or unknown trace is an error.
    pub fn append(&self, trace_id: &str, invocation: ToolInvocation) -> Result<()> {
        let mut traces = self.traces.write();
        let trace = traces
            .get_mut(trace_id)
            .ok_or_else(|| Error::Trace(format!("unknown trace {trace_id}")))?;
        if trace.is_completed() {
            return Err(Error::Trace(format!("trace {trace_id} is already completed")));
        }
        trace.invocations.push(invocation);
        Ok(())
    }

    /// Mutate the most recent invocation in place (the recorder's
    /// post-execution update), then persist the finalized line.
    pub fn finalize_last<F>(&self, trace_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ToolInvocation),
    {
        let finalized = {
            let mut traces = self.traces.write();
            let trace = traces
                .get_mut(trace_id)
                .ok_or_else(|| Error::Trace(format!("unknown trace {trace_id}")))?;
            if trace.is_completed() {
                return Err(Error::Trace(format!("trace {trace_id} is already completed")));
            }
            let last = trace
                .invocations
                .last_mut()
                .ok_or_else(|| Error::Trace(format!("trace {trace_id} has no invocations")))?;
            f(last);
            last.clone()
        };
        self.append_line(trace_id, &finalized)
    }

    /// Mark the trace complete. Further appends fail.
    pub fn complete(&self, trace_id: &str) -> Result<ToolTrace> {
        let completed_at = Utc::now();
        let trace = {
            let mut traces = self.traces.write();
            let trace = traces
                .get_mut(trace_id)
                .ok_or_else(|| Error::Trace(format!("unknown trace {trace_id}")))?;
            trace.completed_at = Some(completed_at);
            trace.clone()
        };
        self.append_line(trace_id, &FooterLine { completed_at })?;
        Ok(trace)
    }

    /// Load a trace by its opaque reference (`trace:<id>`) or bare id.
    /// Prefers the in-memory copy, reconstructing from disk otherwise.
    pub fn load(&self, reference: &str) -> Result<ToolTrace> {
        let trace_id = parse_trace_ref(reference).unwrap_or(reference);
        if let Some(trace) = self.traces.read().get(trace_id) {
            return Ok(trace.clone());
        }
        self.load_from_disk(trace_id)
    }

    fn load_from_disk(&self, trace_id: &str) -> Result<ToolTrace> {
        let path = self.path_for(trace_id);
        let raw = std::fs::read_to_string(&path)
            .map_err(|_| Error::Trace(format!("unknown trace {trace_id}")))?;
        let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

        let header: HeaderLine = lines
            .next()
            .ok_or_else(|| Error::Trace(format!("trace file {trace_id} is empty")))
            .and_then(|l| serde_json::from_str(l).map_err(Error::from))?;

        let mut trace = ToolTrace {
            trace_id: header.trace_id,
            session_id: header.session_id,
            specialist_id: header.specialist_id,
            invocations: Vec::new(),
            created_at: header.created_at,
            completed_at: None,
        };
        for line in lines {
            if let Ok(invocation) = serde_json::from_str::<ToolInvocation>(line) {
                trace.invocations.push(invocation);
            } else if let Ok(footer) = serde_json::from_str::<FooterLine>(line) {
                trace.completed_at = Some(footer.completed_at);
            } else {
                tracing::warn!(trace_id = %trace.trace_id, "skipping malformed trace line");
            }
        }
        Ok(trace)
    }

    pub fn delete(&self, trace_id: &str) -> Result<()> {
        self.traces.write().remove(trace_id);
        let path = self.path_for(trace_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All in-memory traces belonging to a session.
    pub fn by_session(&self, session_id: &str) -> Vec<ToolTrace> {
        self.traces
            .read()
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{InvocationStatus, Purpose};
    use crate::{args_hash, trace_ref};
    use serde_json::json;

    fn invocation(tool: &str, args: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            tool: tool.into(),
            args_hash: args_hash(&args),
            args,
            timestamp: Utc::now(),
            purpose: Purpose::Execution,
            status: InvocationStatus::Success,
            output: None,
            duration_ms: None,
            error: None,
            evidence_refs: Vec::new(),
            digest: Default::default(),
        }
    }

    #[test]
    fn append_then_load_by_ref_preserves_args_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let trace_id = store.create("s1", "worker-1").unwrap();

        let args = json!({"path": "x"});
        let expected_hash = args_hash(&args);
        store.append(&trace_id, invocation("fs:read", args)).unwrap();
        store.finalize_last(&trace_id, |inv| {
            inv.output = Some(json!("hello"));
            inv.duration_ms = Some(3);
        }).unwrap();

        let loaded = store.load(&trace_ref(&trace_id)).unwrap();
        assert_eq!(loaded.invocations.len(), 1);
        assert_eq!(loaded.invocations[0].args_hash, expected_hash);
    }

    #[test]
    fn append_after_complete_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let trace_id = store.create("s1", "w").unwrap();
        store.complete(&trace_id).unwrap();

        let err = store.append(&trace_id, invocation("fs:read", json!({}))).unwrap_err();
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn reconstructs_from_disk_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let trace_id;
        {
            let store = TraceStore::new(dir.path()).unwrap();
            trace_id = store.create("s1", "w").unwrap();
            store.append(&trace_id, invocation("shell:exec", json!({"command": "ls"}))).unwrap();
            store.finalize_last(&trace_id, |inv| {
                inv.duration_ms = Some(10);
            }).unwrap();
            store.complete(&trace_id).unwrap();
        }

        // Fresh store: nothing in memory, must come from the NDJSON file.
        let store = TraceStore::new(dir.path()).unwrap();
        let loaded = store.load(&trace_id).unwrap();
        assert_eq!(loaded.specialist_id, "w");
        assert_eq!(loaded.invocations.len(), 1);
        assert!(loaded.is_completed());
    }

    #[test]
    fn by_session_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        store.create("s1", "a").unwrap();
        store.create("s1", "b").unwrap();
        store.create("s2", "c").unwrap();
        assert_eq!(store.by_session("s1").len(), 2);
        assert_eq!(store.by_session("s2").len(), 1);
    }

    #[test]
    fn delete_removes_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path()).unwrap();
        let trace_id = store.create("s1", "w").unwrap();
        store.delete(&trace_id).unwrap();
        assert!(store.load(&trace_id).is_err());
    }
}
