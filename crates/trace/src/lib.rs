//! Tool trace store and recorder.
//!
//! Every tool invocation a worker makes is appended to an append-only
//! trace. The trace is the ground truth the output verifier checks
//! claims against; outputs reference it by the opaque form
//! `trace:<traceId>`.

pub mod canonical;
pub mod invocation;
pub mod recorder;
pub mod store;

pub use canonical::{args_hash, canonical_json, sha256_hex};
pub use invocation::{Digest, EvidenceRef, InvocationStatus, Purpose, ToolInvocation, ToolTrace};
pub use recorder::ToolRecorder;
pub use store::TraceStore;

/// Prefix of trace references embedded in specialist outputs.
pub const TRACE_REF_PREFIX: &str = "trace:";

/// Build the opaque reference form for a trace id.
pub fn trace_ref(trace_id: &str) -> String {
    format!("{TRACE_REF_PREFIX}{trace_id}")
}

/// Strip the `trace:` prefix, if present.
pub fn parse_trace_ref(reference: &str) -> Option<&str> {
    reference.strip_prefix(TRACE_REF_PREFIX)
}
