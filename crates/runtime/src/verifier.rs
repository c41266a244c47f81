//! Output verifier — three sequential levels over a specialist output,
//! plus the cross-tier answer review and verification metrics.
//!
//! 1. Structural: required fields, types, artifact bounds.
//! 2. Plugin schema (opt-in): tool outputs against declared schemas.
//! 3. Filesystem: claims checked against the real tree under a base
//!    path, grounded by hashes and anchors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fm_domain::claim::{Anchor, Claim, SpecialistOutput};
use fm_domain::message::Message;
use fm_domain::{Error, Result};
use fm_providers::{ChatRequest, LlmClient};
use fm_trace::{sha256_hex, EvidenceRef, ToolTrace, TRACE_REF_PREFIX};

/// Artifact content bound (bytes).
const MAX_ARTIFACT_BYTES: usize = 1024;
/// Bounded metrics ring.
const METRICS_CAP: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    /// The level that failed, or 3 when everything passed.
    pub level: u8,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_claims: Vec<Claim>,
}

impl VerificationResult {
    fn pass() -> Self {
        Self { valid: true, level: 3, errors: Vec::new(), failed_claims: Vec::new() }
    }
}

/// Scores from the cross-tier answer review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossTierReview {
    pub confidence: f64,
    pub completeness: f64,
    pub gaps: Vec<String>,
    /// Entities mentioned in the answer with no supporting trace
    /// evidence.
    pub unverified_mentions: Vec<String>,
}

impl Default for CrossTierReview {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            completeness: 0.5,
            gaps: Vec::new(),
            unverified_mentions: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Level 1 — structural
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn verify_structural(output: &SpecialistOutput) -> Vec<String> {
    let mut errors = Vec::new();
    if output.summary.trim().is_empty() {
        errors.push("missing_field: summary is empty".to_owned());
    }
    if !output.trace_ref.starts_with(TRACE_REF_PREFIX) {
        errors.push(format!(
            "invalid_type: trace_ref must start with '{TRACE_REF_PREFIX}' (got '{}')",
            output.trace_ref
        ));
    }
    for artifact in &output.artifacts {
        if artifact.name.trim().is_empty() {
            errors.push("missing_field: artifact without a name".to_owned());
        }
        if artifact.content.len() > MAX_ARTIFACT_BYTES {
            errors.push(format!(
                "invalid_type: artifact '{}' exceeds {MAX_ARTIFACT_BYTES} bytes",
                artifact.name
            ));
        }
    }
    errors
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Level 2 — plugin output schemas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Minimal JSON-schema check: `type`, `required`, `properties`, `items`.
fn schema_check(value: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let actual = match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        };
        let matches = expected == actual || (expected == "number" && actual == "integer");
        if !matches {
            errors.push(format!("schema_mismatch: {path} expected {expected}, got {actual}"));
            return;
        }
    }
    if let (Some(object), Some(required)) = (value.as_object(), schema.get("required").and_then(Value::as_array)) {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                errors.push(format!("schema_mismatch: {path}.{key} is required"));
            }
        }
    }
    if let (Some(object), Some(properties)) = (value.as_object(), schema.get("properties").and_then(Value::as_object)) {
        for (key, sub_schema) in properties {
            if let Some(sub_value) = object.get(key) {
                schema_check(sub_value, sub_schema, &format!("{path}.{key}"), errors);
            }
        }
    }
    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            schema_check(item, item_schema, &format!("{path}[{i}]"), errors);
        }
    }
}

fn verify_schemas(trace: &ToolTrace, schemas: &HashMap<String, Value>) -> Vec<String> {
    let mut errors = Vec::new();
    for invocation in &trace.invocations {
        let Some(schema) = schemas.get(&invocation.tool) else {
            continue;
        };
        let Some(output) = &invocation.output else {
            continue;
        };
        schema_check(output, schema, &invocation.tool, &mut errors);
    }
    errors
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Level 3 — filesystem state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn check_anchor(path: &Path, file_path: &str, anchor: &Anchor, kind: &str) -> Option<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return Some(format!("file_not_found: {kind}: {file_path} does not exist")),
    };
    let before_hit = !anchor.before_snippet.is_empty() && content.contains(&anchor.before_snippet);
    let after_hit = !anchor.after_snippet.is_empty() && content.contains(&anchor.after_snippet);
    if before_hit || after_hit {
        None
    } else {
        Some(format!("anchor_mismatch: {kind}: no anchor snippet found in {file_path}"))
    }
}

fn verify_claim(claim: &Claim, base: &Path) -> Option<String> {
    match claim {
        Claim::FileWrite { file_path, content_hash } => {
            let path = base.join(file_path);
            match std::fs::read(&path) {
                Ok(bytes) => {
                    let actual = sha256_hex(&bytes);
                    if &actual == content_hash {
                        None
                    } else {
                        Some(format!(
                            "hash_mismatch: file-write: {file_path} content hash {actual} != {content_hash}"
                        ))
                    }
                }
                Err(_) => Some(format!("file_not_found: file-write: File does not exist: {file_path}")),
            }
        }
        Claim::FileEdit { file_path, anchor, .. } => {
            check_anchor(&base.join(file_path), file_path, anchor, "file-edit")
        }
        Claim::CodeInserted { file_path, anchor } => {
            check_anchor(&base.join(file_path), file_path, anchor, "code-inserted")
        }
        Claim::FileDelete { file_path } => {
            if base.join(file_path).exists() {
                Some(format!("filesystem_mismatch: file-delete: {file_path} still exists"))
            } else {
                None
            }
        }
        // No retroactive verification for executed commands.
        Claim::CommandExecuted { .. } => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metrics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct VerificationMetric {
    pub valid: bool,
    pub level: u8,
    pub duration_ms: u64,
    pub error_categories: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSummary {
    pub total: usize,
    pub pass_rate: f64,
    pub avg_duration_ms: f64,
    pub category_counts: HashMap<String, u64>,
}

fn error_category(error: &str) -> String {
    error.split(':').next().unwrap_or("unknown").trim().to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Verifier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Verifier {
    base_path: PathBuf,
    /// Tool name → declared output schema (level 2, opt-in).
    schemas: HashMap<String, Value>,
    metrics: Mutex<std::collections::VecDeque<VerificationMetric>>,
}

impl Verifier {
    pub fn new(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            schemas: HashMap::new(),
            metrics: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn with_schema(mut self, tool: impl Into<String>, schema: Value) -> Self {
        self.schemas.insert(tool.into(), schema);
        self
    }

    /// Run the three levels sequentially; the first failing level wins.
    pub fn verify(&self, output: &SpecialistOutput, trace: &ToolTrace) -> VerificationResult {
        let started = Instant::now();
        let result = self.verify_inner(output, trace);
        self.record(&result, started.elapsed().as_millis() as u64);
        result
    }

    fn verify_inner(&self, output: &SpecialistOutput, trace: &ToolTrace) -> VerificationResult {
        let structural = verify_structural(output);
        if !structural.is_empty() {
            return VerificationResult {
                valid: false,
                level: 1,
                errors: structural,
                failed_claims: Vec::new(),
            };
        }

        if !self.schemas.is_empty() {
            let schema_errors = verify_schemas(trace, &self.schemas);
            if !schema_errors.is_empty() {
                return VerificationResult {
                    valid: false,
                    level: 2,
                    errors: schema_errors,
                    failed_claims: Vec::new(),
                };
            }
        }

        let mut errors = Vec::new();
        let mut failed_claims = Vec::new();
        for claim in &output.claims {
            if let Some(error) = verify_claim(claim, &self.base_path) {
                errors.push(error);
                failed_claims.push(claim.clone());
            }
        }
        if !errors.is_empty() {
            return VerificationResult { valid: false, level: 3, errors, failed_claims };
        }
        VerificationResult::pass()
    }

    fn record(&self, result: &VerificationResult, duration_ms: u64) {
        let metric = VerificationMetric {
            valid: result.valid,
            level: result.level,
            duration_ms,
            error_categories: result.errors.iter().map(|e| error_category(e)).collect(),
        };
        let mut metrics = self.metrics.lock();
        metrics.push_back(metric);
        if metrics.len() > METRICS_CAP {
            metrics.pop_front();
        }
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        let metrics = self.metrics.lock();
        if metrics.is_empty() {
            return MetricsSummary::default();
        }
        let total = metrics.len();
        let passed = metrics.iter().filter(|m| m.valid).count();
        let avg = metrics.iter().map(|m| m.duration_ms).sum::<u64>() as f64 / total as f64;
        let mut categories: HashMap<String, u64> = HashMap::new();
        for metric in metrics.iter() {
            for category in &metric.error_categories {
                *categories.entry(category.clone()).or_insert(0) += 1;
            }
        }
        MetricsSummary {
            total,
            pass_rate: passed as f64 / total as f64,
            avg_duration_ms: avg,
            category_counts: categories,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cross-tier review
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Collect the entity names the trace can vouch for.
fn trace_evidence_terms(trace: &ToolTrace) -> Vec<String> {
    let mut terms = Vec::new();
    for invocation in &trace.invocations {
        for evidence in &invocation.evidence_refs {
            match evidence {
                EvidenceRef::File { path, .. } => terms.push(path.clone()),
                EvidenceRef::Log { reference, .. } => terms.push(reference.clone()),
                EvidenceRef::Receipt { tool, .. } => terms.push(tool.clone()),
            }
        }
    }
    terms
}

fn mention_pattern() -> &'static regex::Regex {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"[A-Za-z0-9_./-]+\.[A-Za-z0-9]{1,8}").expect("valid mention pattern")
    })
}

/// Heuristic fallback: path-shaped tokens in the answer with no trace
/// evidence backing them.
fn unverified_mentions(answer: &str, trace: &ToolTrace) -> Vec<String> {
    let evidence = trace_evidence_terms(trace);
    let pattern = mention_pattern();
    let mut mentions: Vec<String> = Vec::new();
    for token in pattern.find_iter(answer) {
        let token = token.as_str().trim_matches('.');
        if token.is_empty() || !token.contains('.') {
            continue;
        }
        let confirmed = evidence.iter().any(|term| term.contains(token) || token.contains(term.as_str()));
        if !confirmed && !mentions.iter().any(|m| m == token) {
            mentions.push(token.to_owned());
        }
    }
    mentions
}

/// Score the synthesized answer with an LLM one tier above the
/// executor; fall back to heuristics when the call or parse fails.
pub async fn cross_tier_review(
    llm: Arc<dyn LlmClient>,
    answer: &str,
    trace: &ToolTrace,
) -> CrossTierReview {
    let evidence = trace_evidence_terms(trace).join("\n");
    let request = ChatRequest {
        messages: vec![
            Message::system(
                "You audit an agent's answer against its tool evidence. Respond with JSON only: {\"confidence\": 0..1, \"completeness\": 0..1, \"gaps\": [..], \"unverified_mentions\": [..]} where unverified_mentions lists files, packages, or classes the answer names but the evidence does not contain.",
            ),
            Message::user(format!("Answer:\n{answer}\n\nEvidence:\n{evidence}")),
        ],
        ..Default::default()
    };

    let fallback = || CrossTierReview {
        unverified_mentions: unverified_mentions(answer, trace),
        ..Default::default()
    };

    match llm.chat(request).await {
        Ok(response) => parse_review(&response.content).unwrap_or_else(|_| fallback()),
        Err(e) => {
            tracing::warn!(error = %e, "cross-tier review call failed");
            fallback()
        }
    }
}

fn parse_review(content: &str) -> Result<CrossTierReview> {
    // Tolerate answers wrapped in code fences or prose.
    let start = content.find('{').ok_or_else(|| Error::Other("no JSON object".into()))?;
    let end = content.rfind('}').ok_or_else(|| Error::Other("no JSON object".into()))?;
    let parsed: Value = serde_json::from_str(&content[start..=end])?;
    Ok(CrossTierReview {
        confidence: parsed["confidence"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0),
        completeness: parsed["completeness"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0),
        gaps: parsed["gaps"]
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default(),
        unverified_mentions: parsed["unverified_mentions"]
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KPI baseline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-scoped verification pass-rate baseline, persisted per
/// workspace. Injected as an explicit service; tests call `reset`.
pub struct KpiStore {
    path: PathBuf,
    map: Mutex<HashMap<String, f64>>,
}

impl KpiStore {
    pub fn new(state_dir: &Path) -> Self {
        let path = state_dir.join("kpi-baseline.json");
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, map: Mutex::new(map) }
    }

    pub fn baseline_key(workspace_root: &Path) -> String {
        format!("{}::agent", workspace_root.display())
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.map.lock().get(key).copied()
    }

    /// Exponential moving average of the pass rate.
    pub fn record(&self, key: &str, pass_rate: f64) {
        let mut map = self.map.lock();
        let baseline = map.entry(key.to_owned()).or_insert(pass_rate);
        *baseline = 0.8 * *baseline + 0.2 * pass_rate;
        if let Ok(json) = serde_json::to_string_pretty(&*map) {
            let _ = std::fs::write(&self.path, json);
        }
    }

    pub fn reset(&self) {
        self.map.lock().clear();
        let _ = std::fs::remove_file(&self.path);
    }
}
