//! End-to-end scenarios through the orchestrator and worker stack,
//! driven by scripted LLM clients.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use fm_domain::cancel::CancelToken;
use fm_domain::config::{IterationConfig, MiddlewareToggles, OrchestratorConfig, ToolsConfig};
use fm_domain::llm::Tier;
use fm_domain::message::{Role, ToolCall};
use fm_domain::outcome::{FailureKind, SpecialistOutcome};
use fm_providers::{ChatRequest, ChatResponse, LlmClient, ScriptedClient, TierRegistry};
use fm_runtime::bus::EventBus;
use fm_runtime::orchestrator::{Orchestrator, OrchestratorDeps};
use fm_runtime::verifier::Verifier;
use fm_runtime::worker::{Worker, WorkerConfig};
use fm_tools::registry::ReportTool;
use fm_tools::{ToolRegistry, TOOL_REPORT};
use fm_trace::TraceStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keyed client: deterministic scripting under concurrency
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routes each request to a response queue keyed by a substring of the
/// conversation, so concurrent workers cannot race on a shared script.
struct KeyedClient {
    rules: Mutex<HashMap<String, Vec<ChatResponse>>>,
}

impl KeyedClient {
    fn new(rules: Vec<(&str, Vec<ChatResponse>)>) -> Self {
        Self {
            rules: Mutex::new(
                rules
                    .into_iter()
                    .map(|(k, v)| (k.to_owned(), v))
                    .collect(),
            ),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for KeyedClient {
    async fn chat(&self, req: ChatRequest) -> fm_domain::Result<ChatResponse> {
        let text: String = req
            .messages
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect::<Vec<_>>()
            .join("\n");
        let mut rules = self.rules.lock();
        for (key, queue) in rules.iter_mut() {
            if text.contains(key.as_str()) && !queue.is_empty() {
                return Ok(queue.remove(0));
            }
        }
        Ok(ChatResponse::text("(keyed client: no matching rule)").with_usage(1, 1))
    }

    fn client_id(&self) -> &str {
        "keyed"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall { call_id: id.into(), tool_name: name.into(), arguments: args }
}

fn report(id: &str, answer: &str) -> ChatResponse {
    ChatResponse::tools(vec![tool_call(id, TOOL_REPORT, json!({"answer": answer}))]).with_usage(5, 3)
}

fn tools(dir: &Path) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::builtin(dir, &ToolsConfig::default());
    registry.register(Arc::new(ReportTool));
    Arc::new(registry)
}

fn deps_with(dir: &Path, registry: TierRegistry, max_retries: u32) -> Arc<OrchestratorDeps> {
    Arc::new(OrchestratorDeps {
        registry: Arc::new(registry),
        tools: tools(dir),
        trace_store: Arc::new(TraceStore::new(dir).unwrap()),
        bus: Arc::new(EventBus::new()),
        verifier: Arc::new(Verifier::new(dir)),
        history: None,
        kpi: None,
        workspace_root: dir.to_path_buf(),
        state_dir: dir.to_path_buf(),
        config: OrchestratorConfig {
            max_retries,
            backoff_base_ms: 1,
            max_parallel_workers: 4,
            ..Default::default()
        },
        iteration_config: IterationConfig::default(),
        middleware_toggles: MiddlewareToggles { reflection: false, ..Default::default() },
        extra_middlewares: Vec::new(),
    })
}

fn orchestrator(deps: &Arc<OrchestratorDeps>) -> Orchestrator {
    Orchestrator::new(deps.clone(), "run-1", "sess-1", CancelToken::new())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: happy single-tool run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_single_tool_run() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("X"), "hello").unwrap();

    let mut registry = TierRegistry::new();
    registry.register(
        Tier::Small,
        Arc::new(ScriptedClient::new(
            "small",
            vec![
                ChatResponse::text(
                    r#"[{"id": "t1", "description": "read file X and report what it contains", "agent_id": "reader"}]"#,
                ),
                ChatResponse::tools(vec![tool_call("c1", "fs:read", json!({"path": "X"}))])
                    .with_usage(10, 5),
                report("c2", "X contains: hello"),
            ],
        )),
    );
    let deps = deps_with(dir.path(), registry, 1);
    let result = orchestrator(&deps).execute("read X").await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.answer, "X contains: hello");
    assert_eq!(result.plan.len(), 1);
    assert_eq!(result.delegated_results.len(), 1);

    // The trace holds both invocations, and verification passed.
    let output = result.delegated_results[0].outcome.output().unwrap();
    let trace = deps.trace_store.load(&output.trace_ref).unwrap();
    assert_eq!(trace.invocations.len(), 2);
    assert_eq!(trace.invocations[0].tool, "fs:read");
    assert_eq!(trace.invocations[1].tool, TOOL_REPORT);
    assert!(output.claims.is_empty());

    let events = deps.bus.buffer("run-1");
    let verification = events
        .iter()
        .find(|e| e.kind.type_name() == "verification:complete")
        .expect("verification event");
    match &verification.kind {
        fm_domain::event::EventKind::VerificationComplete { valid, level, .. } => {
            assert!(valid);
            assert_eq!(*level, 3);
        }
        _ => unreachable!(),
    }

    // Events are strictly ordered by seq.
    for pair in events.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: verification catches a hallucinated file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn verification_catches_hallucinated_file() {
    let dir = tempfile::tempdir().unwrap();

    let hallucinated = json!({
        "answer": "wrote out.txt",
        "claims": [{"type": "file-write", "file_path": "out.txt", "content_hash": "abc"}]
    });
    let small = Arc::new(ScriptedClient::new(
        "small",
        vec![
            ChatResponse::text(
                r#"[{"id": "t1", "description": "write the output file", "agent_id": "writer"}]"#,
            ),
            // First attempt claims a file that was never written.
            ChatResponse::tools(vec![tool_call("c1", TOOL_REPORT, hallucinated.clone())]),
            // The retry (with the verification note) repeats the lie.
            ChatResponse::tools(vec![tool_call("c2", TOOL_REPORT, hallucinated)]),
        ],
    ));
    let mut registry = TierRegistry::new();
    registry.register(Tier::Small, small.clone());

    let deps = deps_with(dir.path(), registry, 1);
    let result = orchestrator(&deps).execute("write the output file").await;

    assert!(!result.success);
    let delegated = &result.delegated_results[0];
    assert!(!delegated.success);
    assert!(delegated.error.as_deref().unwrap().contains("validation_failed"));
    match &delegated.outcome {
        SpecialistOutcome::Failure { report, partial, .. } => {
            assert_eq!(report.kind, FailureKind::ValidationFailed);
            assert!(report.message.contains("File does not exist"));
            assert!(partial.is_some());
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // The retry prompt carried the verification errors.
    let retry_request = small.request(2).expect("retry request");
    let retry_text: String = retry_request
        .messages
        .iter()
        .map(|m| m.content.extract_all_text())
        .collect();
    assert!(retry_text.contains("failed output verification"));
    assert!(retry_text.contains("File does not exist"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: budget soft nudge then hard stop with forced synthesis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn budget_soft_then_hard_with_forced_synthesis() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x"), "data").unwrap();

    let llm = Arc::new(ScriptedClient::new(
        "small",
        vec![
            // Iteration 1: 820 of 1000 tokens (over the 0.8 soft ratio).
            ChatResponse::tools(vec![tool_call("c1", "fs:read", json!({"path": "x"}))])
                .with_usage(620, 200),
            // Iteration 2 (nudged): another 200, crossing the hard limit.
            ChatResponse::tools(vec![tool_call("c2", "fs:read", json!({"path": "x", "offset": 0})) ])
                .with_usage(150, 50),
            // Forced synthesis.
            ChatResponse::text("best-effort summary").with_usage(10, 5),
        ],
    ));

    let worker = Worker {
        llm: llm.clone(),
        secondary_llm: None,
        tools: tools(dir.path()),
        trace_store: Arc::new(TraceStore::new(dir.path()).unwrap()),
        bus: Arc::new(EventBus::new()),
        cancel: CancelToken::new(),
        iteration_config: IterationConfig {
            max_tokens: 1000,
            soft_limit_ratio: 0.8,
            hard_limit_ratio: 1.0,
            force_synthesis_on_hard_limit: true,
            ..Default::default()
        },
        middleware_toggles: MiddlewareToggles { reflection: false, ..Default::default() },
        state_dir: dir.path().to_path_buf(),
        history: None,
        workspace_root: dir.path().to_path_buf(),
        extra_middlewares: Vec::new(),
        run_id: "run-b".into(),
        session_id: "sess-b".into(),
        parent_agent_id: None,
    };

    let outcome = worker
        .execute("summarize x", &WorkerConfig::new("budgeted", Tier::Small))
        .await;

    // Exactly one convergence nudge was injected, in the second call.
    let count_nudges = |req: &ChatRequest| {
        req.messages
            .iter()
            .filter(|m| {
                m.role == Role::System
                    && m.content.extract_all_text().contains("approaching the token budget")
            })
            .count()
    };
    assert_eq!(count_nudges(&llm.request(0).unwrap()), 0);
    assert_eq!(count_nudges(&llm.request(1).unwrap()), 1);
    assert_eq!(count_nudges(&llm.request(2).unwrap()), 0);

    // The hard stop forced one synthesis call whose output is the summary.
    let output = outcome.output().expect("forced synthesis output");
    assert_eq!(output.summary, "best-effort summary");
    let events = worker.bus.buffer("run-b");
    assert!(events.iter().any(|e| e.kind.type_name() == "synthesis:forced"));
    assert!(events.iter().any(|e| e.kind.type_name() == "synthesis:complete"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: loop detected, then tier escalation succeeds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn loop_detection_escalates_to_next_tier() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x"), "a").unwrap();

    // Small tier spins on the same call; medium finishes cleanly.
    let spin: Vec<ChatResponse> = std::iter::once(ChatResponse::text(
        r#"[{"id": "t1", "description": "investigate the repository", "agent_id": "digger"}]"#,
    ))
    .chain((0..8).map(|_| {
        ChatResponse::tools(vec![tool_call("c", "fs:read", json!({"path": "x"}))]).with_usage(5, 2)
    }))
    .collect();

    let mut registry = TierRegistry::new();
    registry.register(Tier::Small, Arc::new(ScriptedClient::new("small", spin)));
    registry.register(
        Tier::Medium,
        Arc::new(ScriptedClient::new("medium", vec![report("c9", "found it at tier two")])),
    );

    let deps = deps_with(dir.path(), registry, 2);
    let result = orchestrator(&deps).execute("investigate the repository").await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.answer, "found it at tier two");

    // Both tiers ran: a subtask start at small, success end at medium.
    let events = deps.bus.buffer("run-1");
    let starts: Vec<&fm_domain::event::AgentEvent> = events
        .iter()
        .filter(|e| e.kind.type_name() == "agent:start")
        .collect();
    assert!(starts.len() >= 2, "expected a retry after loop detection");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: parallel subtasks with a failed dependency
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn dependency_failure_skips_dependents() {
    let dir = tempfile::tempdir().unwrap();

    // A reports a hallucinated file-write; with max_retries = 0 that
    // verification failure is terminal. B succeeds. C depends on A.
    let hallucinated = json!({
        "answer": "A pretends",
        "claims": [{"type": "file-write", "file_path": "ghost.txt", "content_hash": "nope"}]
    });
    let keyed = KeyedClient::new(vec![
        (
            "subtask-a-body",
            vec![ChatResponse::tools(vec![tool_call("ca", TOOL_REPORT, hallucinated)])],
        ),
        ("subtask-b-body", vec![report("cb", "B done")]),
        ("subtask-c-body", vec![report("cc", "C done")]),
    ]);

    let mut registry = TierRegistry::new();
    registry.register(Tier::Small, Arc::new(keyed));

    let deps = deps_with(dir.path(), registry, 0);
    let orchestrator = orchestrator(&deps);

    let subtask = |id: &str, body: &str, deps: &[&str]| fm_domain::outcome::SubTask {
        id: id.into(),
        description: body.into(),
        agent_id: format!("w-{id}"),
        priority: 1,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        estimated_complexity: 0.5,
    };
    let plan = vec![
        subtask("A", "subtask-a-body", &[]),
        subtask("B", "subtask-b-body", &[]),
        subtask("C", "subtask-c-body", &["A"]),
    ];

    let results = orchestrator.delegate(&plan).await;
    assert_eq!(results.len(), 3);

    let by_id: HashMap<&str, &fm_domain::outcome::DelegatedResult> =
        results.iter().map(|r| (r.subtask_id.as_str(), r)).collect();

    assert!(!by_id["A"].success);
    assert!(by_id["B"].success);
    assert!(!by_id["C"].success);
    assert!(by_id["C"].error.as_deref().unwrap().contains("skipped"));

    // A counted failed, B succeeded, C skipped: one completion.
    let completed = results.iter().filter(|r| r.success).count();
    assert_eq!(completed, 1);
}
