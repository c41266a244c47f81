//! Iteration loop — drives one worker's LLM⇄tool cycle.
//!
//! Stop conditions are evaluated in strict priority order; see
//! [`StopCode`]. The loop never retries on its own: an escalation
//! request is returned to the caller, and the orchestrator owns the
//! retry at a higher tier.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fm_domain::cancel::CancelToken;
use fm_domain::claim::Claim;
use fm_domain::event::EventKind;
use fm_domain::event::AgentEvent;
use fm_domain::llm::Usage;
use fm_domain::message::Message;
use fm_providers::{ChatRequest, LlmClient};
use fm_tools::{ToolExecutor, TOOL_REPORT};

use crate::bus::EventBus;
use crate::pipeline::{IterationAction, IterationCtx, LlmCall, Pipeline, ToolDecision};
use crate::truncate_str;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stop codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal reason of an iteration loop, ordered by priority (lower
/// wins when several trigger in the same iteration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCode {
    /// The report tool was called; stops even at iteration 1.
    ReportComplete,
    /// External cancellation observed.
    AbortSignal,
    /// Iteration budget exhausted (after any hook extensions).
    MaxIterations,
    /// Pre-call token budget check failed.
    HardTokenLimit,
    /// The loop detector tripped.
    LoopDetected,
    /// The LLM returned a final answer with no tool calls.
    NoToolCalls,
    /// Uncaught LLM/tool error, caught at the loop boundary.
    IterationError,
}

impl StopCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StopCode::ReportComplete => "report_complete",
            StopCode::AbortSignal => "abort_signal",
            StopCode::MaxIterations => "max_iterations",
            StopCode::HardTokenLimit => "hard_token_limit",
            StopCode::LoopDetected => "loop_detected",
            StopCode::NoToolCalls => "no_tool_calls",
            StopCode::IterationError => "iteration_error",
        }
    }

    /// Codes that leave the worker with a usable answer.
    pub fn is_success(self) -> bool {
        matches!(self, StopCode::ReportComplete | StopCode::NoToolCalls)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEnd {
    Stopped(StopCode),
    /// Returned to the caller; the loop itself never retries.
    Escalated(String),
}

#[derive(Debug)]
pub struct LoopResult {
    pub end: LoopEnd,
    pub answer: Option<String>,
    pub claims: Vec<Claim>,
    pub usage: Usage,
    pub iterations: u32,
    pub error: Option<String>,
}

impl LoopResult {
    pub fn stop_code(&self) -> Option<StopCode> {
        match self.end {
            LoopEnd::Stopped(code) => Some(code),
            LoopEnd::Escalated(_) => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct IterationLoop {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolExecutor>,
    pub pipeline: Pipeline,
    pub bus: Arc<EventBus>,
    pub cancel: CancelToken,
    pub temperature: Option<f32>,
    pub model: Option<String>,
    pub hard_limit_ratio: f64,
    pub force_synthesis_on_hard_limit: bool,
}

/// Internal control-flow verdict of one iteration.
enum Step {
    Continue,
    Stop(StopCode),
}

impl IterationLoop {
    fn emit(&self, ctx: &IterationCtx, kind: EventKind) {
        let mut event = AgentEvent::new(kind)
            .with_session(&ctx.session_id)
            .with_agent(&ctx.agent_id);
        if let Some(parent) = &ctx.parent_agent_id {
            event = event.with_parent(parent.clone());
        }
        if let Err(e) = self.bus.emit(&ctx.run_id, event) {
            tracing::warn!(error = %e, "event emission failed");
        }
    }

    fn hard_limit(&self, ctx: &IterationCtx) -> u64 {
        (ctx.max_tokens as f64 * self.hard_limit_ratio) as u64
    }

    /// Drive the loop to its terminal state.
    pub async fn run(&self, ctx: &mut IterationCtx) -> LoopResult {
        let mut usage = Usage::default();
        let mut answer: Option<String> = None;
        let mut claims: Vec<Claim> = Vec::new();
        let mut error: Option<String> = None;

        if let Err(e) = self.pipeline.on_start(ctx).await {
            return self.finish(
                ctx,
                LoopEnd::Stopped(StopCode::IterationError),
                None,
                Vec::new(),
                usage,
                Some(e.to_string()),
            )
            .await;
        }

        let end = loop {
            ctx.iteration += 1;

            // Priority 2: external cancellation.
            if self.cancel.is_cancelled() {
                break LoopEnd::Stopped(StopCode::AbortSignal);
            }

            // Step 1: before-iteration hooks; first non-continue wins.
            match self.pipeline.before_iteration(ctx).await {
                Ok(IterationAction::Continue) => {}
                Ok(IterationAction::Stop(code)) => {
                    if code == StopCode::HardTokenLimit {
                        answer = self.maybe_force_synthesis(ctx, &mut usage).await.or(answer);
                    }
                    break LoopEnd::Stopped(code);
                }
                Ok(IterationAction::Escalate(reason)) => break LoopEnd::Escalated(reason),
                Err(e) => {
                    error = Some(e.to_string());
                    break LoopEnd::Stopped(StopCode::IterationError);
                }
            }

            // Priority 3: iteration budget (hooks may have raised it).
            if ctx.iteration > ctx.max_iterations {
                break LoopEnd::Stopped(StopCode::MaxIterations);
            }

            // Step 2: pre-call token budget check.
            if ctx.max_tokens > 0 && ctx.total_tokens >= self.hard_limit(ctx) {
                answer = self.maybe_force_synthesis(ctx, &mut usage).await.or(answer);
                break LoopEnd::Stopped(StopCode::HardTokenLimit);
            }

            // Steps 3–8.
            match self
                .iteration_step(ctx, &mut usage, &mut answer, &mut claims, &mut error)
                .await
            {
                Step::Continue => {}
                Step::Stop(code) => break LoopEnd::Stopped(code),
            }

            // Step 10: after-iteration hooks.
            if let Err(e) = self.pipeline.after_iteration(ctx).await {
                error = Some(e.to_string());
                break LoopEnd::Stopped(StopCode::IterationError);
            }

            // Step 9: loop detection and escalation evaluation, surfaced
            // by the progress middleware through ctx.meta.
            if let Some(reason) = ctx.meta_take("escalate.reason") {
                let reason = reason.as_str().unwrap_or("escalation requested").to_owned();
                break LoopEnd::Escalated(reason);
            }
            let loop_detected = ctx
                .meta_get("progress")
                .and_then(|p| p.get("loop_detected"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if loop_detected {
                break LoopEnd::Stopped(StopCode::LoopDetected);
            }
        };

        self.finish(ctx, end, answer, claims, usage, error).await
    }

    async fn finish(
        &self,
        ctx: &mut IterationCtx,
        end: LoopEnd,
        answer: Option<String>,
        claims: Vec<Claim>,
        usage: Usage,
        error: Option<String>,
    ) -> LoopResult {
        // All post hooks fire regardless of how the loop ended.
        let reason = match &end {
            LoopEnd::Stopped(code) => code.as_str().to_owned(),
            LoopEnd::Escalated(reason) => format!("escalate: {reason}"),
        };
        self.pipeline.on_stop(ctx, reason_code(&end)).await;
        if matches!(end, LoopEnd::Stopped(code) if code.is_success()) {
            self.pipeline.on_complete(ctx).await;
        }
        tracing::debug!(run_id = %ctx.run_id, agent_id = %ctx.agent_id, reason, "iteration loop finished");

        LoopResult {
            end,
            answer,
            claims,
            usage,
            iterations: ctx.iteration,
            error,
        }
    }

    /// Steps 3–8 of one iteration.
    async fn iteration_step(
        &self,
        ctx: &mut IterationCtx,
        usage: &mut Usage,
        answer: &mut Option<String>,
        claims: &mut Vec<Claim>,
        error: &mut Option<String>,
    ) -> Step {
        // Step 3: build the call context and apply hook patches.
        let mut call = LlmCall {
            messages: ctx.messages.clone(),
            tools: self.tools.definitions(),
            temperature: self.temperature,
            model: self.model.clone(),
            max_tokens: None,
        };
        if let Err(e) = self.pipeline.before_llm_call(ctx, &mut call).await {
            *error = Some(e.to_string());
            return Step::Stop(StopCode::IterationError);
        }

        // Step 4: invoke the LLM.
        self.emit(ctx, EventKind::LlmStart { model: call.model.clone() });
        let response = match self
            .llm
            .chat(ChatRequest {
                messages: call.messages,
                tools: call.tools,
                temperature: call.temperature,
                max_tokens: call.max_tokens,
                model: call.model,
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                *error = Some(e.to_string());
                self.emit(ctx, EventKind::AgentError { message: e.to_string() });
                return Step::Stop(StopCode::IterationError);
            }
        };
        if !response.content.is_empty() {
            self.emit(ctx, EventKind::LlmChunk { text: response.content.clone() });
        }
        self.emit(ctx, EventKind::LlmEnd { usage: response.usage });
        usage.add(&response.usage);
        ctx.total_tokens = usage.total_tokens as u64;

        // Step 5.
        if let Err(e) = self.pipeline.after_llm_call(ctx, &response).await {
            *error = Some(e.to_string());
            return Step::Stop(StopCode::IterationError);
        }

        // Step 6: a final answer with no tool calls.
        if response.tool_calls.is_empty() {
            if !response.content.is_empty() {
                ctx.messages.push(Message::assistant(&response.content));
                *answer = Some(response.content);
                return Step::Stop(StopCode::NoToolCalls);
            }
            // Nothing usable; let the next iteration re-prompt.
            return Step::Continue;
        }

        // Step 7: dispatch tool calls sequentially, in LLM order.
        ctx.messages
            .push(Message::assistant_tool_calls(&response.content, &response.tool_calls));

        let mut report_called = false;
        for tc in &response.tool_calls {
            if self.cancel.is_cancelled() {
                return Step::Stop(StopCode::AbortSignal);
            }

            let decision = match self.pipeline.before_tool_exec(ctx, tc).await {
                Ok(decision) => decision,
                Err(e) => {
                    *error = Some(e.to_string());
                    return Step::Stop(StopCode::IterationError);
                }
            };

            if decision == ToolDecision::Skip {
                // A dedupe hit leaves the cached result in meta; plain
                // skips get a synthetic marker result.
                let content = ctx
                    .meta_take("context_filter.cached_result")
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_else(|| "[tool call skipped]".to_owned());
                self.emit(ctx, EventKind::ToolStart {
                    invocation_id: tc.call_id.clone(),
                    tool: tc.tool_name.clone(),
                    args_preview: truncate_str(&tc.arguments.to_string(), 200),
                });
                self.emit(ctx, EventKind::ToolEnd {
                    invocation_id: tc.call_id.clone(),
                    tool: tc.tool_name.clone(),
                    duration_ms: 0,
                    output_preview: truncate_str(&content, 200),
                });
                ctx.messages.push(Message::tool_result(&tc.call_id, &content));

                // Post hooks still observe the synthetic result, so the
                // loop detector sees repeated (deduped) calls.
                let synthetic = fm_tools::ToolOutcome::ok(Value::String(content))
                    .with_metadata(serde_json::json!({"from_cache": true}));
                if let Err(e) = self.pipeline.after_tool_exec(ctx, tc, &synthetic).await {
                    *error = Some(e.to_string());
                    return Step::Stop(StopCode::IterationError);
                }
                continue;
            }

            self.emit(ctx, EventKind::ToolStart {
                invocation_id: tc.call_id.clone(),
                tool: tc.tool_name.clone(),
                args_preview: truncate_str(&tc.arguments.to_string(), 200),
            });
            let started = std::time::Instant::now();
            let outcome = self.tools.execute(&tc.tool_name, &tc.arguments, &self.cancel).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            let content = outcome.to_content();

            if outcome.success {
                self.emit(ctx, EventKind::ToolEnd {
                    invocation_id: tc.call_id.clone(),
                    tool: tc.tool_name.clone(),
                    duration_ms,
                    output_preview: truncate_str(&content, 200),
                });
                ctx.messages.push(Message::tool_result(&tc.call_id, &content));
            } else {
                self.emit(ctx, EventKind::ToolError {
                    invocation_id: tc.call_id.clone(),
                    tool: tc.tool_name.clone(),
                    message: truncate_str(&content, 200),
                });
                // Surfaced to the LLM as the tool result, never thrown.
                ctx.messages.push(Message::tool_error(&tc.call_id, &content));
            }

            // Step 8: report interception.
            if tc.tool_name == TOOL_REPORT && outcome.success {
                report_called = true;
                *answer = tc
                    .arguments
                    .get("answer")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                *claims = tc
                    .arguments
                    .get("claims")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
            }

            if let Err(e) = self.pipeline.after_tool_exec(ctx, tc, &outcome).await {
                *error = Some(e.to_string());
                return Step::Stop(StopCode::IterationError);
            }
        }

        if report_called {
            return Step::Stop(StopCode::ReportComplete);
        }
        Step::Continue
    }

    /// One terminal synthesis call when the hard token limit tripped.
    async fn maybe_force_synthesis(
        &self,
        ctx: &mut IterationCtx,
        usage: &mut Usage,
    ) -> Option<String> {
        if !self.force_synthesis_on_hard_limit {
            return None;
        }
        self.emit(ctx, EventKind::SynthesisForced);
        self.emit(ctx, EventKind::SynthesisStart);

        let mut messages = ctx.messages.clone();
        messages.push(Message::system(
            "The token budget is exhausted. Produce your best final answer from the work so far. Do not call tools.",
        ));
        match self
            .llm
            .chat(ChatRequest {
                messages,
                tools: Vec::new(),
                temperature: self.temperature,
                max_tokens: None,
                model: self.model.clone(),
            })
            .await
        {
            Ok(response) => {
                usage.add(&response.usage);
                ctx.total_tokens = usage.total_tokens as u64;
                self.emit(ctx, EventKind::SynthesisComplete {
                    summary_preview: truncate_str(&response.content, 200),
                });
                Some(response.content)
            }
            Err(e) => {
                tracing::warn!(error = %e, "forced synthesis call failed");
                None
            }
        }
    }
}

fn reason_code(end: &LoopEnd) -> StopCode {
    match end {
        LoopEnd::Stopped(code) => *code,
        // Escalations surface to on_stop hooks as a loop-detected stop:
        // the dominant escalation trigger and the closest fit in the
        // fixed code set.
        LoopEnd::Escalated(_) => StopCode::LoopDetected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_domain::config::ToolsConfig;
    use fm_domain::message::ToolCall;
    use fm_providers::{ChatResponse, ScriptedClient};
    use fm_tools::registry::ReportTool;
    use fm_tools::{PermissionGate, ToolRegistry};
    use serde_json::json;

    fn tool_call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            call_id: id.into(),
            tool_name: name.into(),
            arguments: args,
        }
    }

    fn registry(dir: &std::path::Path) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::builtin(dir, &ToolsConfig::default());
        registry.register(Arc::new(ReportTool));
        Arc::new(registry)
    }

    fn make_loop(llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolExecutor>) -> IterationLoop {
        IterationLoop {
            llm,
            tools,
            pipeline: Pipeline::empty(),
            bus: Arc::new(EventBus::new()),
            cancel: CancelToken::new(),
            temperature: Some(0.2),
            model: None,
            hard_limit_ratio: 1.0,
            force_synthesis_on_hard_limit: false,
        }
    }

    fn ctx(max_iterations: u32, max_tokens: u64) -> IterationCtx {
        let mut ctx = IterationCtx::new("r1", "s1", "worker", "task");
        ctx.max_iterations = max_iterations;
        ctx.max_tokens = max_tokens;
        ctx.messages = vec![Message::system("be brief"), Message::user("task")];
        ctx
    }

    #[tokio::test]
    async fn report_on_iteration_one_beats_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), "hello").unwrap();
        let llm = Arc::new(ScriptedClient::new(
            "mock",
            vec![ChatResponse::tools(vec![tool_call(
                "c1",
                TOOL_REPORT,
                json!({"answer": "X contains: hello"}),
            )])
            .with_usage(10, 5)],
        ));
        let runner = make_loop(llm, registry(dir.path()));

        let mut ctx = ctx(1, 100_000);
        let result = runner.run(&mut ctx).await;
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::ReportComplete));
        assert_eq!(result.answer.as_deref(), Some("X contains: hello"));
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn tool_then_report_two_iterations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), "hello").unwrap();
        let llm = Arc::new(ScriptedClient::new(
            "mock",
            vec![
                ChatResponse::tools(vec![tool_call("c1", "fs:read", json!({"path": "x"}))])
                    .with_usage(10, 5),
                ChatResponse::tools(vec![tool_call(
                    "c2",
                    TOOL_REPORT,
                    json!({"answer": "X contains: hello"}),
                )])
                .with_usage(12, 6),
            ],
        ));
        let runner = make_loop(llm, registry(dir.path()));

        let mut ctx = ctx(10, 100_000);
        let result = runner.run(&mut ctx).await;
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::ReportComplete));
        assert_eq!(result.iterations, 2);
        assert_eq!(result.usage.total_tokens, 33);

        // Tool result message directly follows the assistant tool-call
        // message, matched by call id.
        let ids: Vec<Option<&str>> = ctx.messages.iter().map(|m| m.answered_call_id()).collect();
        assert!(ids.contains(&Some("c1")));
    }

    #[tokio::test]
    async fn final_text_answer_stops_no_tool_calls() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedClient::new(
            "mock",
            vec![ChatResponse::text("done directly").with_usage(5, 2)],
        ));
        let runner = make_loop(llm, registry(dir.path()));

        let mut ctx = ctx(10, 100_000);
        let result = runner.run(&mut ctx).await;
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::NoToolCalls));
        assert_eq!(result.answer.as_deref(), Some("done directly"));
    }

    #[tokio::test]
    async fn abort_signal_wins_over_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedClient::empty("mock"));
        let runner = make_loop(llm, registry(dir.path()));
        runner.cancel.cancel();

        let mut ctx = ctx(10, 100_000);
        let result = runner.run(&mut ctx).await;
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::AbortSignal));
    }

    #[tokio::test]
    async fn iteration_budget_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), "hello").unwrap();
        // Always asks for another read, never reports.
        let llm = Arc::new(ScriptedClient::new(
            "mock",
            (0..5)
                .map(|i| {
                    ChatResponse::tools(vec![tool_call(
                        &format!("c{i}"),
                        "fs:read",
                        json!({"path": "x", "offset": i}),
                    )])
                    .with_usage(5, 2)
                })
                .collect(),
        ));
        let runner = make_loop(llm, registry(dir.path()));

        let mut ctx = ctx(3, 1_000_000);
        let result = runner.run(&mut ctx).await;
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::MaxIterations));
        assert_eq!(result.iterations, 4); // stopped entering the 4th
    }

    #[tokio::test]
    async fn hard_token_limit_with_forced_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), "hello").unwrap();
        let llm = Arc::new(ScriptedClient::new(
            "mock",
            vec![
                // Burns 1000 tokens in iteration 1.
                ChatResponse::tools(vec![tool_call("c1", "fs:read", json!({"path": "x"}))])
                    .with_usage(800, 200),
                // The forced synthesis call.
                ChatResponse::text("best effort summary").with_usage(10, 5),
            ],
        ));
        let mut runner = make_loop(llm, registry(dir.path()));
        runner.force_synthesis_on_hard_limit = true;

        let mut ctx = ctx(10, 1000);
        let result = runner.run(&mut ctx).await;
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::HardTokenLimit));
        assert_eq!(result.answer.as_deref(), Some("best effort summary"));
    }

    #[tokio::test]
    async fn llm_error_stops_with_iteration_error() {
        struct FailingClient;
        #[async_trait::async_trait]
        impl LlmClient for FailingClient {
            async fn chat(&self, _req: ChatRequest) -> fm_domain::Result<ChatResponse> {
                Err(fm_domain::Error::Http("connection refused".into()))
            }
            fn client_id(&self) -> &str {
                "failing"
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let runner = make_loop(Arc::new(FailingClient), registry(dir.path()));
        let mut ctx = ctx(5, 100_000);
        let result = runner.run(&mut ctx).await;
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::IterationError));
        assert!(result.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn failed_tool_is_surfaced_to_llm_not_thrown() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Arc::new(ScriptedClient::new(
            "mock",
            vec![
                ChatResponse::tools(vec![tool_call("c1", "fs:read", json!({"path": "missing"}))])
                    .with_usage(5, 2),
                ChatResponse::text("the file does not exist").with_usage(5, 2),
            ],
        ));
        let runner = make_loop(llm.clone(), registry(dir.path()));

        let mut ctx = ctx(10, 100_000);
        let result = runner.run(&mut ctx).await;
        // The loop carried on; the model saw the error and answered.
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::NoToolCalls));
        assert_eq!(llm.requests_seen(), 2);
    }

    #[tokio::test]
    async fn loop_detection_via_progress_meta() {
        use crate::middlewares::progress::ProgressMiddleware;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), "a").unwrap();
        // The same call six times over six iterations.
        let llm = Arc::new(ScriptedClient::new(
            "mock",
            (0..8)
                .map(|_| {
                    ChatResponse::tools(vec![tool_call("c", "fs:read", json!({"path": "x"}))])
                        .with_usage(5, 2)
                })
                .collect(),
        ));
        let bus = Arc::new(EventBus::new());
        let mut runner = make_loop(llm, registry(dir.path()));
        runner.pipeline = Pipeline::new(vec![Arc::new(ProgressMiddleware::new(bus.clone(), 4))]);
        runner.bus = bus;

        let mut ctx = ctx(20, 1_000_000);
        let result = runner.run(&mut ctx).await;
        assert_eq!(result.end, LoopEnd::Stopped(StopCode::LoopDetected));
        assert_eq!(result.iterations, 6);
    }
}
