//! Middleware pipeline — ordered pre/post hooks around the iteration,
//! the LLM call, and each tool call.
//!
//! Execution rules: pre-hooks run ascending by `order()`, post-hooks
//! descending. For `before_iteration` the first non-`Continue` action
//! wins; `before_llm_call` patches merge field-wise in ascending order
//! (last wins); for `before_tool_exec` any `Skip` vote wins. Every hook
//! runs under its declared timeout (0 = unlimited). A fail-open hook
//! failure is logged and replaced by the neutral value; fail-closed
//! propagates and aborts the run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use fm_domain::message::{Message, ToolCall, ToolDefinition};
use fm_domain::{Error, Result};
use fm_providers::ChatResponse;
use fm_tools::ToolOutcome;

use crate::iteration::StopCode;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hook vocabulary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Verdict of a `before_iteration` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationAction {
    Continue,
    Stop(StopCode),
    Escalate(String),
}

/// Verdict of a `before_tool_exec` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolDecision {
    Execute,
    Skip,
}

/// Field-wise override for the upcoming LLM call.
#[derive(Debug, Clone, Default)]
pub struct LlmPatch {
    pub messages: Option<Vec<Message>>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
}

/// The call the loop is about to make; hooks patch it in place.
#[derive(Debug, Clone, Default)]
pub struct LlmCall {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

impl LlmCall {
    fn apply(&mut self, patch: LlmPatch) {
        if let Some(messages) = patch.messages {
            self.messages = messages;
        }
        if let Some(tools) = patch.tools {
            self.tools = tools;
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = Some(temperature);
        }
        if let Some(model) = patch.model {
            self.model = Some(model);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPolicy {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct HookConfig {
    pub fail_policy: FailPolicy,
    /// 0 = unlimited.
    pub timeout_ms: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            fail_policy: FailPolicy::FailOpen,
            timeout_ms: 5_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Iteration context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable per-run state every hook sees. `meta` is a namespaced map
/// for cross-middleware hints (e.g. `budget.convergence_nudge_sent`);
/// mutations are visible to later hooks but carry no cross-run state.
pub struct IterationCtx {
    pub run_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub parent_agent_id: Option<String>,
    pub task: String,
    pub iteration: u32,
    pub total_tokens: u64,
    pub max_tokens: u64,
    pub max_iterations: u32,
    pub messages: Vec<Message>,
    pub meta: serde_json::Map<String, Value>,
}

impl IterationCtx {
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            parent_agent_id: None,
            task: task.into(),
            iteration: 0,
            total_tokens: 0,
            max_tokens: 0,
            max_iterations: 0,
            messages: Vec::new(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn meta_set(&mut self, key: &str, value: Value) {
        self.meta.insert(key.to_owned(), value);
    }

    pub fn meta_get(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        self.meta.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn meta_take(&mut self, key: &str) -> Option<Value> {
        self.meta.remove(key)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named, ordered hook bundle. All hooks default to no-ops; implement
/// the subset you need.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs earlier in pre-hooks, later in post-hooks.
    fn order(&self) -> i32;

    fn config(&self) -> HookConfig {
        HookConfig::default()
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn on_start(&self, _ctx: &mut IterationCtx) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &mut IterationCtx, _code: StopCode) -> Result<()> {
        Ok(())
    }

    async fn on_complete(&self, _ctx: &mut IterationCtx) -> Result<()> {
        Ok(())
    }

    async fn before_iteration(&self, _ctx: &mut IterationCtx) -> Result<IterationAction> {
        Ok(IterationAction::Continue)
    }

    async fn after_iteration(&self, _ctx: &mut IterationCtx) -> Result<()> {
        Ok(())
    }

    async fn before_llm_call(
        &self,
        _ctx: &mut IterationCtx,
        _call: &LlmCall,
    ) -> Result<Option<LlmPatch>> {
        Ok(None)
    }

    async fn after_llm_call(&self, _ctx: &mut IterationCtx, _response: &ChatResponse) -> Result<()> {
        Ok(())
    }

    async fn before_tool_exec(
        &self,
        _ctx: &mut IterationCtx,
        _call: &ToolCall,
    ) -> Result<ToolDecision> {
        Ok(ToolDecision::Execute)
    }

    async fn after_tool_exec(
        &self,
        _ctx: &mut IterationCtx,
        _call: &ToolCall,
        _outcome: &ToolOutcome,
    ) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Pipeline {
    /// Sorted ascending by order.
    middlewares: Vec<Arc<dyn Middleware>>,
}

/// Outcome of running one hook under its policy.
enum HookRun<T> {
    Value(T),
    /// Fail-open fallback was substituted.
    Fallback,
}

impl Pipeline {
    pub fn new(mut middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        middlewares.retain(|m| m.enabled());
        middlewares.sort_by_key(|m| m.order());
        Self { middlewares }
    }

    pub fn empty() -> Self {
        Self { middlewares: Vec::new() }
    }

    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    fn ascending(&self) -> impl Iterator<Item = &Arc<dyn Middleware>> {
        self.middlewares.iter()
    }

    fn descending(&self) -> impl Iterator<Item = &Arc<dyn Middleware>> {
        self.middlewares.iter().rev()
    }

    /// Run one hook future under the middleware's timeout and fail
    /// policy. `fallback` is the neutral value substituted on fail-open
    /// failure.
    async fn guard<T, F>(mw: &Arc<dyn Middleware>, hook: &str, fut: F) -> Result<HookRun<T>>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let cfg = mw.config();
        let outcome = if cfg.timeout_ms == 0 {
            fut.await
        } else {
            match tokio::time::timeout(Duration::from_millis(cfg.timeout_ms), fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "middleware {} hook {hook} exceeded {}ms",
                    mw.name(),
                    cfg.timeout_ms
                ))),
            }
        };

        match outcome {
            Ok(value) => Ok(HookRun::Value(value)),
            Err(e) => match cfg.fail_policy {
                FailPolicy::FailOpen => {
                    tracing::warn!(
                        middleware = mw.name(),
                        hook,
                        error = %e,
                        "fail-open middleware hook failed; continuing with fallback"
                    );
                    Ok(HookRun::Fallback)
                }
                FailPolicy::FailClosed => Err(e),
            },
        }
    }

    pub async fn on_start(&self, ctx: &mut IterationCtx) -> Result<()> {
        for mw in self.ascending() {
            Self::guard(mw, "on_start", mw.on_start(ctx)).await?;
        }
        Ok(())
    }

    /// Post-hook: descending order. Hook failures never prevent the
    /// remaining stop hooks from firing.
    pub async fn on_stop(&self, ctx: &mut IterationCtx, code: StopCode) {
        for mw in self.descending() {
            if let Err(e) = Self::guard(mw, "on_stop", mw.on_stop(ctx, code)).await {
                tracing::warn!(middleware = mw.name(), error = %e, "on_stop hook failed");
            }
        }
    }

    pub async fn on_complete(&self, ctx: &mut IterationCtx) {
        for mw in self.descending() {
            if let Err(e) = Self::guard(mw, "on_complete", mw.on_complete(ctx)).await {
                tracing::warn!(middleware = mw.name(), error = %e, "on_complete hook failed");
            }
        }
    }

    /// First non-`Continue` action wins.
    pub async fn before_iteration(&self, ctx: &mut IterationCtx) -> Result<IterationAction> {
        for mw in self.ascending() {
            match Self::guard(mw, "before_iteration", mw.before_iteration(ctx)).await? {
                HookRun::Value(IterationAction::Continue) | HookRun::Fallback => {}
                HookRun::Value(action) => return Ok(action),
            }
        }
        Ok(IterationAction::Continue)
    }

    pub async fn after_iteration(&self, ctx: &mut IterationCtx) -> Result<()> {
        for mw in self.descending() {
            Self::guard(mw, "after_iteration", mw.after_iteration(ctx)).await?;
        }
        Ok(())
    }

    /// Patches merge by shallow field-wise overwrite in ascending order
    /// (last wins).
    pub async fn before_llm_call(&self, ctx: &mut IterationCtx, call: &mut LlmCall) -> Result<()> {
        for mw in self.ascending() {
            if let HookRun::Value(Some(patch)) =
                Self::guard(mw, "before_llm_call", mw.before_llm_call(ctx, call)).await?
            {
                call.apply(patch);
            }
        }
        Ok(())
    }

    pub async fn after_llm_call(&self, ctx: &mut IterationCtx, response: &ChatResponse) -> Result<()> {
        for mw in self.descending() {
            Self::guard(mw, "after_llm_call", mw.after_llm_call(ctx, response)).await?;
        }
        Ok(())
    }

    /// Any `Skip` vote wins; every hook still runs.
    pub async fn before_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        call: &ToolCall,
    ) -> Result<ToolDecision> {
        let mut decision = ToolDecision::Execute;
        for mw in self.ascending() {
            if let HookRun::Value(ToolDecision::Skip) =
                Self::guard(mw, "before_tool_exec", mw.before_tool_exec(ctx, call)).await?
            {
                decision = ToolDecision::Skip;
            }
        }
        Ok(decision)
    }

    pub async fn after_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<()> {
        for mw in self.descending() {
            Self::guard(mw, "after_tool_exec", mw.after_tool_exec(ctx, call, outcome)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Appends its name to `ctx.meta["trace"]` on every hook it runs.
    struct Probe {
        name: String,
        order: i32,
        action: IterationAction,
        patch: Option<LlmPatch>,
        decision: ToolDecision,
    }

    impl Probe {
        fn new(name: &str, order: i32) -> Self {
            Self {
                name: name.into(),
                order,
                action: IterationAction::Continue,
                patch: None,
                decision: ToolDecision::Execute,
            }
        }

        fn record(&self, ctx: &mut IterationCtx, hook: &str) {
            let entry = json!(format!("{}:{}", self.name, hook));
            match ctx.meta.get_mut("trace") {
                Some(Value::Array(items)) => items.push(entry),
                _ => {
                    ctx.meta_set("trace", json!([entry]));
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for Probe {
        fn name(&self) -> &str {
            &self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        async fn before_iteration(&self, ctx: &mut IterationCtx) -> Result<IterationAction> {
            self.record(ctx, "before_iteration");
            Ok(self.action.clone())
        }
        async fn after_iteration(&self, ctx: &mut IterationCtx) -> Result<()> {
            self.record(ctx, "after_iteration");
            Ok(())
        }
        async fn before_llm_call(
            &self,
            ctx: &mut IterationCtx,
            _call: &LlmCall,
        ) -> Result<Option<LlmPatch>> {
            self.record(ctx, "before_llm_call");
            Ok(self.patch.clone())
        }
        async fn before_tool_exec(
            &self,
            ctx: &mut IterationCtx,
            _call: &ToolCall,
        ) -> Result<ToolDecision> {
            self.record(ctx, "before_tool_exec");
            Ok(self.decision)
        }
    }

    fn ctx() -> IterationCtx {
        IterationCtx::new("r1", "s1", "a1", "task")
    }

    fn trace(ctx: &IterationCtx) -> Vec<String> {
        ctx.meta_get("trace")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn pre_hooks_ascend_post_hooks_descend() {
        let pipeline = Pipeline::new(vec![
            Arc::new(Probe::new("late", 50)),
            Arc::new(Probe::new("early", 10)),
        ]);
        let mut ctx = ctx();

        pipeline.before_iteration(&mut ctx).await.unwrap();
        pipeline.after_iteration(&mut ctx).await.unwrap();

        assert_eq!(
            trace(&ctx),
            vec![
                "early:before_iteration",
                "late:before_iteration",
                "late:after_iteration",
                "early:after_iteration",
            ]
        );
    }

    #[tokio::test]
    async fn first_non_continue_action_wins() {
        let mut stopper = Probe::new("stopper", 10);
        stopper.action = IterationAction::Stop(StopCode::HardTokenLimit);
        let pipeline = Pipeline::new(vec![
            Arc::new(stopper),
            Arc::new(Probe::new("never", 20)),
        ]);
        let mut ctx = ctx();

        let action = pipeline.before_iteration(&mut ctx).await.unwrap();
        assert_eq!(action, IterationAction::Stop(StopCode::HardTokenLimit));
        // The later hook did not run.
        assert_eq!(trace(&ctx), vec!["stopper:before_iteration"]);
    }

    #[tokio::test]
    async fn llm_patches_merge_last_wins() {
        let mut first = Probe::new("first", 10);
        first.patch = Some(LlmPatch {
            temperature: Some(0.1),
            model: Some("small".into()),
            ..Default::default()
        });
        let mut second = Probe::new("second", 20);
        second.patch = Some(LlmPatch {
            temperature: Some(0.9),
            ..Default::default()
        });
        let pipeline = Pipeline::new(vec![Arc::new(first), Arc::new(second)]);

        let mut call = LlmCall::default();
        pipeline.before_llm_call(&mut ctx(), &mut call).await.unwrap();

        assert_eq!(call.temperature, Some(0.9)); // overwritten by the later hook
        assert_eq!(call.model.as_deref(), Some("small")); // untouched by the later hook
    }

    #[tokio::test]
    async fn any_skip_vote_wins() {
        let mut skipper = Probe::new("skipper", 10);
        skipper.decision = ToolDecision::Skip;
        let pipeline = Pipeline::new(vec![
            Arc::new(skipper),
            Arc::new(Probe::new("executor", 20)),
        ]);
        let mut ctx = ctx();

        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "fs:read".into(),
            arguments: json!({}),
        };
        let decision = pipeline.before_tool_exec(&mut ctx, &call).await.unwrap();
        assert_eq!(decision, ToolDecision::Skip);
        // Both hooks ran despite the early skip vote.
        assert_eq!(trace(&ctx).len(), 2);
    }

    // ── Failure policies ──────────────────────────────────────────

    struct Failing {
        policy: FailPolicy,
        timeout_ms: u64,
        hang: bool,
    }

    #[async_trait::async_trait]
    impl Middleware for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn order(&self) -> i32 {
            0
        }
        fn config(&self) -> HookConfig {
            HookConfig {
                fail_policy: self.policy,
                timeout_ms: self.timeout_ms,
            }
        }
        async fn before_iteration(&self, _ctx: &mut IterationCtx) -> Result<IterationAction> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Err(Error::Other("hook exploded".into()))
        }
    }

    #[tokio::test]
    async fn fail_open_substitutes_neutral_value() {
        let pipeline = Pipeline::new(vec![Arc::new(Failing {
            policy: FailPolicy::FailOpen,
            timeout_ms: 0,
            hang: false,
        })]);
        let action = pipeline.before_iteration(&mut ctx()).await.unwrap();
        assert_eq!(action, IterationAction::Continue);
    }

    #[tokio::test]
    async fn fail_closed_propagates() {
        let pipeline = Pipeline::new(vec![Arc::new(Failing {
            policy: FailPolicy::FailClosed,
            timeout_ms: 0,
            hang: false,
        })]);
        assert!(pipeline.before_iteration(&mut ctx()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn hook_timeout_respects_policy() {
        let open = Pipeline::new(vec![Arc::new(Failing {
            policy: FailPolicy::FailOpen,
            timeout_ms: 50,
            hang: true,
        })]);
        let action = open.before_iteration(&mut ctx()).await.unwrap();
        assert_eq!(action, IterationAction::Continue);

        let closed = Pipeline::new(vec![Arc::new(Failing {
            policy: FailPolicy::FailClosed,
            timeout_ms: 50,
            hang: true,
        })]);
        let err = closed.before_iteration(&mut ctx()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn disabled_middleware_is_dropped() {
        struct Disabled;
        #[async_trait::async_trait]
        impl Middleware for Disabled {
            fn name(&self) -> &str {
                "disabled"
            }
            fn order(&self) -> i32 {
                0
            }
            fn enabled(&self) -> bool {
                false
            }
        }
        let pipeline = Pipeline::new(vec![Arc::new(Disabled), Arc::new(Probe::new("on", 1))]);
        assert_eq!(pipeline.names(), vec!["on"]);
    }
}
