//! Feature-flagged signal middlewares: analytics counters, search
//! broadening hints, todo extraction, and task classification.
//!
//! These emit signals only; none of them alters correctness.

use serde_json::{json, Value};

use fm_domain::message::ToolCall;
use fm_domain::Result;
use fm_providers::ChatResponse;
use fm_tools::ToolOutcome;

use crate::pipeline::{IterationCtx, Middleware};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Analytics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates llm/tool counters under `meta["analytics"]`.
pub struct AnalyticsMiddleware;

fn bump(ctx: &mut IterationCtx, counter: &str) {
    let mut analytics = ctx
        .meta_get("analytics")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let count = analytics.get(counter).and_then(Value::as_u64).unwrap_or(0);
    analytics[counter] = json!(count + 1);
    ctx.meta_set("analytics", analytics);
}

#[async_trait::async_trait]
impl Middleware for AnalyticsMiddleware {
    fn name(&self) -> &str {
        "analytics"
    }

    fn order(&self) -> i32 {
        90
    }

    async fn after_llm_call(&self, ctx: &mut IterationCtx, _response: &ChatResponse) -> Result<()> {
        bump(ctx, "llm_calls");
        Ok(())
    }

    async fn after_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        _call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<()> {
        bump(ctx, "tool_calls");
        if !outcome.success {
            bump(ctx, "tool_failures");
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search signal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flags `meta["search_signal.broaden"]` after a streak of search-like
/// calls, a hint other middlewares may surface to the model.
#[derive(Default)]
pub struct SearchSignalMiddleware {
    streak: std::sync::atomic::AtomicU32,
}

fn is_search_tool(name: &str) -> bool {
    name.contains("search") || name.contains("grep") || name == "fs:list"
}

#[async_trait::async_trait]
impl Middleware for SearchSignalMiddleware {
    fn name(&self) -> &str {
        "search_signal"
    }

    fn order(&self) -> i32 {
        55
    }

    async fn after_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        call: &ToolCall,
        _outcome: &ToolOutcome,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;
        let streak = if is_search_tool(&call.tool_name) {
            self.streak.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.streak.store(0, Ordering::Release);
            0
        };
        if streak >= 3 {
            ctx.meta_set("search_signal.broaden", json!(true));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Todo sync
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Collects TODO lines from tool outputs into `meta["todos"]`.
pub struct TodoSyncMiddleware;

#[async_trait::async_trait]
impl Middleware for TodoSyncMiddleware {
    fn name(&self) -> &str {
        "todo_sync"
    }

    fn order(&self) -> i32 {
        60
    }

    async fn after_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        _call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<()> {
        let Some(Value::String(output)) = &outcome.output else {
            return Ok(());
        };
        let found: Vec<Value> = output
            .lines()
            .filter(|line| line.contains("TODO"))
            .map(|line| json!(line.trim()))
            .collect();
        if found.is_empty() {
            return Ok(());
        }
        match ctx.meta.get_mut("todos") {
            Some(Value::Array(items)) => items.extend(found),
            _ => ctx.meta_set("todos", Value::Array(found)),
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task classifier
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keyword classification of the task into a coarse class at start.
pub struct TaskClassifierMiddleware;

fn classify(task: &str) -> &'static str {
    let lower = task.to_ascii_lowercase();
    if ["implement", "fix", "refactor", "write code", "compile", "bug"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        "code"
    } else if ["investigate", "research", "find", "explain", "why"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        "research"
    } else if ["deploy", "restart", "install", "configure"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        "ops"
    } else {
        "general"
    }
}

#[async_trait::async_trait]
impl Middleware for TaskClassifierMiddleware {
    fn name(&self) -> &str {
        "task_classifier"
    }

    fn order(&self) -> i32 {
        1
    }

    async fn on_start(&self, ctx: &mut IterationCtx) -> Result<()> {
        let class = classify(&ctx.task);
        ctx.meta_set("task.class", json!(class));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use std::sync::Arc;

    fn call(name: &str) -> ToolCall {
        ToolCall {
            call_id: "c".into(),
            tool_name: name.into(),
            arguments: json!({}),
        }
    }

    #[tokio::test]
    async fn analytics_counts_calls_and_failures() {
        let pipeline = Pipeline::new(vec![Arc::new(AnalyticsMiddleware)]);
        let mut ctx = IterationCtx::new("r", "s", "a", "t");

        pipeline
            .after_tool_exec(&mut ctx, &call("fs:read"), &ToolOutcome::ok(json!("x")))
            .await
            .unwrap();
        pipeline
            .after_tool_exec(&mut ctx, &call("fs:read"), &ToolOutcome::fail("e", "m"))
            .await
            .unwrap();

        let analytics = ctx.meta_get("analytics").unwrap();
        assert_eq!(analytics["tool_calls"], 2);
        assert_eq!(analytics["tool_failures"], 1);
    }

    #[tokio::test]
    async fn search_streak_sets_broaden_hint() {
        let pipeline = Pipeline::new(vec![Arc::new(SearchSignalMiddleware::default())]);
        let mut ctx = IterationCtx::new("r", "s", "a", "t");

        for _ in 0..3 {
            pipeline
                .after_tool_exec(&mut ctx, &call("code:grep"), &ToolOutcome::ok(json!("")))
                .await
                .unwrap();
        }
        assert!(ctx.meta_flag("search_signal.broaden"));
    }

    #[tokio::test]
    async fn todo_lines_are_collected() {
        let pipeline = Pipeline::new(vec![Arc::new(TodoSyncMiddleware)]);
        let mut ctx = IterationCtx::new("r", "s", "a", "t");

        pipeline
            .after_tool_exec(
                &mut ctx,
                &call("fs:read"),
                &ToolOutcome::ok(json!("line\n// TODO: handle retries\nrest")),
            )
            .await
            .unwrap();

        let todos = ctx.meta_get("todos").unwrap();
        assert_eq!(todos.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn classifier_tags_the_task() {
        let pipeline = Pipeline::new(vec![Arc::new(TaskClassifierMiddleware)]);
        let mut ctx = IterationCtx::new("r", "s", "a", "fix the login bug");
        pipeline.on_start(&mut ctx).await.unwrap();
        assert_eq!(ctx.meta_get("task.class").unwrap(), "code");
    }
}
