//! Budget middleware — token ceilings with a soft nudge and a hard stop.
//!
//! At `soft_limit_ratio` of the budget a single convergence nudge is
//! injected into the next LLM call; at `hard_limit_ratio` the iteration
//! is stopped with `hard_token_limit`.

use std::sync::atomic::{AtomicBool, Ordering};

use fm_domain::message::Message;
use fm_domain::Result;

use crate::iteration::StopCode;
use crate::pipeline::{IterationAction, IterationCtx, LlmCall, LlmPatch, Middleware};

const CONVERGENCE_NUDGE: &str = "You are approaching the token budget for this task. Converge now: stop exploring, consolidate what you have, and finish with the report tool.";

pub struct BudgetMiddleware {
    soft_limit_ratio: f64,
    hard_limit_ratio: f64,
    nudge_sent: AtomicBool,
}

impl BudgetMiddleware {
    pub fn new(soft_limit_ratio: f64, hard_limit_ratio: f64) -> Self {
        Self {
            soft_limit_ratio,
            hard_limit_ratio,
            nudge_sent: AtomicBool::new(false),
        }
    }

    fn soft_limit(&self, ctx: &IterationCtx) -> u64 {
        (ctx.max_tokens as f64 * self.soft_limit_ratio) as u64
    }

    fn hard_limit(&self, ctx: &IterationCtx) -> u64 {
        (ctx.max_tokens as f64 * self.hard_limit_ratio) as u64
    }
}

#[async_trait::async_trait]
impl Middleware for BudgetMiddleware {
    fn name(&self) -> &str {
        "budget"
    }

    fn order(&self) -> i32 {
        10
    }

    async fn before_iteration(&self, ctx: &mut IterationCtx) -> Result<IterationAction> {
        if ctx.max_tokens > 0 && ctx.total_tokens >= self.hard_limit(ctx) {
            return Ok(IterationAction::Stop(StopCode::HardTokenLimit));
        }
        Ok(IterationAction::Continue)
    }

    async fn before_llm_call(
        &self,
        ctx: &mut IterationCtx,
        call: &LlmCall,
    ) -> Result<Option<LlmPatch>> {
        if ctx.max_tokens == 0 || ctx.total_tokens < self.soft_limit(ctx) {
            return Ok(None);
        }
        // Exactly one nudge per run.
        if self.nudge_sent.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        ctx.meta_set("budget.convergence_nudge_sent", serde_json::json!(true));

        let mut messages = call.messages.clone();
        messages.push(Message::system(CONVERGENCE_NUDGE));
        Ok(Some(LlmPatch {
            messages: Some(messages),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use std::sync::Arc;

    fn ctx(total: u64, max: u64) -> IterationCtx {
        let mut ctx = IterationCtx::new("r1", "s1", "a1", "t");
        ctx.total_tokens = total;
        ctx.max_tokens = max;
        ctx
    }

    #[tokio::test]
    async fn soft_limit_injects_exactly_one_nudge() {
        let pipeline = Pipeline::new(vec![Arc::new(BudgetMiddleware::new(0.8, 1.0))]);
        let mut ctx = ctx(820, 1000);

        let mut call = LlmCall { messages: vec![Message::user("hi")], ..Default::default() };
        pipeline.before_llm_call(&mut ctx, &mut call).await.unwrap();
        assert_eq!(call.messages.len(), 2);
        assert!(ctx.meta_flag("budget.convergence_nudge_sent"));

        // Second call at the same pressure: no further nudge.
        let mut call = LlmCall { messages: vec![Message::user("hi")], ..Default::default() };
        pipeline.before_llm_call(&mut ctx, &mut call).await.unwrap();
        assert_eq!(call.messages.len(), 1);
    }

    #[tokio::test]
    async fn below_soft_limit_no_nudge() {
        let pipeline = Pipeline::new(vec![Arc::new(BudgetMiddleware::new(0.8, 1.0))]);
        let mut ctx = ctx(500, 1000);
        let mut call = LlmCall { messages: vec![Message::user("hi")], ..Default::default() };
        pipeline.before_llm_call(&mut ctx, &mut call).await.unwrap();
        assert_eq!(call.messages.len(), 1);
    }

    #[tokio::test]
    async fn hard_limit_stops_iteration() {
        let pipeline = Pipeline::new(vec![Arc::new(BudgetMiddleware::new(0.8, 1.0))]);
        let mut ctx = ctx(1000, 1000);
        let action = pipeline.before_iteration(&mut ctx).await.unwrap();
        assert_eq!(action, IterationAction::Stop(StopCode::HardTokenLimit));
    }

    #[tokio::test]
    async fn zero_budget_disables_the_middleware() {
        let pipeline = Pipeline::new(vec![Arc::new(BudgetMiddleware::new(0.8, 1.0))]);
        let mut ctx = ctx(999_999, 0);
        assert_eq!(
            pipeline.before_iteration(&mut ctx).await.unwrap(),
            IterationAction::Continue
        );
    }
}
