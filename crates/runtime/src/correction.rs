//! Mid-run user corrections: routing and delivery.
//!
//! A correction posted against a run is routed to an agent (explicitly
//! targeted, or the deepest active agent, falling back to the
//! orchestrator) and injected as a system message at the agent's next
//! LLM call boundary.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use fm_domain::event::{AgentEvent, EventKind};
use fm_domain::message::Message;
use fm_domain::Result;

use crate::pipeline::{IterationCtx, LlmCall, LlmPatch, Middleware};

#[derive(Debug, Clone, Serialize)]
pub struct Correction {
    pub correction_id: String,
    pub message: String,
    pub target_agent_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutedCorrection {
    pub correction_id: String,
    pub routed_to: Vec<String>,
    pub reason: String,
    pub applied: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pluggable routing decision: which agent receives a correction.
pub trait CorrectionRouter: Send + Sync {
    fn route(
        &self,
        events: &[AgentEvent],
        message: &str,
        explicit_target: Option<&str>,
    ) -> (String, String);
}

/// Default router: explicit target wins; otherwise the most recently
/// started agent that has not ended; otherwise the orchestrator.
pub struct DeepestAgentRouter;

impl CorrectionRouter for DeepestAgentRouter {
    fn route(
        &self,
        events: &[AgentEvent],
        _message: &str,
        explicit_target: Option<&str>,
    ) -> (String, String) {
        if let Some(target) = explicit_target {
            return (target.to_owned(), "explicit target".to_owned());
        }

        let mut active: Vec<String> = Vec::new();
        for event in events {
            match (&event.kind, &event.agent_id) {
                (EventKind::AgentStart { .. }, Some(agent_id)) => active.push(agent_id.clone()),
                (EventKind::AgentEnd { .. }, Some(agent_id)) => {
                    if let Some(pos) = active.iter().rposition(|a| a == agent_id) {
                        active.remove(pos);
                    }
                }
                _ => {}
            }
        }

        match active.last() {
            Some(agent_id) => (agent_id.clone(), "deepest active agent".to_owned()),
            None => ("orchestrator".to_owned(), "no active agent; routed to orchestrator".to_owned()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery box + middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pending corrections per run, drained by the correction middleware.
#[derive(Default)]
pub struct CorrectionBox {
    pending: Mutex<HashMap<String, Vec<Correction>>>,
}

impl CorrectionBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, run_id: &str, correction: Correction) {
        self.pending
            .lock()
            .entry(run_id.to_owned())
            .or_default()
            .push(correction);
    }

    /// Take the corrections addressed to `agent_id` for a run.
    pub fn drain_for(&self, run_id: &str, agent_id: &str) -> Vec<Correction> {
        let mut pending = self.pending.lock();
        let Some(queue) = pending.get_mut(run_id) else {
            return Vec::new();
        };
        let (matched, rest): (Vec<Correction>, Vec<Correction>) = queue
            .drain(..)
            .partition(|c| c.target_agent_id == agent_id);
        *queue = rest;
        matched
    }

    pub fn clear_run(&self, run_id: &str) {
        self.pending.lock().remove(run_id);
    }
}

/// Injects routed corrections as system messages before the next LLM
/// call of the targeted agent.
pub struct CorrectionMiddleware {
    inbox: std::sync::Arc<CorrectionBox>,
}

impl CorrectionMiddleware {
    pub fn new(inbox: std::sync::Arc<CorrectionBox>) -> Self {
        Self { inbox }
    }
}

#[async_trait::async_trait]
impl Middleware for CorrectionMiddleware {
    fn name(&self) -> &str {
        "correction"
    }

    fn order(&self) -> i32 {
        5
    }

    async fn before_llm_call(
        &self,
        ctx: &mut IterationCtx,
        call: &LlmCall,
    ) -> Result<Option<LlmPatch>> {
        let corrections = self.inbox.drain_for(&ctx.run_id, &ctx.agent_id);
        if corrections.is_empty() {
            return Ok(None);
        }
        let mut messages = call.messages.clone();
        for correction in &corrections {
            messages.push(Message::system(format!(
                "User correction (apply immediately): {}",
                correction.message
            )));
        }
        // The injected corrections also belong in the durable history.
        for correction in corrections {
            ctx.messages.push(Message::system(format!(
                "User correction (apply immediately): {}",
                correction.message
            )));
        }
        Ok(Some(LlmPatch { messages: Some(messages), ..Default::default() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use std::sync::Arc;

    fn agent_event(kind: EventKind, agent: &str) -> AgentEvent {
        AgentEvent::new(kind).with_agent(agent)
    }

    #[test]
    fn explicit_target_wins() {
        let router = DeepestAgentRouter;
        let (target, reason) = router.route(&[], "msg", Some("coder"));
        assert_eq!(target, "coder");
        assert!(reason.contains("explicit"));
    }

    #[test]
    fn routes_to_deepest_active_agent() {
        let router = DeepestAgentRouter;
        let events = vec![
            agent_event(EventKind::AgentStart { task: "t".into() }, "orchestrator"),
            agent_event(EventKind::AgentStart { task: "t".into() }, "worker-1"),
            agent_event(EventKind::AgentStart { task: "t".into() }, "worker-2"),
            agent_event(
                EventKind::AgentEnd { outcome: "success".into(), duration_ms: 1 },
                "worker-2",
            ),
        ];
        let (target, _) = router.route(&events, "msg", None);
        assert_eq!(target, "worker-1");
    }

    #[test]
    fn falls_back_to_orchestrator() {
        let router = DeepestAgentRouter;
        let (target, _) = router.route(&[], "msg", None);
        assert_eq!(target, "orchestrator");
    }

    #[tokio::test]
    async fn middleware_injects_and_drains() {
        let inbox = Arc::new(CorrectionBox::new());
        inbox.push("r1", Correction {
            correction_id: "k1".into(),
            message: "use the staging database".into(),
            target_agent_id: "worker-1".into(),
        });
        inbox.push("r1", Correction {
            correction_id: "k2".into(),
            message: "for someone else".into(),
            target_agent_id: "worker-2".into(),
        });

        let pipeline = Pipeline::new(vec![Arc::new(CorrectionMiddleware::new(inbox.clone()))]);
        let mut ctx = IterationCtx::new("r1", "s1", "worker-1", "t");
        let mut call = LlmCall { messages: vec![Message::user("go")], ..Default::default() };
        pipeline.before_llm_call(&mut ctx, &mut call).await.unwrap();

        assert_eq!(call.messages.len(), 2);
        assert!(call.messages[1].content.extract_all_text().contains("staging database"));

        // Already drained for this agent; the other agent's correction
        // is still queued.
        let mut call = LlmCall { messages: vec![Message::user("go")], ..Default::default() };
        pipeline.before_llm_call(&mut ctx, &mut call).await.unwrap();
        assert_eq!(call.messages.len(), 1);
        assert_eq!(inbox.drain_for("r1", "worker-2").len(), 1);
    }
}
