//! Reflection middleware — periodic operational self-review via a
//! secondary LLM.
//!
//! Triggers every `reflection_interval` tool calls or on a cluster of
//! consecutive failures. The reflection text is injected as a system
//! message; hypothesis switches (lines starting with `HYPOTHESIS:`)
//! are recorded in `ctx.meta["reflection.hypotheses"]`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;

use fm_domain::message::{Message, ToolCall};
use fm_domain::Result;
use fm_providers::{ChatRequest, LlmClient};
use fm_tools::ToolOutcome;

use crate::pipeline::{IterationCtx, Middleware};

const FAILURE_CLUSTER: u32 = 3;

pub struct ReflectionMiddleware {
    secondary_llm: Option<Arc<dyn LlmClient>>,
    reflection_interval: u32,
    tool_calls: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl ReflectionMiddleware {
    pub fn new(secondary_llm: Option<Arc<dyn LlmClient>>, reflection_interval: u32) -> Self {
        Self {
            secondary_llm,
            reflection_interval,
            tool_calls: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn should_reflect(&self, calls: u32, failures: u32) -> bool {
        (self.reflection_interval > 0 && calls % self.reflection_interval == 0)
            || failures >= FAILURE_CLUSTER
    }
}

#[async_trait::async_trait]
impl Middleware for ReflectionMiddleware {
    fn name(&self) -> &str {
        "reflection"
    }

    fn order(&self) -> i32 {
        70
    }

    async fn after_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        _call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<()> {
        let calls = self.tool_calls.fetch_add(1, Ordering::AcqRel) + 1;
        let failures = if outcome.success {
            self.consecutive_failures.store(0, Ordering::Release);
            0
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
        };

        if !self.should_reflect(calls, failures) {
            return Ok(());
        }
        let Some(llm) = &self.secondary_llm else {
            return Ok(());
        };
        // Reset the cluster counter so one cluster yields one reflection.
        self.consecutive_failures.store(0, Ordering::Release);

        let recent: Vec<String> = ctx
            .messages
            .iter()
            .rev()
            .take(10)
            .map(|m| m.content.extract_all_text())
            .filter(|t| !t.is_empty())
            .collect();
        let request = ChatRequest {
            messages: vec![
                Message::system(
                    "You review an agent's recent steps. Answer in at most four lines: what is working, what is not, and whether to switch approach. Mark an approach change with a line starting HYPOTHESIS:.",
                ),
                Message::user(recent.join("\n---\n")),
            ],
            ..Default::default()
        };

        match llm.chat(request).await {
            Ok(response) if !response.content.is_empty() => {
                for line in response.content.lines() {
                    if let Some(hypothesis) = line.trim().strip_prefix("HYPOTHESIS:") {
                        let entry = json!(hypothesis.trim());
                        match ctx.meta.get_mut("reflection.hypotheses") {
                            Some(serde_json::Value::Array(items)) => items.push(entry),
                            _ => ctx.meta_set("reflection.hypotheses", json!([entry])),
                        }
                    }
                }
                ctx.messages.push(Message::system(format!(
                    "Operational reflection:\n{}",
                    response.content
                )));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "reflection call failed"),
        }
        Ok(())
    }
}
