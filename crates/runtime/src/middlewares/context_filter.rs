//! Context filter — output truncation, tool-call deduplication, and
//! pair-aware context windowing.
//!
//! Dedup: a repeated `(tool, canonical(args))` call is skipped and the
//! cached result injected instead of re-executing. Truncation: tool
//! outputs beyond `max_output_length` are cut and annotated. Windowing:
//! when history grows past `max_messages`, older messages are dropped —
//! but an assistant message carrying tool calls is never separated from
//! its tool result messages.

use std::collections::HashMap;

use parking_lot::Mutex;

use fm_domain::message::{ContentPart, Message, MessageContent, Role, ToolCall};
use fm_domain::Result;
use fm_tools::{ToolOutcome, TOOL_REPORT};
use fm_trace::args_hash;

use crate::pipeline::{IterationCtx, LlmCall, LlmPatch, Middleware, ToolDecision};

const DEFAULT_MAX_MESSAGES: usize = 80;

pub struct ContextFilterMiddleware {
    max_output_length: usize,
    max_messages: usize,
    /// `(tool, args_hash)` → rendered result content.
    cache: Mutex<HashMap<String, String>>,
}

impl ContextFilterMiddleware {
    pub fn new(max_output_length: usize) -> Self {
        Self {
            max_output_length,
            max_messages: DEFAULT_MAX_MESSAGES,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    fn cache_key(call: &ToolCall) -> String {
        format!("{}:{}", call.tool_name, args_hash(&call.arguments))
    }
}

/// Truncate with the annotation the LLM learns to recognize.
fn truncate_output(content: &str, max_len: usize) -> Option<String> {
    if content.len() <= max_len {
        return None;
    }
    let mut end = max_len;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    Some(format!("{}\n... truncated", &content[..end]))
}

/// Window `messages` down to at most `max` entries, preserving the
/// leading system message and never splitting an assistant tool-call
/// message from the tool results that answer it.
pub fn window_messages(messages: &[Message], max: usize) -> Vec<Message> {
    if messages.len() <= max {
        return messages.to_vec();
    }

    let system_prefix: Vec<Message> = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .cloned()
        .collect();
    let body = &messages[system_prefix.len()..];
    let keep = max.saturating_sub(system_prefix.len()).max(1);

    // Pair-aware boundary: never start the window at a tool result
    // whose assistant tool-call message was cut off; walk back over the
    // tool results onto their assistant message.
    let mut start = body.len().saturating_sub(keep);
    while start > 0 && start < body.len() {
        if body[start].role == Role::Tool {
            start -= 1;
        } else {
            break;
        }
    }

    let mut windowed = system_prefix;
    windowed.extend(body[start..].iter().cloned());
    windowed
}

#[async_trait::async_trait]
impl Middleware for ContextFilterMiddleware {
    fn name(&self) -> &str {
        "context_filter"
    }

    fn order(&self) -> i32 {
        15
    }

    async fn before_llm_call(
        &self,
        _ctx: &mut IterationCtx,
        call: &LlmCall,
    ) -> Result<Option<LlmPatch>> {
        if call.messages.len() <= self.max_messages {
            return Ok(None);
        }
        Ok(Some(LlmPatch {
            messages: Some(window_messages(&call.messages, self.max_messages)),
            ..Default::default()
        }))
    }

    async fn before_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        call: &ToolCall,
    ) -> Result<ToolDecision> {
        if call.tool_name == TOOL_REPORT {
            return Ok(ToolDecision::Execute);
        }
        let key = Self::cache_key(call);
        if let Some(cached) = self.cache.lock().get(&key).cloned() {
            ctx.meta_set("context_filter.cached_result", serde_json::json!(cached));
            return Ok(ToolDecision::Skip);
        }
        Ok(ToolDecision::Execute)
    }

    async fn after_tool_exec(
        &self,
        ctx: &mut IterationCtx,
        call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<()> {
        // Truncate the just-appended tool result in place.
        if let Some(Message { role: Role::Tool, content: MessageContent::Parts(parts) }) =
            ctx.messages.last_mut()
        {
            for part in parts.iter_mut() {
                if let ContentPart::ToolResult { content, .. } = part {
                    if let Some(truncated) = truncate_output(content, self.max_output_length) {
                        *content = truncated;
                    }
                }
            }
        }

        // Cache successful results for dedup.
        if outcome.success && call.tool_name != TOOL_REPORT {
            let content = ctx
                .messages
                .last()
                .and_then(|m| match &m.content {
                    MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                        ContentPart::ToolResult { content, .. } => Some(content.clone()),
                        _ => None,
                    }),
                    MessageContent::Text(t) => Some(t.clone()),
                })
                .unwrap_or_else(|| outcome.to_content());
            self.cache.lock().insert(Self::cache_key(call), content);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use serde_json::json;
    use std::sync::Arc;

    fn tool_call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            call_id: "c1".into(),
            tool_name: "fs:read".into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn dedupes_identical_calls_with_cached_result() {
        let mw = Arc::new(ContextFilterMiddleware::new(1000));
        let pipeline = Pipeline::new(vec![mw]);
        let mut ctx = IterationCtx::new("r", "s", "a", "t");

        let call = tool_call(json!({"path": "x"}));
        // First time: execute, then record the result.
        assert_eq!(
            pipeline.before_tool_exec(&mut ctx, &call).await.unwrap(),
            ToolDecision::Execute
        );
        ctx.messages.push(Message::tool_result("c1", "file body"));
        pipeline
            .after_tool_exec(&mut ctx, &call, &ToolOutcome::ok(json!("file body")))
            .await
            .unwrap();

        // Second time: skip with the cached content surfaced via meta.
        assert_eq!(
            pipeline.before_tool_exec(&mut ctx, &call).await.unwrap(),
            ToolDecision::Skip
        );
        assert_eq!(
            ctx.meta_get("context_filter.cached_result").and_then(|v| v.as_str()),
            Some("file body")
        );

        // Different args: cache miss.
        let other = tool_call(json!({"path": "y"}));
        assert_eq!(
            pipeline.before_tool_exec(&mut ctx, &other).await.unwrap(),
            ToolDecision::Execute
        );
    }

    #[tokio::test]
    async fn truncates_long_tool_output_in_history() {
        let pipeline = Pipeline::new(vec![Arc::new(ContextFilterMiddleware::new(10))]);
        let mut ctx = IterationCtx::new("r", "s", "a", "t");

        let call = tool_call(json!({"path": "x"}));
        let long = "a".repeat(50);
        ctx.messages.push(Message::tool_result("c1", &long));
        pipeline
            .after_tool_exec(&mut ctx, &call, &ToolOutcome::ok(json!(long)))
            .await
            .unwrap();

        match &ctx.messages.last().unwrap().content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::ToolResult { content, .. } => {
                    assert!(content.ends_with("... truncated"));
                    assert!(content.len() < 40);
                }
                other => panic!("wrong part: {other:?}"),
            },
            other => panic!("wrong content: {other:?}"),
        }
    }

    #[test]
    fn windowing_preserves_system_and_pairs() {
        let calls = vec![ToolCall {
            call_id: "c9".into(),
            tool_name: "fs:read".into(),
            arguments: json!({}),
        }];
        let mut messages = vec![Message::system("sys")];
        for i in 0..10 {
            messages.push(Message::user(format!("u{i}")));
        }
        messages.push(Message::assistant_tool_calls("calling", &calls));
        messages.push(Message::tool_result("c9", "result"));

        let windowed = window_messages(&messages, 4);
        // System prefix survives.
        assert_eq!(windowed[0].content.text(), Some("sys"));
        // The assistant tool-call message was not separated from its
        // tool result.
        let has_assistant = windowed.iter().any(|m| !m.tool_call_ids().is_empty());
        let has_result = windowed.iter().any(|m| m.answered_call_id() == Some("c9"));
        assert!(has_assistant && has_result);
    }

    #[test]
    fn windowing_is_a_noop_under_the_limit() {
        let messages = vec![Message::system("s"), Message::user("u")];
        assert_eq!(window_messages(&messages, 10).len(), 2);
    }
}
