//! Scripted LLM client for tests and `--dry-run`.
//!
//! Responses are popped in order; when the script runs dry the client
//! returns a fixed final answer so loops always terminate.

use std::collections::VecDeque;

use parking_lot::Mutex;

use fm_domain::Result;

use crate::{ChatRequest, ChatResponse, LlmClient};

pub struct ScriptedClient {
    id: String,
    script: Mutex<VecDeque<ChatResponse>>,
    /// Requests observed, for assertions.
    seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    pub fn new(id: impl Into<String>, responses: Vec<ChatResponse>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// An empty script: every call returns a canned final answer.
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, Vec::new())
    }

    pub fn push(&self, response: ChatResponse) {
        self.script.lock().push_back(response);
    }

    pub fn requests_seen(&self) -> usize {
        self.seen.lock().len()
    }

    /// Snapshot of the N-th request's messages, for assertions.
    pub fn request(&self, n: usize) -> Option<ChatRequest> {
        self.seen.lock().get(n).cloned()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedClient {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.seen.lock().push(req);
        let next = self.script.lock().pop_front();
        Ok(next.unwrap_or_else(|| {
            ChatResponse::text("(scripted client exhausted)").with_usage(1, 1)
        }))
    }

    fn client_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_domain::message::ToolCall;

    #[tokio::test]
    async fn pops_responses_in_order() {
        let client = ScriptedClient::new(
            "mock",
            vec![
                ChatResponse::tools(vec![ToolCall {
                    call_id: "c1".into(),
                    tool_name: "fs:read".into(),
                    arguments: serde_json::json!({"path": "x"}),
                }]),
                ChatResponse::text("done"),
            ],
        );

        let first = client.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(first.tool_calls.len(), 1);

        let second = client.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(second.content, "done");

        // Exhausted: canned answer, not an error.
        let third = client.chat(ChatRequest::default()).await.unwrap();
        assert!(third.content.contains("exhausted"));
        assert_eq!(client.requests_seen(), 3);
    }
}
