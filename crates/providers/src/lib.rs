//! LLM client abstraction and tier registry.
//!
//! The runtime treats the model as a black box behind [`LlmClient`].
//! Concrete clients are tier-tagged (`small`/`medium`/`large`); the
//! orchestrator resolves a tier to a client through the [`TierRegistry`].

pub mod mock;
pub mod openai_compat;
pub mod registry;

use fm_domain::llm::{StopReason, Usage};
use fm_domain::message::{Message, ToolCall, ToolDefinition};
use fm_domain::Result;

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model identifier override. When `None`, the client uses its default.
    pub model: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content of the response (may be empty alongside tool calls).
    pub content: String,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for this call.
    pub usage: Usage,
    /// Why the model stopped.
    pub stop_reason: StopReason,
}

impl ChatResponse {
    /// Plain final answer with no tool calls.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            stop_reason: StopReason::EndTurn,
        }
    }

    /// Response requesting the given tool calls.
    pub fn tools(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
        }
    }

    pub fn with_usage(mut self, prompt: u32, completion: u32) -> Self {
        self.usage = Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        };
        self
    }
}

/// Trait every LLM adapter implements.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// A unique identifier for this client instance.
    fn client_id(&self) -> &str;
}

pub use mock::ScriptedClient;
pub use openai_compat::OpenAiCompatClient;
pub use registry::TierRegistry;
