//! Agent event wire schema.
//!
//! Every component emits [`AgentEvent`]s into the event bus. Within a run,
//! `seq` is a strictly monotonic integer assigned by the bus at emit time.
//! `agent_id` / `parent_agent_id` form a forest; the root has no parent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::Usage;
use crate::outcome::SubTask;
use crate::run::RunStatus;

/// Envelope shared by every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Strictly monotonic per run, assigned by the bus at emit time.
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl AgentEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            session_id: None,
            task_id: None,
            agent_id: None,
            parent_agent_id: None,
            kind,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_parent(mut self, parent_agent_id: impl Into<String>) -> Self {
        self.parent_agent_id = Some(parent_agent_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// The exhaustive set of event types, discriminated by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "agent:start")]
    AgentStart { task: String },
    #[serde(rename = "agent:end")]
    AgentEnd { outcome: String, duration_ms: u64 },
    #[serde(rename = "agent:error")]
    AgentError { message: String },

    #[serde(rename = "iteration:start")]
    IterationStart { iteration: u32 },
    #[serde(rename = "iteration:end")]
    IterationEnd { iteration: u32, total_tokens: u64 },

    #[serde(rename = "llm:start")]
    LlmStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    #[serde(rename = "llm:chunk")]
    LlmChunk { text: String },
    #[serde(rename = "llm:end")]
    LlmEnd { usage: Usage },

    #[serde(rename = "tool:start")]
    ToolStart {
        invocation_id: String,
        tool: String,
        args_preview: String,
    },
    #[serde(rename = "tool:end")]
    ToolEnd {
        invocation_id: String,
        tool: String,
        duration_ms: u64,
        output_preview: String,
    },
    #[serde(rename = "tool:error")]
    ToolError {
        invocation_id: String,
        tool: String,
        message: String,
    },

    #[serde(rename = "orchestrator:start")]
    OrchestratorStart { task: String },
    #[serde(rename = "orchestrator:plan")]
    OrchestratorPlan { subtasks: Vec<SubTask> },
    #[serde(rename = "orchestrator:answer")]
    OrchestratorAnswer {
        answer: String,
        confidence: f64,
        completeness: f64,
        gaps: Vec<String>,
        unverified_mentions: Vec<String>,
    },
    #[serde(rename = "orchestrator:end")]
    OrchestratorEnd {
        success: bool,
        completed_count: usize,
        failed_count: usize,
        duration_ms: u64,
    },

    #[serde(rename = "subtask:start")]
    SubtaskStart {
        subtask_id: String,
        description: String,
        tier: String,
    },
    #[serde(rename = "subtask:end")]
    SubtaskEnd {
        subtask_id: String,
        success: bool,
        tier: String,
    },

    #[serde(rename = "synthesis:forced")]
    SynthesisForced,
    #[serde(rename = "synthesis:start")]
    SynthesisStart,
    #[serde(rename = "synthesis:complete")]
    SynthesisComplete { summary_preview: String },

    #[serde(rename = "memory:read")]
    MemoryRead { entries: usize },
    #[serde(rename = "memory:write")]
    MemoryWrite { entries: usize },

    #[serde(rename = "verification:start")]
    VerificationStart { subtask_id: String },
    #[serde(rename = "verification:complete")]
    VerificationComplete {
        subtask_id: String,
        valid: bool,
        level: u8,
        errors: Vec<String>,
    },

    #[serde(rename = "progress:update")]
    ProgressUpdate {
        iterations_since_progress: u32,
        stuck: bool,
        loop_detected: bool,
    },

    #[serde(rename = "status:change")]
    StatusChange { status: RunStatus },
}

impl EventKind {
    /// Wire name of this event type (the serde `type` tag).
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::AgentStart { .. } => "agent:start",
            EventKind::AgentEnd { .. } => "agent:end",
            EventKind::AgentError { .. } => "agent:error",
            EventKind::IterationStart { .. } => "iteration:start",
            EventKind::IterationEnd { .. } => "iteration:end",
            EventKind::LlmStart { .. } => "llm:start",
            EventKind::LlmChunk { .. } => "llm:chunk",
            EventKind::LlmEnd { .. } => "llm:end",
            EventKind::ToolStart { .. } => "tool:start",
            EventKind::ToolEnd { .. } => "tool:end",
            EventKind::ToolError { .. } => "tool:error",
            EventKind::OrchestratorStart { .. } => "orchestrator:start",
            EventKind::OrchestratorPlan { .. } => "orchestrator:plan",
            EventKind::OrchestratorAnswer { .. } => "orchestrator:answer",
            EventKind::OrchestratorEnd { .. } => "orchestrator:end",
            EventKind::SubtaskStart { .. } => "subtask:start",
            EventKind::SubtaskEnd { .. } => "subtask:end",
            EventKind::SynthesisForced => "synthesis:forced",
            EventKind::SynthesisStart => "synthesis:start",
            EventKind::SynthesisComplete { .. } => "synthesis:complete",
            EventKind::MemoryRead { .. } => "memory:read",
            EventKind::MemoryWrite { .. } => "memory:write",
            EventKind::VerificationStart { .. } => "verification:start",
            EventKind::VerificationComplete { .. } => "verification:complete",
            EventKind::ProgressUpdate { .. } => "progress:update",
            EventKind::StatusChange { .. } => "status:change",
        }
    }
}
