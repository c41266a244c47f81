//! Turn assembly — folding raw agent events into user↔assistant turns.
//!
//! Rules: one assistant turn per run. Consecutive `llm:*` events of an
//! iteration fold into a single message step; `tool:start`/`tool:end`
//! (or `tool:error`) pairs fold into a tool step keyed by invocation id.
//! The terminal run status maps onto the turn status. Turn snapshots are
//! deduplicated by the signature `id:status:completedAt:steps.length`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fm_domain::event::{AgentEvent, EventKind};
use fm_domain::run::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnType {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// One step within a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnStep {
    Message {
        iteration: u32,
        content: String,
    },
    Tool {
        invocation_id: String,
        tool: String,
        completed: bool,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_preview: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    #[serde(rename = "type")]
    pub turn_type: TurnType,
    pub sequence: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TurnStatus,
    pub steps: Vec<TurnStep>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Turn {
    /// Dedup signature for `turn:snapshot` emission.
    pub fn signature(&self) -> String {
        let completed = self
            .completed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let status = match self.status {
            TurnStatus::Streaming => "streaming",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
            TurnStatus::Cancelled => "cancelled",
        };
        format!("{}:{}:{}:{}", self.id, status, completed, self.steps.len())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assembler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds one assistant turn from the event stream of a run.
pub struct TurnAssembler {
    turn: Turn,
    current_iteration: u32,
    /// Accumulated llm:chunk text for the current iteration.
    pending_text: String,
}

impl TurnAssembler {
    pub fn new(run_id: &str, sequence: u64, task: &str) -> Self {
        Self {
            turn: Turn {
                id: run_id.to_owned(),
                turn_type: TurnType::Assistant,
                sequence,
                started_at: Utc::now(),
                completed_at: None,
                status: TurnStatus::Streaming,
                steps: Vec::new(),
                metadata: serde_json::json!({ "task": task }),
            },
            current_iteration: 0,
            pending_text: String::new(),
        }
    }

    /// Fold one event into the turn. Returns true when the turn mutated
    /// (callers emit a `turn:snapshot` on mutation, deduped by signature).
    pub fn observe(&mut self, event: &AgentEvent) -> bool {
        match &event.kind {
            EventKind::IterationStart { iteration } => {
                self.current_iteration = *iteration;
                false
            }
            EventKind::LlmChunk { text } => {
                self.pending_text.push_str(text);
                false
            }
            EventKind::LlmEnd { .. } => {
                if self.pending_text.is_empty() {
                    return false;
                }
                let content = std::mem::take(&mut self.pending_text);
                // Merge consecutive message steps of the same iteration.
                if let Some(TurnStep::Message { iteration, content: existing }) =
                    self.turn.steps.last_mut()
                {
                    if *iteration == self.current_iteration {
                        existing.push_str(&content);
                        return true;
                    }
                }
                self.turn.steps.push(TurnStep::Message {
                    iteration: self.current_iteration,
                    content,
                });
                true
            }
            EventKind::ToolStart { invocation_id, tool, .. } => {
                self.turn.steps.push(TurnStep::Tool {
                    invocation_id: invocation_id.clone(),
                    tool: tool.clone(),
                    completed: false,
                    is_error: false,
                    output_preview: None,
                    duration_ms: None,
                });
                true
            }
            EventKind::ToolEnd { invocation_id, duration_ms, output_preview, .. } => {
                self.complete_tool(invocation_id, false, Some(output_preview.clone()), Some(*duration_ms))
            }
            EventKind::ToolError { invocation_id, message, .. } => {
                self.complete_tool(invocation_id, true, Some(message.clone()), None)
            }
            EventKind::StatusChange { status } => {
                match status {
                    RunStatus::Completed => self.finish(TurnStatus::Completed),
                    RunStatus::Failed => self.finish(TurnStatus::Failed),
                    RunStatus::Stopped => self.finish(TurnStatus::Cancelled),
                    RunStatus::Pending | RunStatus::Running => return false,
                }
                true
            }
            _ => false,
        }
    }

    fn complete_tool(
        &mut self,
        invocation_id: &str,
        is_error: bool,
        output_preview: Option<String>,
        duration_ms: Option<u64>,
    ) -> bool {
        for step in self.turn.steps.iter_mut().rev() {
            if let TurnStep::Tool { invocation_id: id, completed, is_error: err, output_preview: preview, duration_ms: dur, .. } = step {
                if id == invocation_id {
                    *completed = true;
                    *err = is_error;
                    *preview = output_preview;
                    *dur = duration_ms;
                    return true;
                }
            }
        }
        false
    }

    fn finish(&mut self, status: TurnStatus) {
        self.turn.status = status;
        self.turn.completed_at = Some(Utc::now());
    }

    pub fn turn(&self) -> &Turn {
        &self.turn
    }

    pub fn into_turn(self) -> Turn {
        self.turn
    }
}
