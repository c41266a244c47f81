//! Worker agent — composes trace, pipeline, and iteration loop for one
//! subtask and exposes a structured outcome.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fm_domain::cancel::CancelToken;
use fm_domain::claim::SpecialistOutput;
use fm_domain::config::{IterationConfig, MiddlewareToggles};
use fm_domain::event::{AgentEvent, EventKind};
use fm_domain::llm::Tier;
use fm_domain::message::{Message, Role, ToolDefinition};
use fm_domain::outcome::{FailureKind, FailureReport, SpecialistOutcome};
use fm_history::HistoryStore;
use fm_providers::LlmClient;
use fm_tools::{ToolExecutor, ToolOutcome};
use fm_trace::{trace_ref, ToolRecorder, TraceStore};

use crate::bus::EventBus;
use crate::iteration::{IterationLoop, LoopEnd, LoopResult, StopCode};
use crate::middlewares::standard_stack;
use crate::pipeline::{IterationCtx, Middleware, Pipeline};
use crate::snapshots::SnapshottingExecutor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool strategy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolGroup {
    pub name: String,
    /// Exact tool names in this group.
    pub tools: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<String>,
    /// Usable only after a tool of the named group ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_after: Option<String>,
    /// Usable once reported confidence drops below this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_when_confidence_below: Option<f64>,
}

/// How the loop filters the permitted tool set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ToolStrategy {
    #[default]
    Unrestricted,
    Prioritized { groups: Vec<ToolGroup> },
    Gated { groups: Vec<ToolGroup> },
}

impl ToolStrategy {
    /// Hint lines injected into the system prompt (prioritized mode).
    fn hints(&self) -> Vec<String> {
        match self {
            ToolStrategy::Prioritized { groups } => {
                let mut sorted: Vec<&ToolGroup> = groups.iter().collect();
                sorted.sort_by_key(|g| g.priority);
                sorted
                    .iter()
                    .filter_map(|g| g.hints.as_ref().map(|h| format!("[{}] {h}", g.name)))
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Wraps the base executor to apply the strategy's filtering. Gating
/// state lives for one run only.
struct StrategyExecutor {
    inner: Arc<dyn ToolExecutor>,
    strategy: ToolStrategy,
    state: Mutex<StrategyState>,
}

#[derive(Default)]
struct StrategyState {
    used_groups: HashSet<String>,
    confidence: f64,
}

impl StrategyExecutor {
    fn new(inner: Arc<dyn ToolExecutor>, strategy: ToolStrategy) -> Self {
        Self {
            inner,
            strategy,
            state: Mutex::new(StrategyState { used_groups: HashSet::new(), confidence: 1.0 }),
        }
    }

    fn group_of<'a>(groups: &'a [ToolGroup], tool: &str) -> Option<&'a ToolGroup> {
        groups.iter().find(|g| g.tools.iter().any(|t| t == tool))
    }

    fn group_unlocked(&self, group: &ToolGroup) -> bool {
        let state = self.state.lock();
        if let Some(after) = &group.unlock_after {
            if !state.used_groups.contains(after) {
                // A confidence gate can open the group early.
                return group
                    .unlock_when_confidence_below
                    .map(|limit| state.confidence < limit)
                    .unwrap_or(false);
            }
        }
        if let (Some(limit), None) = (group.unlock_when_confidence_below, group.unlock_after.as_ref()) {
            return state.confidence < limit;
        }
        true
    }

    fn tool_available(&self, tool: &str) -> bool {
        match &self.strategy {
            ToolStrategy::Unrestricted | ToolStrategy::Prioritized { .. } => true,
            ToolStrategy::Gated { groups } => match Self::group_of(groups, tool) {
                Some(group) => self.group_unlocked(group),
                // Ungrouped tools (report included) stay available.
                None => true,
            },
        }
    }

    fn note_use(&self, tool: &str) {
        let groups = match &self.strategy {
            ToolStrategy::Gated { groups } | ToolStrategy::Prioritized { groups } => groups,
            ToolStrategy::Unrestricted => return,
        };
        if let Some(group) = Self::group_of(groups, tool) {
            self.state.lock().used_groups.insert(group.name.clone());
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for StrategyExecutor {
    async fn execute(&self, name: &str, input: &Value, cancel: &CancelToken) -> ToolOutcome {
        if !self.tool_available(name) {
            return ToolOutcome::fail(
                "policy_denied",
                format!("tool '{name}' is gated and not yet unlocked"),
            );
        }
        let outcome = self.inner.execute(name, input, cancel).await;
        if outcome.success {
            self.note_use(name);
        }
        outcome
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.inner.definitions();
        match &self.strategy {
            ToolStrategy::Unrestricted => defs,
            ToolStrategy::Prioritized { groups } => {
                // Order by group priority; ungrouped tools go last.
                defs.sort_by_key(|d| {
                    Self::group_of(groups, &d.name)
                        .map(|g| g.priority)
                        .unwrap_or(u32::MAX)
                });
                defs
            }
            ToolStrategy::Gated { groups } => {
                defs.retain(|d| match Self::group_of(groups, &d.name) {
                    Some(group) => self.group_unlocked(group),
                    None => true,
                });
                defs
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub agent_id: String,
    pub tier: Tier,
    pub temperature: Option<f32>,
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u64>,
    pub tool_strategy: ToolStrategy,
    /// Tiers tried on failure, in order. Empty = orchestrator default.
    pub escalation_ladder: Vec<Tier>,
    pub system_prompt: Option<String>,
}

impl WorkerConfig {
    pub fn new(agent_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            agent_id: agent_id.into(),
            tier,
            temperature: None,
            max_iterations: None,
            max_tokens: None,
            tool_strategy: ToolStrategy::Unrestricted,
            escalation_ladder: Vec::new(),
            system_prompt: None,
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a specialist agent. Work the task with the available tools, verify what you claim, and finish by calling the report tool with your answer and explicit claims for every file you changed.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Worker {
    pub llm: Arc<dyn LlmClient>,
    pub secondary_llm: Option<Arc<dyn LlmClient>>,
    pub tools: Arc<dyn ToolExecutor>,
    pub trace_store: Arc<TraceStore>,
    pub bus: Arc<EventBus>,
    pub cancel: CancelToken,
    pub iteration_config: IterationConfig,
    pub middleware_toggles: MiddlewareToggles,
    /// Root for per-session persistence (fact sheets).
    pub state_dir: PathBuf,
    /// File-history capture around mutating tools, when enabled.
    pub history: Option<Arc<HistoryStore>>,
    pub workspace_root: PathBuf,
    /// Caller-supplied middlewares appended to the standard stack
    /// (e.g. correction delivery).
    pub extra_middlewares: Vec<Arc<dyn Middleware>>,
    pub run_id: String,
    pub session_id: String,
    pub parent_agent_id: Option<String>,
}

impl Worker {
    fn emit(&self, agent_id: &str, kind: EventKind) {
        let mut event = AgentEvent::new(kind)
            .with_session(&self.session_id)
            .with_agent(agent_id);
        if let Some(parent) = &self.parent_agent_id {
            event = event.with_parent(parent.clone());
        }
        let _ = self.bus.emit(&self.run_id, event);
    }

    /// Execute one task to a structured outcome. Never panics, never
    /// throws: every failure is folded into the outcome union.
    pub async fn execute(&self, task: &str, config: &WorkerConfig) -> SpecialistOutcome {
        let started = Instant::now();

        let trace_id = match self.trace_store.create(&self.session_id, &config.agent_id) {
            Ok(trace_id) => trace_id,
            Err(e) => {
                return SpecialistOutcome::Failure {
                    report: FailureReport::new(FailureKind::Unknown, format!("trace create failed: {e}")),
                    partial: None,
                    tokens_used: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        // Strategy filter, then history capture, then the recorder so
        // every executed call is traced.
        let mut executor: Arc<dyn ToolExecutor> =
            Arc::new(StrategyExecutor::new(self.tools.clone(), config.tool_strategy.clone()));
        if let Some(store) = &self.history {
            executor = Arc::new(SnapshottingExecutor::new(
                executor,
                store.clone(),
                self.workspace_root.clone(),
                &self.session_id,
                &config.agent_id,
            ));
        }
        let recorder: Arc<dyn ToolExecutor> = Arc::new(ToolRecorder::new(
            self.trace_store.clone(),
            trace_id.clone(),
            executor,
        ));

        let mut stack = standard_stack(
            &self.middleware_toggles,
            &self.iteration_config,
            self.bus.clone(),
            self.state_dir.join("sessions"),
            self.secondary_llm.clone(),
        );
        stack.extend(self.extra_middlewares.iter().cloned());
        let pipeline = Pipeline::new(stack);

        self.emit(&config.agent_id, EventKind::AgentStart { task: task.to_owned() });

        let mut system_prompt = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());
        for hint in config.tool_strategy.hints() {
            system_prompt.push_str("\n");
            system_prompt.push_str(&hint);
        }

        let mut ctx = IterationCtx::new(&self.run_id, &self.session_id, &config.agent_id, task);
        ctx.parent_agent_id = self.parent_agent_id.clone();
        ctx.max_iterations = config.max_iterations.unwrap_or(self.iteration_config.max_iterations);
        ctx.max_tokens = config.max_tokens.unwrap_or(self.iteration_config.max_tokens);
        ctx.messages = vec![Message::system(system_prompt), Message::user(task)];

        let runner = IterationLoop {
            llm: self.llm.clone(),
            tools: recorder,
            pipeline,
            bus: self.bus.clone(),
            cancel: self.cancel.clone(),
            temperature: config.temperature,
            model: None,
            hard_limit_ratio: self.iteration_config.hard_limit_ratio,
            force_synthesis_on_hard_limit: self.iteration_config.force_synthesis_on_hard_limit,
        };

        let result = runner.run(&mut ctx).await;

        if let Err(e) = self.trace_store.complete(&trace_id) {
            tracing::warn!(error = %e, trace_id, "failed to complete trace");
        }

        let outcome = self.build_outcome(&trace_id, &ctx, result, started);
        let outcome_label = match &outcome {
            SpecialistOutcome::Success { .. } => "success",
            SpecialistOutcome::Failure { .. } => "failure",
            SpecialistOutcome::Escalate { .. } => "escalate",
        };
        self.emit(&config.agent_id, EventKind::AgentEnd {
            outcome: outcome_label.to_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        outcome
    }

    fn build_outcome(
        &self,
        trace_id: &str,
        ctx: &IterationCtx,
        result: LoopResult,
        started: Instant,
    ) -> SpecialistOutcome {
        let tokens_used = result.usage.total_tokens as u64;
        let duration_ms = started.elapsed().as_millis() as u64;
        let reference = trace_ref(trace_id);

        // Best partial we can offer: the answer, or the last assistant
        // text in the history.
        let partial_summary = result.answer.clone().or_else(|| {
            ctx.messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(|m| m.content.extract_all_text())
                .filter(|t| !t.is_empty())
        });
        let partial = partial_summary.clone().map(|summary| {
            let mut output = SpecialistOutput::new(summary, reference.clone());
            output.claims = result.claims.clone();
            output
        });

        match result.end {
            LoopEnd::Escalated(reason) => SpecialistOutcome::Escalate {
                reason,
                tokens_used,
                duration_ms,
            },
            LoopEnd::Stopped(code) => match code {
                StopCode::ReportComplete | StopCode::NoToolCalls => {
                    let mut output = SpecialistOutput::new(
                        result.answer.unwrap_or_else(|| "(no answer produced)".to_owned()),
                        reference,
                    );
                    output.claims = result.claims;
                    SpecialistOutcome::Success { output, tokens_used, duration_ms }
                }
                StopCode::HardTokenLimit => match result.answer {
                    // Forced synthesis produced a usable summary.
                    Some(answer) => {
                        let mut output = SpecialistOutput::new(answer, reference);
                        output.claims = result.claims;
                        SpecialistOutcome::Success { output, tokens_used, duration_ms }
                    }
                    None => SpecialistOutcome::Failure {
                        report: FailureReport::new(
                            FailureKind::PolicyDenied,
                            "hard token limit reached without a final answer",
                        ),
                        partial,
                        tokens_used,
                        duration_ms,
                    },
                },
                StopCode::MaxIterations => SpecialistOutcome::Failure {
                    report: FailureReport::new(FailureKind::Stuck, "iteration budget exhausted"),
                    partial,
                    tokens_used,
                    duration_ms,
                },
                StopCode::LoopDetected => SpecialistOutcome::Failure {
                    report: FailureReport::new(FailureKind::Stuck, "repeating tool-call loop detected"),
                    partial,
                    tokens_used,
                    duration_ms,
                },
                StopCode::AbortSignal => SpecialistOutcome::Failure {
                    report: FailureReport::new(FailureKind::Unknown, "aborted"),
                    partial,
                    tokens_used,
                    duration_ms,
                },
                StopCode::IterationError => {
                    let message = result.error.unwrap_or_else(|| "iteration error".to_owned());
                    let kind = if message.contains("timeout") {
                        FailureKind::Timeout
                    } else {
                        FailureKind::Unknown
                    };
                    SpecialistOutcome::Failure {
                        report: FailureReport::new(kind, message),
                        partial,
                        tokens_used,
                        duration_ms,
                    }
                }
            },
        }
    }
}
