//! Orchestrator — plans subtasks, delegates to workers under a bounded
//! pool, drives the tier-escalation ladder, verifies worker output, and
//! synthesizes the final answer.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Semaphore;

use fm_domain::cancel::CancelToken;
use fm_domain::config::{IterationConfig, MiddlewareToggles, OrchestratorConfig};
use fm_domain::event::{AgentEvent, EventKind};
use fm_domain::llm::Tier;
use fm_domain::message::Message;
use fm_domain::outcome::{
    DelegatedResult, FailureKind, FailureReport, OrchestratorResult, SpecialistOutcome, SubTask,
};
use fm_providers::{ChatRequest, LlmClient, TierRegistry};
use fm_tools::ToolExecutor;
use fm_trace::{ToolTrace, TraceStore};

use crate::bus::EventBus;
use crate::truncate_str;
use crate::verifier::{cross_tier_review, CrossTierReview, KpiStore, Verifier};
use crate::worker::{Worker, WorkerConfig};

const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dependencies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything an orchestrator needs, injected at construction. All
/// cross-component lookup goes through ids, not pointer graphs.
pub struct OrchestratorDeps {
    pub registry: Arc<TierRegistry>,
    pub tools: Arc<dyn ToolExecutor>,
    pub trace_store: Arc<TraceStore>,
    pub bus: Arc<EventBus>,
    pub verifier: Arc<Verifier>,
    pub history: Option<Arc<fm_history::HistoryStore>>,
    /// Verification pass-rate baseline, when KPI tracking is enabled.
    pub kpi: Option<Arc<KpiStore>>,
    pub workspace_root: PathBuf,
    pub state_dir: PathBuf,
    pub config: OrchestratorConfig,
    pub iteration_config: IterationConfig,
    pub middleware_toggles: MiddlewareToggles,
    /// Appended to every worker's pipeline (e.g. correction delivery).
    pub extra_middlewares: Vec<Arc<dyn crate::pipeline::Middleware>>,
}

pub struct Orchestrator {
    pub deps: Arc<OrchestratorDeps>,
    pub run_id: String,
    pub session_id: String,
    pub cancel: CancelToken,
    /// Preferred specialist id for undecomposed tasks.
    pub default_agent_id: Option<String>,
}

impl Orchestrator {
    pub fn new(deps: Arc<OrchestratorDeps>, run_id: impl Into<String>, session_id: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            deps,
            run_id: run_id.into(),
            session_id: session_id.into(),
            cancel,
            default_agent_id: None,
        }
    }

    pub fn with_default_agent(mut self, agent_id: Option<String>) -> Self {
        self.default_agent_id = agent_id;
        self
    }

    fn emit(&self, kind: EventKind) {
        let event = AgentEvent::new(kind)
            .with_session(&self.session_id)
            .with_agent(ORCHESTRATOR_AGENT_ID);
        if let Err(e) = self.deps.bus.emit(&self.run_id, event) {
            tracing::warn!(error = %e, "orchestrator event emission failed");
        }
    }

    fn ladder(&self, config: &WorkerConfig) -> Vec<Tier> {
        let ladder = if config.escalation_ladder.is_empty() {
            self.deps.config.escalation_ladder.clone()
        } else {
            config.escalation_ladder.clone()
        };
        if ladder.is_empty() {
            vec![Tier::Small]
        } else {
            ladder
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Phase 1 — planning
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Decompose the task. A planning failure degrades to a single
    /// subtask covering the whole task.
    pub async fn plan(&self, task: &str) -> Vec<SubTask> {
        let fallback = || {
            vec![SubTask {
                id: "task-1".into(),
                description: task.to_owned(),
                agent_id: self
                    .default_agent_id
                    .clone()
                    .unwrap_or_else(|| "specialist-1".into()),
                priority: 1,
                dependencies: Vec::new(),
                estimated_complexity: 0.5,
            }]
        };

        let planner = match self.deps.registry.resolve(Tier::Medium) {
            Ok(client) => client,
            Err(_) => return fallback(),
        };

        let request = ChatRequest {
            messages: vec![
                Message::system(
                    "You decompose a task into subtasks for specialist agents. Respond with a JSON array only. Each element: {\"id\": string, \"description\": string, \"agent_id\": string, \"priority\": number, \"dependencies\": [subtask ids], \"estimated_complexity\": 0..1}. Use one subtask when the task is atomic.",
                ),
                Message::user(task.to_owned()),
            ],
            ..Default::default()
        };

        match planner.chat(request).await {
            Ok(response) => parse_plan(&response.content).unwrap_or_else(fallback),
            Err(e) => {
                tracing::warn!(error = %e, "planning call failed; single-subtask fallback");
                fallback()
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Phase 2+3+4 — delegation with ladder and verification
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn run_worker(&self, subtask: &SubTask, task_text: &str, tier: Tier) -> SpecialistOutcome {
        let llm = match self.deps.registry.resolve(tier) {
            Ok(client) => client,
            Err(e) => {
                return SpecialistOutcome::Failure {
                    report: FailureReport::new(FailureKind::Unknown, e.to_string()),
                    partial: None,
                    tokens_used: 0,
                    duration_ms: 0,
                };
            }
        };
        let secondary = self.deps.registry.resolve(Tier::Small).ok();

        let worker = Worker {
            llm,
            secondary_llm: secondary,
            tools: self.deps.tools.clone(),
            trace_store: self.deps.trace_store.clone(),
            bus: self.deps.bus.clone(),
            cancel: self.cancel.clone(),
            iteration_config: self.deps.iteration_config.clone(),
            middleware_toggles: self.deps.middleware_toggles.clone(),
            state_dir: self.deps.state_dir.clone(),
            history: self.deps.history.clone(),
            workspace_root: self.deps.workspace_root.clone(),
            extra_middlewares: self.deps.extra_middlewares.clone(),
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            parent_agent_id: Some(ORCHESTRATOR_AGENT_ID.to_owned()),
        };
        let config = WorkerConfig::new(&subtask.agent_id, tier);
        worker.execute(task_text, &config).await
    }

    /// Drive one subtask through the escalation ladder and the
    /// verification retry loop.
    async fn delegate_one(&self, subtask: &SubTask) -> DelegatedResult {
        let ladder = self.ladder(&WorkerConfig::new(&subtask.agent_id, Tier::Small));
        let max_retries = self.deps.config.max_retries;

        let mut tier_idx = 0usize;
        let mut retries = 0u32;
        let mut task_text = subtask.description.clone();
        let mut total_tokens = 0u64;
        let started = Instant::now();

        self.emit(EventKind::SubtaskStart {
            subtask_id: subtask.id.clone(),
            description: subtask.description.clone(),
            tier: ladder[0].to_string(),
        });

        let result = loop {
            if self.cancel.is_cancelled() {
                break self.failed_result(subtask, total_tokens, started, FailureKind::Unknown, "aborted");
            }
            let tier = ladder[tier_idx.min(ladder.len() - 1)];
            let outcome = self.run_worker(subtask, &task_text, tier).await;
            total_tokens += outcome.tokens_used();

            match outcome {
                SpecialistOutcome::Success { output, tokens_used, duration_ms } => {
                    // Phase 4: verification against trace + filesystem.
                    self.emit(EventKind::VerificationStart { subtask_id: subtask.id.clone() });
                    let trace = self
                        .deps
                        .trace_store
                        .load(&output.trace_ref)
                        .unwrap_or_else(|_| empty_trace(&self.session_id, &subtask.agent_id));
                    let verification = self.deps.verifier.verify(&output, &trace);
                    self.emit(EventKind::VerificationComplete {
                        subtask_id: subtask.id.clone(),
                        valid: verification.valid,
                        level: verification.level,
                        errors: verification.errors.clone(),
                    });

                    if verification.valid {
                        break DelegatedResult {
                            subtask_id: subtask.id.clone(),
                            agent_id: subtask.agent_id.clone(),
                            success: true,
                            output: output.summary.clone(),
                            tokens_used: total_tokens,
                            duration_ms: started.elapsed().as_millis() as u64,
                            error: None,
                            outcome: SpecialistOutcome::Success { output, tokens_used, duration_ms },
                        };
                    }

                    retries += 1;
                    if retries > max_retries {
                        break DelegatedResult {
                            subtask_id: subtask.id.clone(),
                            agent_id: subtask.agent_id.clone(),
                            success: false,
                            output: output.summary.clone(),
                            tokens_used: total_tokens,
                            duration_ms: started.elapsed().as_millis() as u64,
                            error: Some(format!(
                                "validation_failed: {}",
                                verification.errors.join("; ")
                            )),
                            outcome: SpecialistOutcome::Failure {
                                report: FailureReport::new(
                                    FailureKind::ValidationFailed,
                                    verification.errors.join("; "),
                                ),
                                partial: Some(output),
                                tokens_used,
                                duration_ms,
                            },
                        };
                    }
                    // Retry the same tier with the errors surfaced.
                    task_text = format!(
                        "{}\n\nYour previous attempt failed output verification. Fix these problems and report again:\n- {}",
                        subtask.description,
                        verification.errors.join("\n- ")
                    );
                }
                SpecialistOutcome::Escalate { reason, .. } => {
                    retries += 1;
                    if !self.deps.config.enable_escalation
                        || retries > max_retries
                        || tier_idx + 1 >= ladder.len()
                    {
                        break self.failed_result(
                            subtask,
                            total_tokens,
                            started,
                            FailureKind::Stuck,
                            &format!("escalation exhausted: {reason}"),
                        );
                    }
                    tier_idx += 1;
                    self.backoff(retries).await;
                }
                SpecialistOutcome::Failure { report, partial, tokens_used, duration_ms } => {
                    let hard_stop = !report.kind.retryable()
                        || (report.kind == FailureKind::ValidationFailed && partial.is_none());
                    retries += 1;
                    if hard_stop || retries > max_retries {
                        break DelegatedResult {
                            subtask_id: subtask.id.clone(),
                            agent_id: subtask.agent_id.clone(),
                            success: false,
                            output: partial
                                .as_ref()
                                .map(|p| p.summary.clone())
                                .unwrap_or_default(),
                            tokens_used: total_tokens,
                            duration_ms: started.elapsed().as_millis() as u64,
                            error: Some(report.message.clone()),
                            outcome: SpecialistOutcome::Failure {
                                report,
                                partial,
                                tokens_used,
                                duration_ms,
                            },
                        };
                    }
                    if self.deps.config.enable_escalation && tier_idx + 1 < ladder.len() {
                        tier_idx += 1;
                    }
                    self.backoff(retries).await;
                }
            }
        };

        self.emit(EventKind::SubtaskEnd {
            subtask_id: subtask.id.clone(),
            success: result.success,
            tier: ladder[tier_idx.min(ladder.len() - 1)].to_string(),
        });
        result
    }

    fn failed_result(
        &self,
        subtask: &SubTask,
        tokens: u64,
        started: Instant,
        kind: FailureKind,
        message: &str,
    ) -> DelegatedResult {
        DelegatedResult {
            subtask_id: subtask.id.clone(),
            agent_id: subtask.agent_id.clone(),
            success: false,
            output: String::new(),
            tokens_used: tokens,
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(message.to_owned()),
            outcome: SpecialistOutcome::Failure {
                report: FailureReport::new(kind, message),
                partial: None,
                tokens_used: tokens,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.deps.config.backoff_base_ms;
        let delay = base.saturating_mul(1u64 << (attempt.min(6)));
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }

    /// Run the plan respecting dependencies; independent subtasks run
    /// concurrently under the worker-pool cap. A failed dependency marks
    /// its dependents skipped.
    pub async fn delegate(&self, plan: &[SubTask]) -> Vec<DelegatedResult> {
        let semaphore = Arc::new(Semaphore::new(self.deps.config.max_parallel_workers.max(1)));
        let mut results: HashMap<String, DelegatedResult> = HashMap::new();
        let mut completed_ok: HashSet<String> = HashSet::new();
        let mut finished: HashSet<String> = HashSet::new();

        while finished.len() < plan.len() {
            if self.cancel.is_cancelled() {
                // Mark everything not yet finished as aborted.
                let to_abort: Vec<&SubTask> =
                    plan.iter().filter(|s| !finished.contains(&s.id)).collect();
                for subtask in to_abort {
                    finished.insert(subtask.id.clone());
                    results.insert(
                        subtask.id.clone(),
                        self.failed_result(subtask, 0, Instant::now(), FailureKind::Unknown, "aborted"),
                    );
                }
                break;
            }

            // Skip subtasks whose dependencies can no longer succeed.
            let to_check: Vec<&SubTask> =
                plan.iter().filter(|s| !finished.contains(&s.id)).collect();
            for subtask in to_check {
                let doomed = subtask
                    .dependencies
                    .iter()
                    .any(|dep| finished.contains(dep) && !completed_ok.contains(dep));
                if doomed {
                    finished.insert(subtask.id.clone());
                    results.insert(
                        subtask.id.clone(),
                        self.failed_result(
                            subtask,
                            0,
                            Instant::now(),
                            FailureKind::Unknown,
                            "skipped: dependency failed",
                        ),
                    );
                }
            }

            // Ready = all dependencies completed successfully.
            let ready: Vec<&SubTask> = plan
                .iter()
                .filter(|s| !finished.contains(&s.id))
                .filter(|s| s.dependencies.iter().all(|dep| completed_ok.contains(dep)))
                .collect();

            if ready.is_empty() {
                if finished.len() < plan.len() {
                    // Remaining subtasks form an unsatisfiable cycle.
                    let to_skip: Vec<&SubTask> =
                        plan.iter().filter(|s| !finished.contains(&s.id)).collect();
                    for subtask in to_skip {
                        finished.insert(subtask.id.clone());
                        results.insert(
                            subtask.id.clone(),
                            self.failed_result(
                                subtask,
                                0,
                                Instant::now(),
                                FailureKind::Unknown,
                                "skipped: unsatisfiable dependencies",
                            ),
                        );
                    }
                }
                break;
            }

            // One wave: run the ready set concurrently, bounded.
            let wave = futures_util::future::join_all(ready.iter().map(|subtask| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    self.delegate_one(subtask).await
                }
            }))
            .await;

            for result in wave {
                if result.success {
                    completed_ok.insert(result.subtask_id.clone());
                }
                finished.insert(result.subtask_id.clone());
                results.insert(result.subtask_id.clone(), result);
            }
        }

        // Report in plan order.
        plan.iter()
            .filter_map(|s| results.remove(&s.id))
            .collect()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Phase 5 — synthesis
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn synthesize(&self, task: &str, results: &[DelegatedResult]) -> (String, u64) {
        // Single delegated subtask: forward its answer directly.
        if results.len() == 1 {
            if let Some(result) = results.first() {
                if result.success {
                    return (result.output.clone(), 0);
                }
            }
        }

        self.emit(EventKind::SynthesisStart);

        let mut sections = Vec::new();
        for result in results {
            match (result.success, result.outcome.output()) {
                (true, Some(output)) => {
                    sections.push(format!("## {} (ok)\n{}", result.subtask_id, output.summary));
                }
                // Unrecoverable failures still contribute partials.
                (false, Some(partial)) => {
                    sections.push(format!(
                        "## {} (failed: {})\nPartial result:\n{}",
                        result.subtask_id,
                        result.error.as_deref().unwrap_or("unknown"),
                        partial.summary
                    ));
                }
                (false, None) => {
                    sections.push(format!(
                        "## {} (failed: {})",
                        result.subtask_id,
                        result.error.as_deref().unwrap_or("unknown")
                    ));
                }
                (true, None) => {}
            }
        }

        let synthesizer = match self.deps.registry.resolve(Tier::Large) {
            Ok(client) => client,
            Err(_) => {
                let joined = sections.join("\n\n");
                self.emit(EventKind::SynthesisComplete {
                    summary_preview: truncate_str(&joined, 200),
                });
                return (joined, 0);
            }
        };

        let request = ChatRequest {
            messages: vec![
                Message::system(
                    "Synthesize the subtask results into one coherent answer to the user's task. Be factual; do not invent results that are not present below.",
                ),
                Message::user(format!("Task: {task}\n\n{}", sections.join("\n\n"))),
            ],
            ..Default::default()
        };
        match synthesizer.chat(request).await {
            Ok(response) => {
                self.emit(EventKind::SynthesisComplete {
                    summary_preview: truncate_str(&response.content, 200),
                });
                (response.content, response.usage.total_tokens as u64)
            }
            Err(e) => {
                tracing::warn!(error = %e, "synthesis call failed; joining sections");
                let joined = sections.join("\n\n");
                self.emit(EventKind::SynthesisComplete {
                    summary_preview: truncate_str(&joined, 200),
                });
                (joined, 0)
            }
        }
    }

    async fn review(&self, answer: &str, results: &[DelegatedResult]) -> CrossTierReview {
        let merged = self.merged_trace(results);
        // One tier above the executors' highest tier.
        let reviewer: Option<Arc<dyn LlmClient>> =
            self.deps.registry.resolve_above(Tier::Medium).ok();
        match reviewer {
            Some(llm) => cross_tier_review(llm, answer, &merged).await,
            None => CrossTierReview::default(),
        }
    }

    fn merged_trace(&self, results: &[DelegatedResult]) -> ToolTrace {
        let mut merged = empty_trace(&self.session_id, ORCHESTRATOR_AGENT_ID);
        for result in results {
            if let Some(output) = result.outcome.output() {
                if let Ok(trace) = self.deps.trace_store.load(&output.trace_ref) {
                    merged.invocations.extend(trace.invocations);
                }
            }
        }
        merged
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // execute — all phases
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn execute(&self, task: &str) -> OrchestratorResult {
        let started = Instant::now();
        self.emit(EventKind::OrchestratorStart { task: task.to_owned() });

        let plan = self.plan(task).await;
        self.emit(EventKind::OrchestratorPlan { subtasks: plan.clone() });

        let results = self.delegate(&plan).await;
        let aborted = self.cancel.is_cancelled();

        let completed_count = results.iter().filter(|r| r.success).count();
        let failed_count = results.len() - completed_count;
        let mut tokens_used: u64 = results.iter().map(|r| r.tokens_used).sum();

        let (answer, synthesis_tokens) = if aborted {
            ("aborted".to_owned(), 0)
        } else {
            self.synthesize(task, &results).await
        };
        tokens_used += synthesis_tokens;

        let review = if aborted {
            CrossTierReview::default()
        } else {
            self.review(&answer, &results).await
        };
        self.emit(EventKind::OrchestratorAnswer {
            answer: answer.clone(),
            confidence: review.confidence,
            completeness: review.completeness,
            gaps: review.gaps.clone(),
            unverified_mentions: review.unverified_mentions.clone(),
        });

        // Fold this run's verification pass rate into the KPI baseline.
        if let Some(kpi) = &self.deps.kpi {
            let summary = self.deps.verifier.metrics_summary();
            if summary.total > 0 {
                kpi.record(
                    &KpiStore::baseline_key(&self.deps.workspace_root),
                    summary.pass_rate,
                );
            }
        }

        let success = !aborted && completed_count > 0 && failed_count == 0;
        self.emit(EventKind::OrchestratorEnd {
            success,
            completed_count,
            failed_count,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        OrchestratorResult {
            success,
            answer,
            plan,
            delegated_results: results,
            tokens_used,
            duration_ms: started.elapsed().as_millis() as u64,
            aborted,
            error: if success || aborted {
                None
            } else {
                Some(format!("{failed_count} subtask(s) failed"))
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn empty_trace(session_id: &str, specialist_id: &str) -> ToolTrace {
    ToolTrace {
        trace_id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.to_owned(),
        specialist_id: specialist_id.to_owned(),
        invocations: Vec::new(),
        created_at: chrono::Utc::now(),
        completed_at: Some(chrono::Utc::now()),
    }
}

/// Parse the planner's JSON array, tolerating fences and prose.
fn parse_plan(content: &str) -> Option<Vec<SubTask>> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    let parsed: Vec<SubTask> = serde_json::from_str::<Vec<Value>>(&content[start..=end])
        .ok()?
        .into_iter()
        .enumerate()
        .filter_map(|(i, v)| {
            let description = v.get("description")?.as_str()?.to_owned();
            Some(SubTask {
                id: v
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("task-{}", i + 1)),
                description,
                agent_id: v
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("specialist-{}", i + 1)),
                priority: v.get("priority").and_then(Value::as_u64).unwrap_or(1) as u32,
                dependencies: v
                    .get("dependencies")
                    .and_then(Value::as_array)
                    .map(|deps| {
                        deps.iter()
                            .filter_map(|d| d.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default(),
                estimated_complexity: v
                    .get("estimated_complexity")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.5),
            })
        })
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}
