//! `agent run` — drive a task locally without the gateway.

use std::sync::Arc;

use fm_domain::cancel::CancelToken;
use fm_domain::config::Config;
use fm_domain::llm::Tier;
use fm_domain::outcome::SpecialistOutcome;
use fm_history::HistoryStore;
use fm_providers::{ChatResponse, LlmClient, ScriptedClient, TierRegistry};
use fm_runtime::bus::EventBus;
use fm_runtime::orchestrator::{Orchestrator, OrchestratorDeps};
use fm_runtime::verifier::{KpiStore, Verifier};
use fm_runtime::worker::{Worker, WorkerConfig};
use fm_tools::registry::ReportTool;
use fm_tools::ToolRegistry;
use fm_trace::TraceStore;

pub struct RunArgs {
    pub task: String,
    pub mode: String,
    pub session_id: Option<String>,
    pub tier: Option<String>,
    pub dry_run: bool,
    pub verbose: bool,
    pub print_trace: bool,
}

fn registry_for(config: &Config, dry_run: bool) -> anyhow::Result<Arc<TierRegistry>> {
    if dry_run {
        // Offline: a scripted client that immediately answers.
        let mut registry = TierRegistry::new();
        let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(
            "dry-run",
            vec![ChatResponse::text("dry run: no model was called").with_usage(1, 1)],
        ));
        registry.register(Tier::Small, client);
        return Ok(Arc::new(registry));
    }
    let registry = TierRegistry::from_config(&config.llm)?;
    if registry.is_empty() {
        anyhow::bail!("no llm.tiers configured; add one to foreman.toml or pass --dry-run");
    }
    Ok(Arc::new(registry))
}

pub async fn run(config: &Config, args: RunArgs) -> anyhow::Result<()> {
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init()
            .ok();
    }

    let state_dir = config.paths.state_dir.clone();
    std::fs::create_dir_all(&state_dir)?;
    let workspace_root = config.paths.workspace_root.canonicalize()?;

    let registry = registry_for(config, args.dry_run)?;
    let mut tools = ToolRegistry::builtin(&workspace_root, &config.tools);
    tools.register(Arc::new(ReportTool));

    let bus = Arc::new(EventBus::new());
    let trace_store = Arc::new(TraceStore::new(&state_dir)?);
    let session_id = args
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let run_id = uuid::Uuid::new_v4().to_string();

    let mut orchestrator_config = config.orchestrator.clone();
    if let Some(tier) = args.tier.as_deref() {
        let start: Tier = tier.parse()?;
        orchestrator_config.escalation_ladder.retain(|t| *t >= start);
        if orchestrator_config.escalation_ladder.is_empty() {
            orchestrator_config.escalation_ladder = vec![start];
        }
    }

    let deps = Arc::new(OrchestratorDeps {
        registry,
        tools: Arc::new(tools),
        trace_store: trace_store.clone(),
        bus: bus.clone(),
        verifier: Arc::new(Verifier::new(&workspace_root)),
        history: Some(Arc::new(HistoryStore::new(&state_dir))),
        kpi: Some(Arc::new(KpiStore::new(&state_dir))),
        workspace_root: workspace_root.clone(),
        state_dir: state_dir.clone(),
        config: orchestrator_config,
        iteration_config: config.iteration.clone(),
        middleware_toggles: config.middleware.clone(),
        extra_middlewares: Vec::new(),
    });

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrl_c_handler(cancel);
    }

    let (answer, success) = match args.mode.as_str() {
        "orchestrator" => {
            let orchestrator = Orchestrator::new(deps.clone(), &run_id, &session_id, cancel);
            let result = orchestrator.execute(&args.task).await;
            if args.verbose {
                for delegated in &result.delegated_results {
                    eprintln!(
                        "subtask {} ({}): {}",
                        delegated.subtask_id,
                        delegated.agent_id,
                        if delegated.success { "ok" } else { "failed" }
                    );
                }
            }
            (result.answer, result.success)
        }
        "single" => {
            let tier = args
                .tier
                .as_deref()
                .map(str::parse::<Tier>)
                .transpose()?
                .unwrap_or(Tier::Small);
            let worker = Worker {
                llm: deps.registry.resolve(tier)?,
                secondary_llm: None,
                tools: deps.tools.clone(),
                trace_store: trace_store.clone(),
                bus: bus.clone(),
                cancel,
                iteration_config: deps.iteration_config.clone(),
                middleware_toggles: deps.middleware_toggles.clone(),
                state_dir: state_dir.clone(),
                history: deps.history.clone(),
                workspace_root,
                extra_middlewares: Vec::new(),
                run_id: run_id.clone(),
                session_id: session_id.clone(),
                parent_agent_id: None,
            };
            let outcome = worker
                .execute(&args.task, &WorkerConfig::new("specialist-1", tier))
                .await;
            match outcome {
                SpecialistOutcome::Success { output, .. } => (output.summary, true),
                SpecialistOutcome::Failure { report, partial, .. } => {
                    let answer = partial
                        .map(|p| p.summary)
                        .unwrap_or_else(|| report.message.clone());
                    (answer, false)
                }
                SpecialistOutcome::Escalate { reason, .. } => {
                    (format!("worker requested escalation: {reason}"), false)
                }
            }
        }
        other => anyhow::bail!("unknown mode '{other}' (use orchestrator or single)"),
    };

    println!("{answer}");

    if args.print_trace {
        for trace in trace_store.by_session(&session_id) {
            eprintln!("\ntrace {} ({}):", trace.trace_id, trace.specialist_id);
            for invocation in &trace.invocations {
                eprintln!(
                    "  {:<24} {:<8} {}ms",
                    invocation.tool,
                    format!("{:?}", invocation.status).to_lowercase(),
                    invocation.duration_ms.unwrap_or(0),
                );
            }
        }
    }

    if success {
        Ok(())
    } else {
        anyhow::bail!("run did not succeed")
    }
}

fn ctrl_c_handler(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling run");
            cancel.cancel();
        }
    });
}
