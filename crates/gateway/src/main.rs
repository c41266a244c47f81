use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fm_domain::config::{Config, ConfigSeverity};
use fm_gateway::api;
use fm_gateway::state::AppState;
use fm_history::HistoryStore;
use fm_providers::TierRegistry;
use fm_runtime::bus::EventBus;
use fm_runtime::manager::RunManager;
use fm_runtime::orchestrator::OrchestratorDeps;
use fm_runtime::verifier::{KpiStore, Verifier};
use fm_tools::registry::ReportTool;
use fm_tools::ToolRegistry;
use fm_trace::TraceStore;

#[derive(Debug, Parser)]
#[command(name = "foreman", about = "Foreman agent runtime gateway")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "foreman.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli.config)?;
    run_server(Arc::new(config)).await
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fm_gateway=debug,fm_runtime=debug")),
        )
        .init();
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    let config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Config::from_toml(&raw)?
    } else {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        Config::default()
    };

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }
    Ok(config)
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("foreman starting");

    let state_dir = config.paths.state_dir.clone();
    std::fs::create_dir_all(&state_dir)?;
    let workspace_root = config
        .paths
        .workspace_root
        .canonicalize()
        .with_context(|| format!("workspace root {}", config.paths.workspace_root.display()))?;

    // ── Core services ────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());
    let manager = Arc::new(RunManager::new(&state_dir, bus.clone())?);
    let registry = Arc::new(TierRegistry::from_config(&config.llm)?);
    if registry.is_empty() {
        tracing::warn!("no LLM tiers configured; runs will fail until llm.tiers is set");
    }

    let mut tools = ToolRegistry::builtin(&workspace_root, &config.tools);
    tools.register(Arc::new(ReportTool));

    // Bound the snapshot store before taking new runs.
    let history = Arc::new(HistoryStore::new(&state_dir));
    let retention: fm_history::RetentionPolicy = (&config.history).into();
    match fm_history::retention::prune(&history, &retention) {
        Ok(0) => {}
        Ok(pruned) => tracing::info!(pruned, "file-history retention pruned sessions"),
        Err(e) => tracing::warn!(error = %e, "file-history retention failed"),
    }

    let base_deps = Arc::new(OrchestratorDeps {
        registry,
        tools: Arc::new(tools),
        trace_store: Arc::new(TraceStore::new(&state_dir)?),
        bus,
        verifier: Arc::new(Verifier::new(&workspace_root)),
        history: Some(history),
        kpi: Some(Arc::new(KpiStore::new(&state_dir))),
        workspace_root,
        state_dir,
        config: config.orchestrator.clone(),
        iteration_config: config.iteration.clone(),
        middleware_toggles: config.middleware.clone(),
        extra_middlewares: vec![manager.correction_middleware()],
    });

    let state = AppState {
        config: config.clone(),
        manager,
        base_deps,
    };

    // ── HTTP server ──────────────────────────────────────────────────
    let cors = if config.server.cors_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any)
    };

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
