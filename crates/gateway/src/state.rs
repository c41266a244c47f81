//! Shared application state passed to all API handlers.

use std::sync::Arc;

use fm_domain::config::Config;
use fm_domain::llm::Tier;
use fm_runtime::manager::RunManager;
use fm_runtime::orchestrator::OrchestratorDeps;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<RunManager>,
    /// Baseline orchestrator wiring; per-run overrides derive from it.
    pub base_deps: Arc<OrchestratorDeps>,
}

impl AppState {
    /// Derive per-run orchestrator deps from the request's overrides.
    pub fn deps_for(
        &self,
        tier: Option<Tier>,
        enable_escalation: Option<bool>,
    ) -> Arc<OrchestratorDeps> {
        if tier.is_none() && enable_escalation.is_none() {
            return self.base_deps.clone();
        }

        let mut config = self.base_deps.config.clone();
        if let Some(enabled) = enable_escalation {
            config.enable_escalation = enabled;
        }
        if let Some(start) = tier {
            // Ladder restarts at the requested tier.
            config.escalation_ladder.retain(|t| *t >= start);
            if config.escalation_ladder.is_empty() {
                config.escalation_ladder = vec![start];
            }
        }

        Arc::new(OrchestratorDeps {
            registry: self.base_deps.registry.clone(),
            tools: self.base_deps.tools.clone(),
            trace_store: self.base_deps.trace_store.clone(),
            bus: self.base_deps.bus.clone(),
            verifier: self.base_deps.verifier.clone(),
            history: self.base_deps.history.clone(),
            kpi: self.base_deps.kpi.clone(),
            workspace_root: self.base_deps.workspace_root.clone(),
            state_dir: self.base_deps.state_dir.clone(),
            config,
            iteration_config: self.base_deps.iteration_config.clone(),
            middleware_toggles: self.base_deps.middleware_toggles.clone(),
            extra_middlewares: self.base_deps.extra_middlewares.clone(),
        })
    }
}
