//! Run manager — registry of active runs, durable terminal-state cache,
//! and the listener surface the gateway fans out from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use fm_domain::cancel::CancelMap;
use fm_domain::event::{AgentEvent, EventKind};
use fm_domain::run::{RunRecord, RunStatus};
use fm_domain::{Error, Result};
use fm_sessions::{EventLog, SessionStore};

use crate::bus::{EventBus, ListenerId};
use crate::correction::{
    Correction, CorrectionBox, CorrectionMiddleware, CorrectionRouter, DeepestAgentRouter,
    RoutedCorrection,
};
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::pipeline::Middleware;

pub struct RunManager {
    bus: Arc<EventBus>,
    cancel_map: Arc<CancelMap>,
    sessions: Arc<SessionStore>,
    event_log: Arc<EventLog>,
    runs_dir: PathBuf,
    active: RwLock<HashMap<String, RunRecord>>,
    corrections: Arc<CorrectionBox>,
    router: Box<dyn CorrectionRouter>,
}

impl RunManager {
    pub fn new(state_dir: &Path, bus: Arc<EventBus>) -> Result<Self> {
        let runs_dir = state_dir.join("runs");
        std::fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            bus,
            cancel_map: Arc::new(CancelMap::new()),
            sessions: Arc::new(SessionStore::new(state_dir)?),
            event_log: Arc::new(EventLog::new(state_dir)?),
            runs_dir,
            active: RwLock::new(HashMap::new()),
            corrections: Arc::new(CorrectionBox::new()),
            router: Box::new(DeepestAgentRouter),
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        self.event_log.clone()
    }

    /// The correction middleware workers should include to receive
    /// routed corrections.
    pub fn correction_middleware(&self) -> Arc<dyn Middleware> {
        Arc::new(CorrectionMiddleware::new(self.corrections.clone()))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Run lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Create a run record (status pending) bound to a session.
    pub fn create(&self, session_id: Option<&str>, task: &str) -> RunRecord {
        let (session, _) = self.sessions.resolve_or_create(session_id);
        let run_id = uuid::Uuid::new_v4().to_string();
        let run = RunRecord::new(run_id.clone(), session.session_id.clone(), task);
        self.sessions.record_run(&session.session_id, &run_id);
        self.active.write().insert(run_id, run.clone());
        run
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.active.read().contains_key(run_id) || self.terminal_path(run_id).exists()
    }

    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.active.read().get(run_id).cloned()
    }

    /// Durable, cross-process view: the active map first, then the
    /// terminal cache on disk.
    pub fn get_state(&self, run_id: &str) -> Result<RunRecord> {
        if let Some(run) = self.get(run_id) {
            return Ok(run);
        }
        let raw = std::fs::read_to_string(self.terminal_path(run_id))
            .map_err(|_| Error::RunNotFound(run_id.to_owned()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn update_status(&self, run_id: &str, status: RunStatus) {
        let session_id = {
            let mut active = self.active.write();
            let Some(run) = active.get_mut(run_id) else {
                return;
            };
            run.status = status;
            run.session_id.clone()
        };
        let _ = self.bus.emit(
            run_id,
            AgentEvent::new(EventKind::StatusChange { status }).with_session(session_id),
        );
    }

    /// Launch the orchestrator for a created run on a background task.
    pub fn start(
        self: &Arc<Self>,
        run_id: &str,
        deps: Arc<OrchestratorDeps>,
        agent_id: Option<String>,
    ) -> Result<()> {
        let run = self
            .get(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_owned()))?;
        let cancel = self.cancel_map.register(run_id);
        let manager = self.clone();
        let run_id = run_id.to_owned();

        // Persist every event of this run into the session's NDJSON log.
        self.spawn_event_persister(&run_id, &run.session_id);

        tokio::spawn(async move {
            manager.update_status(&run_id, RunStatus::Running);
            let orchestrator =
                Orchestrator::new(deps, run_id.clone(), run.session_id.clone(), cancel.clone())
                    .with_default_agent(agent_id);
            let result = orchestrator.execute(&run.task).await;

            let status = if result.aborted {
                RunStatus::Stopped
            } else if result.success {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            };

            {
                let mut active = manager.active.write();
                if let Some(run) = active.get_mut(&run_id) {
                    run.tokens_used = result.tokens_used;
                    run.summary = Some(result.answer.clone());
                    run.error = result.error.clone();
                    run.finish(status);
                }
            }
            manager.update_status(&run_id, status);
            manager.finalize(&run_id);
        });
        Ok(())
    }

    fn spawn_event_persister(&self, run_id: &str, session_id: &str) {
        let (listener, mut rx): (ListenerId, mpsc::UnboundedReceiver<AgentEvent>) =
            self.bus.add_listener(run_id);
        let event_log = self.event_log.clone();
        let bus = self.bus.clone();
        let run_id = run_id.to_owned();
        let session_id = session_id.to_owned();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = event_log.append(&session_id, &run_id, &event) {
                    tracing::warn!(error = %e, "event log append failed");
                }
                // Terminal status closes the stream.
                if matches!(event.kind, EventKind::StatusChange { status } if status.is_terminal())
                {
                    break;
                }
            }
            bus.remove_listener(&run_id, listener);
        });
    }

    /// Move a terminal run from the active map to the durable cache.
    fn finalize(&self, run_id: &str) {
        let run = self.active.write().remove(run_id);
        if let Some(run) = run {
            debug_assert!(run.status.is_terminal());
            self.sessions.record_usage(&run.session_id, 0, run.tokens_used);
            match serde_json::to_string_pretty(&run) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(self.terminal_path(run_id), json) {
                        tracing::warn!(error = %e, run_id, "failed to persist terminal run state");
                    }
                }
                Err(e) => tracing::warn!(error = %e, run_id, "failed to serialize run state"),
            }
        }
        self.cancel_map.remove(run_id);
        self.corrections.clear_run(run_id);
    }

    /// Request cancellation. The orchestrator and its workers observe
    /// the signal at their next iteration boundary.
    pub fn stop(&self, run_id: &str, _reason: Option<&str>) -> bool {
        self.cancel_map.cancel(run_id)
    }

    fn terminal_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    /// Recent runs: active first, then terminal from disk.
    pub fn list(&self, limit: usize) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.active.read().values().cloned().collect();
        if let Ok(entries) = std::fs::read_dir(&self.runs_dir) {
            for entry in entries.flatten() {
                if let Ok(raw) = std::fs::read_to_string(entry.path()) {
                    if let Ok(run) = serde_json::from_str::<RunRecord>(&raw) {
                        runs.push(run);
                    }
                }
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Corrections
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn submit_correction(
        &self,
        run_id: &str,
        message: &str,
        explicit_target: Option<&str>,
    ) -> Result<RoutedCorrection> {
        if !self.exists(run_id) {
            return Err(Error::RunNotFound(run_id.to_owned()));
        }
        let applied = self
            .get(run_id)
            .map(|run| !run.status.is_terminal())
            .unwrap_or(false);

        let events = self.bus.buffer(run_id);
        let (target, reason) = self.router.route(&events, message, explicit_target);
        let correction_id = uuid::Uuid::new_v4().to_string();
        if applied {
            self.corrections.push(run_id, Correction {
                correction_id: correction_id.clone(),
                message: message.to_owned(),
                target_agent_id: target.clone(),
            });
        }
        Ok(RoutedCorrection {
            correction_id,
            routed_to: vec![target],
            reason,
            applied,
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Listener surface (delegates to the bus)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn subscribe(&self, run_id: &str) -> (Vec<AgentEvent>, ListenerId, mpsc::UnboundedReceiver<AgentEvent>) {
        self.bus.subscribe_with_replay(run_id)
    }

    pub fn add_session_listener(
        &self,
        session_id: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<(String, AgentEvent)>) {
        self.bus.add_session_listener(session_id)
    }

    pub fn remove_listener(&self, run_id: &str, listener: ListenerId) {
        self.bus.remove_listener(run_id, listener);
    }

    pub fn remove_session_listener(&self, session_id: &str, listener: ListenerId) {
        self.bus.remove_session_listener(session_id, listener);
    }

    pub fn event_buffer(&self, run_id: &str) -> Vec<AgentEvent> {
        self.bus.buffer(run_id)
    }
}
