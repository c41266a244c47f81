//! Run API endpoints.
//!
//! - `POST /v1/plugins/agents/run`              — submit a task
//! - `GET  /v1/plugins/agents/run/:runId`       — current run status
//! - `POST /v1/plugins/agents/run/:runId/correct` — route a correction
//! - `POST /v1/plugins/agents/run/:runId/stop`  — request cancellation
//! - `GET  /v1/plugins/agents/runs`             — recent runs

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use fm_domain::llm::Tier;
use fm_domain::run::RunRecord;

use super::api_error;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/plugins/agents/run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRunRequest {
    pub task: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub enable_escalation: Option<bool>,
}

pub async fn submit_run(
    State(state): State<AppState>,
    Json(body): Json<SubmitRunRequest>,
) -> impl IntoResponse {
    if body.task.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "task must not be empty");
    }
    let tier = match body.tier.as_deref().map(str::parse::<Tier>) {
        Some(Ok(tier)) => Some(tier),
        Some(Err(e)) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
        None => None,
    };

    let run = state.manager.create(body.session_id.as_deref(), &body.task);
    let deps = state.deps_for(tier, body.enable_escalation);
    if let Err(e) = state.manager.start(&run.run_id, deps, body.agent_id.clone()) {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "runId": run.run_id,
            "sessionId": run.session_id,
            "eventsUrl": format!("/v1/ws/plugins/agents/events/{}", run.run_id),
            "status": run.status,
            "startedAt": run.started_at,
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/plugins/agents/run/:runId
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn run_payload(run: &RunRecord) -> serde_json::Value {
    json!({
        "runId": run.run_id,
        "sessionId": run.session_id,
        "task": run.task,
        "status": run.status,
        "startedAt": run.started_at,
        "completedAt": run.completed_at,
        "summary": run.summary,
        "error": run.error,
        "tokensUsed": run.tokens_used,
        "durationMs": run.duration_ms,
    })
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.get_state(&run_id) {
        Ok(run) => Json(run_payload(&run)).into_response(),
        Err(_) => api_error(StatusCode::NOT_FOUND, format!("run {run_id} not found")),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/plugins/agents/run/:runId/correct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectRequest {
    pub message: String,
    #[serde(default)]
    pub target_agent_id: Option<String>,
}

pub async fn correct_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<CorrectRequest>,
) -> impl IntoResponse {
    match state
        .manager
        .submit_correction(&run_id, &body.message, body.target_agent_id.as_deref())
    {
        Ok(ack) => Json(json!({
            "correctionId": ack.correction_id,
            "routedTo": ack.routed_to,
            "reason": ack.reason,
            "applied": ack.applied,
        }))
        .into_response(),
        Err(_) => api_error(StatusCode::NOT_FOUND, format!("run {run_id} not found")),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/plugins/agents/run/:runId/stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn stop_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> impl IntoResponse {
    if !state.manager.exists(&run_id) {
        return api_error(StatusCode::NOT_FOUND, format!("run {run_id} not found"));
    }
    let reason = body.and_then(|Json(b)| b.reason);
    let stopped = state.manager.stop(&run_id, reason.as_deref());
    let final_status = state
        .manager
        .get_state(&run_id)
        .map(|r| serde_json::to_value(r.status).unwrap_or_default())
        .unwrap_or_default();

    Json(json!({
        "stopped": stopped,
        "runId": run_id,
        "finalStatus": final_status,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/plugins/agents/runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> impl IntoResponse {
    let runs = state.manager.list(query.limit.min(200));
    let items: Vec<serde_json::Value> = runs.iter().map(run_payload).collect();
    Json(json!({ "runs": items, "total": items.len() }))
}
