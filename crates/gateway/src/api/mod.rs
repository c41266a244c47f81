//! API surface: REST routes plus the two WebSocket endpoints.

pub mod runs;
pub mod sessions;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/plugins/agents/run", post(runs::submit_run))
        .route("/v1/plugins/agents/runs", get(runs::list_runs))
        .route("/v1/plugins/agents/run/:run_id", get(runs::get_run))
        .route("/v1/plugins/agents/run/:run_id/correct", post(runs::correct_run))
        .route("/v1/plugins/agents/run/:run_id/stop", post(runs::stop_run))
        .route(
            "/v1/plugins/agents/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/v1/plugins/agents/sessions/:session_id", get(sessions::get_session))
        .route(
            "/v1/plugins/agents/sessions/:session_id/events",
            get(sessions::session_events),
        )
        .route("/v1/ws/plugins/agents/events/:run_id", get(ws::run_events))
        .route("/v1/ws/plugins/agents/session/:session_id", get(ws::session_stream))
        .with_state(state)
}
