//! Session API endpoints: CRUD plus the durable event history.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use fm_sessions::SessionEntry;

use super::api_error;
use crate::state::AppState;

fn session_payload(entry: &SessionEntry) -> serde_json::Value {
    json!({
        "sessionId": entry.session_id,
        "createdAt": entry.created_at,
        "updatedAt": entry.updated_at,
        "runIds": entry.run_ids,
        "totalTokens": entry.total_tokens,
    })
}

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.manager.sessions().list();
    let items: Vec<serde_json::Value> = sessions.iter().map(session_payload).collect();
    Json(json!({ "sessions": items, "total": items.len() }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> impl IntoResponse {
    let requested = body.and_then(|Json(b)| b.session_id);
    let (entry, created) = state
        .manager
        .sessions()
        .resolve_or_create(requested.as_deref());
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    (status, Json(session_payload(&entry)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.sessions().get(&session_id) {
        Some(entry) => Json(session_payload(&entry)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("session {session_id} not found")),
    }
}

pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    if !state.manager.sessions().exists(&session_id) {
        return api_error(StatusCode::NOT_FOUND, format!("session {session_id} not found"));
    }
    match state.manager.event_log().read(&session_id) {
        Ok(events) => {
            let total = events.len();
            Json(json!({
                "sessionId": session_id,
                "events": events,
                "total": total,
            }))
            .into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
