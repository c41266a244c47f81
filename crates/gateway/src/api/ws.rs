//! WebSocket endpoints.
//!
//! - `/v1/ws/plugins/agents/events/:runId` — per-run stream. On
//!   connect: `connection:ready`, replay of buffered events, then live.
//! - `/v1/ws/plugins/agents/session/:sessionId` — persistent session
//!   stream: `conversation:snapshot` on connect, then `turn:snapshot`
//!   on every turn mutation (deduplicated by signature).

use std::collections::HashMap;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};

use fm_domain::event::{AgentEvent, EventKind};
use fm_sessions::TurnAssembler;

use super::api_error;
use crate::state::AppState;

type WsSink = SplitSink<WebSocket, WsMessage>;

async fn send_json(sink: &mut WsSink, payload: Value) -> bool {
    sink.send(WsMessage::Text(payload.to_string())).await.is_ok()
}

fn is_terminal_status(event: &AgentEvent) -> bool {
    matches!(event.kind, EventKind::StatusChange { status } if status.is_terminal())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-run event stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    if !state.manager.exists(&run_id) {
        return api_error(StatusCode::NOT_FOUND, format!("run {run_id} not found"));
    }
    ws.on_upgrade(move |socket| handle_run_socket(socket, state, run_id))
        .into_response()
}

async fn handle_run_socket(socket: WebSocket, state: AppState, run_id: String) {
    let (mut sink, mut stream) = socket.split();

    if !send_json(&mut sink, json!({"type": "connection:ready", "runId": run_id})).await {
        return;
    }

    // Buffered prefix, then live — no duplicate seq.
    let (replay, listener, mut rx) = state.manager.subscribe(&run_id);
    for event in replay {
        let done = is_terminal_status(&event);
        if !send_json(&mut sink, json!({"type": "agent:event", "event": event})).await {
            state.manager.remove_listener(&run_id, listener);
            return;
        }
        if done {
            let _ = send_run_completed(&mut sink, &state, &run_id).await;
        }
    }

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else { break };
                let done = is_terminal_status(&event);
                if !send_json(&mut sink, json!({"type": "agent:event", "event": event})).await {
                    break;
                }
                if done {
                    let _ = send_run_completed(&mut sink, &state, &run_id).await;
                }
            }
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_client_message(&mut sink, &state, &run_id, &text).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "run socket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.manager.remove_listener(&run_id, listener);
}

async fn send_run_completed(sink: &mut WsSink, state: &AppState, run_id: &str) -> bool {
    let final_status = state
        .manager
        .get_state(run_id)
        .map(|r| serde_json::to_value(r.status).unwrap_or_default())
        .unwrap_or_default();
    send_json(sink, json!({
        "type": "run:completed",
        "runId": run_id,
        "finalStatus": final_status,
    }))
    .await
}

async fn handle_client_message(sink: &mut WsSink, state: &AppState, run_id: &str, text: &str) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        let _ = send_json(sink, json!({"type": "error", "message": "malformed message"})).await;
        return;
    };
    match message["type"].as_str() {
        Some("user:correction") => {
            let body = message["message"].as_str().unwrap_or_default();
            let target = message["targetAgentId"].as_str();
            match state.manager.submit_correction(run_id, body, target) {
                Ok(ack) => {
                    let _ = send_json(sink, json!({
                        "type": "correction:ack",
                        "correctionId": ack.correction_id,
                        "routedTo": ack.routed_to,
                        "reason": ack.reason,
                        "applied": ack.applied,
                    }))
                    .await;
                }
                Err(e) => {
                    let _ = send_json(sink, json!({"type": "error", "message": e.to_string()})).await;
                }
            }
        }
        Some("user:stop") => {
            state.manager.stop(run_id, message["reason"].as_str());
        }
        // Keepalive; no reply in the protocol.
        Some("ping") => {}
        other => {
            let _ = send_json(sink, json!({
                "type": "error",
                "message": format!("unknown message type: {other:?}"),
            }))
            .await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistent session stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn session_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    if !state.manager.sessions().exists(&session_id) {
        return api_error(StatusCode::NOT_FOUND, format!("session {session_id} not found"));
    }
    ws.on_upgrade(move |socket| handle_session_socket(socket, state, session_id))
        .into_response()
}

async fn handle_session_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sink, mut stream) = socket.split();

    if !send_json(&mut sink, json!({"type": "connection:ready", "sessionId": session_id})).await {
        return;
    }

    // Rebuild turns from the durable log: completed turns plus the
    // still-streaming ones.
    let mut assemblers: HashMap<String, TurnAssembler> = HashMap::new();
    let mut run_order: Vec<String> = Vec::new();
    if let Ok(logged) = state.manager.event_log().read(&session_id) {
        for entry in logged {
            if !assemblers.contains_key(&entry.run_id) {
                run_order.push(entry.run_id.clone());
                let task = state
                    .manager
                    .get_state(&entry.run_id)
                    .map(|r| r.task)
                    .unwrap_or_default();
                assemblers.insert(
                    entry.run_id.clone(),
                    TurnAssembler::new(&entry.run_id, run_order.len() as u64 - 1, &task),
                );
            }
            if let Some(assembler) = assemblers.get_mut(&entry.run_id) {
                assembler.observe(&entry.event);
            }
        }
    }
    let turns: Vec<Value> = run_order
        .iter()
        .filter_map(|run_id| assemblers.get(run_id))
        .filter_map(|a| serde_json::to_value(a.turn()).ok())
        .collect();
    if !send_json(&mut sink, json!({"type": "conversation:snapshot", "turns": turns})).await {
        return;
    }

    // Live updates: a turn snapshot on every mutation, deduplicated by
    // the turn signature.
    let (listener, mut rx) = state.manager.add_session_listener(&session_id);
    let mut last_signatures: HashMap<String, String> = HashMap::new();
    for (run_id, assembler) in &assemblers {
        last_signatures.insert(run_id.clone(), assembler.turn().signature());
    }

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some((run_id, event)) = maybe_event else { break };
                let assembler = assemblers.entry(run_id.clone()).or_insert_with(|| {
                    run_order.push(run_id.clone());
                    let task = state
                        .manager
                        .get_state(&run_id)
                        .map(|r| r.task)
                        .unwrap_or_default();
                    TurnAssembler::new(&run_id, run_order.len() as u64 - 1, &task)
                });
                if !assembler.observe(&event) {
                    continue;
                }
                let signature = assembler.turn().signature();
                if last_signatures.get(&run_id).map(String::as_str) == Some(signature.as_str()) {
                    continue;
                }
                last_signatures.insert(run_id.clone(), signature);
                let Ok(turn) = serde_json::to_value(assembler.turn()) else { continue };
                if !send_json(&mut sink, json!({"type": "turn:snapshot", "turn": turn})).await {
                    break;
                }
            }
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "session socket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.manager.remove_session_listener(&session_id, listener);
}
