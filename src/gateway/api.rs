//! Request handlers for the chat gateway.
//!
//! Turn failures never surface as HTTP errors: `/chat` answers with the
//! fallback text as the reply, and streams carry an `error` event before
//! the terminal `[DONE]` frame.

use super::AppState;
use crate::agent::{FailureKind, StreamEvent, TurnFailure};
use crate::observability::{Metrics, MODE_CHAT, MODE_STREAM};
use crate::sessions::DEFAULT_SESSION_ID;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

/// Data payload of the terminal SSE frame.
pub const END_MARKER: &str = "[DONE]";

// ── Request / response shapes ───────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
}

/// Missing or empty ids map to the shared default session.
fn session_or_default(session_id: Option<String>) -> String {
    session_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string())
}

fn record_failure(metrics: &Metrics, mode: &str, failure: &TurnFailure) {
    if failure.kind == FailureKind::Upstream {
        metrics.record_failure(mode);
    }
}

// ── Handlers ────────────────────────────────────────────────────

/// GET /: service banner
pub async fn handle_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "clarity",
        "ok": true,
        "health": "/health",
    }))
}

/// GET /health: liveness plus configured model
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "model": &*state.model,
    }))
}

/// GET /metrics: Prometheus text exposition
pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.refresh_session_gauge();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

/// POST /reset: clear a session. The body is optional; unknown ids are a no-op.
///
/// A body that is present but unreadable is rejected and resets nothing.
pub async fn handle_reset(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ResetRequest::default()
    } else {
        match serde_json::from_slice::<ResetRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("rejecting unreadable reset body: {e}");
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(serde_json::json!({ "ok": false, "error": e.to_string() })),
                );
            }
        }
    };

    let session_id = session_or_default(request.session_id);
    state.orchestrator.reset(&session_id).await;
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}

/// POST /chat: one turn, whole reply
pub async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Json<ChatReply> {
    let session_id = session_or_default(body.session_id);
    state.metrics.record_turn(MODE_CHAT);

    let reply = match state.orchestrator.chat(&session_id, &body.message).await {
        Ok(reply) => reply,
        Err(failure) => {
            record_failure(&state.metrics, MODE_CHAT, &failure);
            failure.reply_text()
        }
    };

    state.refresh_session_gauge();
    Json(ChatReply { reply })
}

/// POST /chat_stream and /chat/stream: one turn as server-sent events
pub async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = session_or_default(body.session_id);
    state.metrics.record_turn(MODE_STREAM);

    let metrics = Arc::clone(&state.metrics);
    let events = state
        .orchestrator
        .stream_chat(session_id, body.message)
        .map(move |event| {
            if let StreamEvent::Failure(failure) = &event {
                record_failure(&metrics, MODE_STREAM, failure);
            }
            Ok(to_sse_event(event))
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Encode text as a JSON string so newlines survive SSE framing.
fn json_text(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

/// Wire form of a stream event.
///
/// Heartbeat is an SSE comment; fragments and failure text are JSON strings;
/// the end marker is a bare `[DONE]` data frame.
pub fn to_sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Heartbeat => Event::default().comment("heartbeat"),
        StreamEvent::Fragment(text) => Event::default().data(json_text(&text)),
        StreamEvent::Failure(failure) => Event::default()
            .event("error")
            .data(json_text(&failure.reply_text())),
        StreamEvent::End => Event::default().data(END_MARKER),
    }
}
