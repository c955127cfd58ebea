//! REST endpoints for log streams. The stream itself is opened over a
//! WebSocket, see [`crate::ws`].
//!
//! - `GET    /api/logs/streams`             — list streams (`?namespace=`)
//! - `DELETE /api/logs/stream/{id}`         — stop a stream
//! - `GET    /api/logs/stream/{id}/recent`  — lines kept in the ring buffer

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::portforward::{require_kind, NamespaceQuery};
use crate::sessions::session::SessionKind;
use crate::sessions::SessionFilter;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    /// Only entries with a sequence number above this.
    pub since: Option<u64>,
}

/// `GET /api/logs/streams`
pub async fn list(State(state): State<AppState>, Query(q): Query<NamespaceQuery>) -> Json<Value> {
    let streams = state
        .registry
        .list(&SessionFilter {
            namespace: q.namespace,
            kind: Some(SessionKind::LogStream),
        })
        .await;
    Json(json!({
        "count": streams.len(),
        "streams": streams,
    }))
}

/// `DELETE /api/logs/stream/{id}`
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require_kind(&state, &id, SessionKind::LogStream).await?;
    state.registry.terminate(&id, None).await?;
    Ok(Json(json!({
        "message": "Log stream stopped",
        "stream": id,
    })))
}

/// `GET /api/logs/stream/{id}/recent`
pub async fn recent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<RecentQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let buffer = state.registry.log_buffer(&id).await?;
    let buffer = buffer.lock().await;
    let (lines, dropped) = match q.since {
        Some(since) => buffer.read_since(since),
        None => (buffer.recent(), 0),
    };
    Ok(Json(json!({
        "stream": id,
        "lines": lines,
        "dropped": dropped,
        "next_seq": buffer.next_seq(),
    })))
}
