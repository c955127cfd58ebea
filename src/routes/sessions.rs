//! REST endpoints over every session, regardless of kind.
//!
//! - `GET    /api/sessions`       — list (`?namespace=&kind=`)
//! - `GET    /api/sessions/{id}`  — one session
//! - `DELETE /api/sessions/{id}`  — stop if needed and purge the record

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SessionError;
use crate::sessions::session::SessionKind;
use crate::sessions::SessionFilter;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub kind: Option<String>,
}

fn parse_kind(kind: &str) -> Result<SessionKind, SessionError> {
    match kind {
        "port-forward" | "portforward" => Ok(SessionKind::PortForward),
        "log-stream" | "logs" => Ok(SessionKind::LogStream),
        other => Err(SessionError::InvalidParameter(format!(
            "unknown session kind {other:?} (expected port-forward or log-stream)"
        ))),
    }
}

/// `GET /api/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let kind = q
        .kind
        .as_deref()
        .filter(|k| !k.is_empty())
        .map(parse_kind)
        .transpose()?;
    let sessions = state
        .registry
        .list(&SessionFilter {
            namespace: q.namespace,
            kind,
        })
        .await;
    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

/// `GET /api/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let session = state.registry.get(&id).await?;
    Ok(Json(json!(session)))
}

/// `DELETE /api/sessions/{id}`
pub async fn remove_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state.registry.remove(&id).await?;
    Ok(Json(json!({
        "ok": true,
        "session_id": id,
    })))
}
