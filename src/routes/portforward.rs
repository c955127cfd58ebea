//! REST endpoints for port-forward tunnels.
//!
//! - `POST /api/portforward/start`        — open a tunnel
//! - `GET  /api/portforward/check/{port}` — is a local port free?
//! - `GET  /api/portforward/sessions`     — list tunnels (`?namespace=`)
//! - `POST /api/portforward/stop/{id}`    — stop a tunnel

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SessionError;
use crate::sessions::session::{PortForwardParams, SessionKind};
use crate::sessions::{validate, SessionFilter};
use crate::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

/// Body of `POST /api/portforward/start`. Ports are taken as wide integers
/// so out-of-range values get a range error rather than a decode error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub remote_port: i64,
    #[serde(default)]
    pub local_port: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    pub namespace: Option<String>,
}

/// Reject a session ID that does not name a session of `kind`.
pub(super) async fn require_kind(
    state: &AppState,
    id: &str,
    kind: SessionKind,
) -> Result<(), SessionError> {
    let view = state.registry.get(id).await?;
    if view.kind == kind {
        Ok(())
    } else {
        Err(SessionError::NotFound(id.to_string()))
    }
}

/// `POST /api/portforward/start`
pub async fn start(
    State(state): State<AppState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload.map_err(|e| SessionError::InvalidParameter(e.body_text()))?;
    let params = PortForwardParams {
        local_port: validate::check_port("localPort", req.local_port)?,
        remote_port: validate::check_port("remotePort", req.remote_port)?,
    };

    let id = state
        .portforward
        .start(&req.namespace, &req.pod, params)
        .await?;
    let session = state.registry.get(&id).await?;

    Ok(Json(json!({
        "success": true,
        "session": session,
        "message": format!(
            "Port-forward started successfully: localhost:{} → {}/{}:{}",
            params.local_port, req.namespace, req.pod, params.remote_port
        ),
    })))
}

/// `GET /api/portforward/check/{port}`
pub async fn check_port(State(state): State<AppState>, Path(port): Path<String>) -> ApiResult {
    let raw: i64 = port.parse().map_err(|_| {
        SessionError::InvalidParameter(format!("port must be a number, got {port:?}"))
    })?;
    let port = validate::check_port("port", raw)?;
    let available = state.portforward.is_port_available(port).await?;
    Ok(Json(json!({
        "port": port,
        "available": available,
    })))
}

/// `GET /api/portforward/sessions`
pub async fn list(State(state): State<AppState>, Query(q): Query<NamespaceQuery>) -> Json<Value> {
    let sessions = state
        .registry
        .list(&SessionFilter {
            namespace: q.namespace,
            kind: Some(SessionKind::PortForward),
        })
        .await;
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

/// `POST /api/portforward/stop/{id}`
pub async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    require_kind(&state, &id, SessionKind::PortForward).await?;
    state.registry.terminate(&id, None).await?;
    let session = state.registry.get(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Port-forward stopped for {}/{}", session.namespace, session.pod),
        "session": session,
    })))
}
