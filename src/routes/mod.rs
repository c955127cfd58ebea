//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. [`router`] wires
//! them together with the WebSocket log endpoint from [`crate::ws`].

pub mod events;
pub mod health;
pub mod logs;
pub mod portforward;
pub mod sessions;

use axum::{
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{ws, AppState};

/// Build the full API router.
///
/// The log-stream paths share one segment layout: the segment after
/// `/api/logs/stream/` is a namespace on the WebSocket route and a stream ID
/// on the REST routes. A pod named `recent` therefore cannot be streamed.
pub fn router(state: AppState) -> Router {
    let max_connections = state.config.server.max_connections;

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/events", get(events::event_stream))
        .route("/api/portforward/start", post(portforward::start))
        .route("/api/portforward/check/{port}", get(portforward::check_port))
        .route("/api/portforward/sessions", get(portforward::list))
        .route("/api/portforward/stop/{id}", post(portforward::stop))
        .route("/api/logs/streams", get(logs::list))
        .route("/api/logs/stream/{namespace}", axum::routing::delete(logs::stop))
        .route("/api/logs/stream/{namespace}/recent", get(logs::recent))
        .route("/api/logs/stream/{namespace}/{pod}", get(ws::log_stream_upgrade))
        .route("/api/sessions", get(sessions::list_sessions))
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session).delete(sessions::remove_session),
        )
        .layer(ConcurrencyLimitLayer::new(max_connections))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
