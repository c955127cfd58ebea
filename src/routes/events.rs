//! Server-Sent Events endpoint.
//!
//! `GET /api/events` pushes session lifecycle and supervisor events as they
//! happen. Each SSE event is named after the JSON `type` field
//! (`session.created`, `session.status_changed`, `supervisor.evicted`, ...).
//! `?session=<id>` narrows the feed to one session. Streams end when the
//! server shuts down.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 64;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub session: Option<String>,
}

fn concerns(value: &Value, session: Option<&str>) -> bool {
    let Some(wanted) = session else { return true };
    let id = value["session_id"]
        .as_str()
        .or_else(|| value["session"]["id"].as_str());
    id == Some(wanted)
}

/// `GET /api/events`
pub async fn event_stream(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> impl IntoResponse {
    let previous = state.sse_connections.fetch_add(1, Ordering::Relaxed);
    if previous >= MAX_SSE_CONNECTIONS {
        state.sse_connections.fetch_sub(1, Ordering::Relaxed);
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "too many event stream connections", "code": "TOO_MANY_CONNECTIONS"})),
        ));
    }

    let rx = state.session_events.subscribe();
    let session = q.session.filter(|s| !s.is_empty());

    let events = futures::stream::unfold((rx, session), |(mut rx, session)| async move {
        loop {
            match rx.recv().await {
                Ok(value) => {
                    if !concerns(&value, session.as_deref()) {
                        continue;
                    }
                    let name = value["type"].as_str().unwrap_or("message").to_string();
                    let event = Event::default().event(name).data(value.to_string());
                    return Some((Ok(event), (rx, session)));
                }
                Err(RecvError::Lagged(missed)) => {
                    let event = Event::default()
                        .event("error")
                        .data(json!({"code": "LAGGED", "missed": missed}).to_string());
                    return Some((Ok(event), (rx, session)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream = CountedStream {
        inner: events
            .take_until(state.shutdown.clone().cancelled_owned())
            .boxed(),
        _slot: ConnectionSlot(Arc::clone(&state.sse_connections)),
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}

/// Holds one slot of the SSE connection budget until dropped.
struct ConnectionSlot(Arc<AtomicU32>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct CountedStream {
    inner: BoxStream<'static, Result<Event, Infallible>>,
    _slot: ConnectionSlot,
}

impl Stream for CountedStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
