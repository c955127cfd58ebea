//! WebSocket transport for pod log streams.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/logs/stream/{namespace}/{pod}` with
//!    optional `tail`, `follow` and `buffer` query parameters. The session is
//!    registered before the upgrade completes, so bad parameters or a full
//!    registry fail the handshake with a JSON error body.
//! 2. The server sends `info` notices (stream started, pod phase and node,
//!    log opened), then one message per log line, in the order the pod
//!    produced them.
//! 3. When the stream ends on the server side (one-shot tail delivered,
//!    session stopped, pod gone) a final notice is sent and the socket is
//!    closed. When the client disconnects first, the session is stopped.
//!
//! ## Messages (server → client)
//!
//! Every frame is a JSON text message:
//!
//! ```json
//! {"type": "log", "message": "2024-05-01T10:00:00Z started", "time": "..."}
//! ```
//!
//! | `type`    | Meaning                                        |
//! |-----------|------------------------------------------------|
//! | `log`     | One line of container output                   |
//! | `info`    | Stream started or stopped                      |
//! | `success` | One-shot tail delivered in full                |
//! | `warning` | Follow interrupted, or stopped with a reason   |
//! | `error`   | Stream failed; `message` carries the cause     |
//!
//! Incoming client frames are ignored apart from close.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::LogsConfig;
use crate::error::SessionError;
use crate::logs::{LogLevel, LogMessage};
use crate::sessions::session::{LogStreamParams, SessionParams, SessionStatus};
use crate::AppState;

/// Raw query parameters. Kept as strings so unparseable values can fall
/// back to defaults instead of failing the handshake.
#[derive(Debug, Default, Deserialize)]
pub struct LogStreamQuery {
    pub tail: Option<String>,
    pub follow: Option<String>,
    pub buffer: Option<String>,
}

fn parse_number(raw: Option<&str>) -> Option<i64> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

/// Resolve query parameters against configured defaults.
///
/// Missing or non-numeric `tail`/`buffer` use the defaults. A negative
/// `tail` or a non-positive `buffer` is rejected.
pub fn stream_params(
    query: &LogStreamQuery,
    defaults: &LogsConfig,
) -> Result<LogStreamParams, SessionError> {
    let tail_lines = match parse_number(query.tail.as_deref()) {
        None => defaults.default_tail,
        Some(n) if n < 0 => {
            return Err(SessionError::InvalidParameter(format!(
                "tail must not be negative, got {n}"
            )))
        }
        Some(n) => u32::try_from(n).unwrap_or(u32::MAX),
    };
    let buffer_size = match parse_number(query.buffer.as_deref()) {
        None => defaults.default_buffer,
        Some(n) if n <= 0 => {
            return Err(SessionError::InvalidParameter(format!(
                "buffer must be positive, got {n}"
            )))
        }
        Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
    };
    let follow = matches!(
        query.follow.as_deref().map(str::trim),
        Some("true" | "1")
    );
    Ok(LogStreamParams {
        tail_lines,
        follow,
        buffer_size,
    })
}

/// `GET /api/logs/stream/{namespace}/{pod}` — WebSocket upgrade handler.
pub async fn log_stream_upgrade(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    Query(query): Query<LogStreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let opened = async {
        let params = stream_params(&query, state.logs.config())?;
        state.logs.open(&namespace, &pod, params).await
    };
    let id = match opened.await {
        Ok(id) => id,
        Err(e) => {
            debug!("Log stream for {namespace}/{pod} rejected: {e}");
            return <(StatusCode, Json<Value>)>::from(e).into_response();
        }
    };

    let registry = state.registry.clone();
    let failed_id = id.clone();
    ws.on_failed_upgrade(move |e| {
        warn!("Log stream {failed_id}: WebSocket upgrade failed: {e}");
        tokio::spawn(async move { registry.abandon(&failed_id).await });
    })
    .on_upgrade(move |socket| handle_log_socket(socket, state, id, namespace, pod))
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &LogMessage,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(t) => t,
        Err(e) => {
            error!("WS send: failed to serialize log message: {e}");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await
}

/// The notice sent after the manager closes the channel, built from the
/// session's final state.
async fn closing_notice(state: &AppState, id: &str) -> LogMessage {
    let Ok(record) = state.registry.record(id).await else {
        return LogMessage::notice(LogLevel::Info, "Log stream stopped");
    };
    let one_shot = matches!(record.params, SessionParams::LogStream(p) if !p.follow);
    match (record.status, record.last_error) {
        (SessionStatus::Error, reason) => LogMessage::notice(
            LogLevel::Error,
            reason.unwrap_or_else(|| "Log stream failed".to_string()),
        ),
        (SessionStatus::Stopped, Some(reason)) => {
            LogMessage::notice(LogLevel::Warning, format!("Log stream stopped: {reason}"))
        }
        (SessionStatus::Stopped, None) if one_shot => {
            LogMessage::notice(LogLevel::Success, "Log stream completed")
        }
        _ => LogMessage::notice(LogLevel::Info, "Log stream stopped"),
    }
}

/// Pump one log-stream session to one socket.
///
/// Lines arrive on an mpsc channel fed by the stream loop. The channel is
/// bounded, so a slow client slows the reader rather than losing lines.
async fn handle_log_socket(
    socket: WebSocket,
    state: AppState,
    id: String,
    namespace: String,
    pod: String,
) {
    let (mut sink, mut incoming) = socket.split();
    let (tx, mut rx) = mpsc::channel::<LogMessage>(state.logs.config().channel_capacity.max(1));

    let started = LogMessage::notice(
        LogLevel::Info,
        format!("Log stream started for pod {namespace}/{pod}"),
    );
    if send_message(&mut sink, &started).await.is_err() {
        let _ = state.registry.terminate(&id, None).await;
        return;
    }

    if let Err(e) = state.logs.start(&id, tx).await {
        warn!("Log stream {id}: could not start: {e}");
        let _ = send_message(&mut sink, &LogMessage::notice(LogLevel::Error, e.to_string())).await;
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let mut client_gone = false;
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(message) = next else { break };
                if send_message(&mut sink, &message).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_)) | Err(_)) | None => {
                    client_gone = true;
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    if client_gone {
        info!("Log stream {id}: client disconnected");
        let _ = state.registry.terminate(&id, None).await;
        return;
    }

    let notice = closing_notice(&state, &id).await;
    let _ = send_message(&mut sink, &notice).await;
    let _ = sink
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: "stream ended".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

    use super::*;
    use crate::config::Config;
    use crate::sessions::SessionFilter;
    use crate::target::fake::{FakeResolver, FollowEvent};
    use crate::target::{TargetResolver, TargetState};

    const WAIT: Duration = Duration::from_secs(5);

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn serve(fake: FakeResolver) -> (AppState, String) {
        let state = AppState::new(Config::default(), Arc::new(fake));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::routes::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, format!("ws://{addr}"))
    }

    fn pod_with_history() -> FakeResolver {
        let fake = FakeResolver::new().with_pod("default", "web-0", TargetState::Running);
        fake.set_history(["alpha", "beta", "gamma"]);
        fake
    }

    /// Next JSON text frame, or `None` once the server closes.
    async fn next_json(client: &mut Client) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(WAIT, client.next()).await.unwrap()?;
            match frame.unwrap() {
                WsMessage::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
                WsMessage::Close(_) => return None,
                _ => {}
            }
        }
    }

    /// Next frame that is not an `info` notice.
    async fn next_notable(client: &mut Client) -> Option<Value> {
        loop {
            let msg = next_json(client).await?;
            if msg["type"] != "info" {
                return Some(msg);
            }
        }
    }

    async fn wait_status(state: &AppState, id: &str, want: SessionStatus) {
        tokio::time::timeout(WAIT, async {
            loop {
                if state.registry.get(id).await.unwrap().status == want {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn only_session(state: &AppState) -> String {
        let sessions = state.registry.list(&SessionFilter::default()).await;
        assert_eq!(sessions.len(), 1);
        sessions[0].id.clone()
    }

    #[test]
    fn test_query_defaults_and_fallbacks() {
        let defaults = LogsConfig::default();
        let p = stream_params(&LogStreamQuery::default(), &defaults).unwrap();
        assert_eq!(p.tail_lines, defaults.default_tail);
        assert_eq!(p.buffer_size, defaults.default_buffer);
        assert!(!p.follow);

        let q = LogStreamQuery {
            tail: Some("lots".into()),
            follow: Some("true".into()),
            buffer: Some("25".into()),
        };
        let p = stream_params(&q, &defaults).unwrap();
        assert_eq!(p.tail_lines, defaults.default_tail);
        assert_eq!(p.buffer_size, 25);
        assert!(p.follow);

        let q = LogStreamQuery {
            follow: Some("yes".into()),
            ..LogStreamQuery::default()
        };
        assert!(!stream_params(&q, &defaults).unwrap().follow);
    }

    #[test]
    fn test_query_rejects_negative_values() {
        let defaults = LogsConfig::default();
        let q = LogStreamQuery {
            tail: Some("-1".into()),
            ..LogStreamQuery::default()
        };
        let err = stream_params(&q, &defaults).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");

        let q = LogStreamQuery {
            buffer: Some("0".into()),
            ..LogStreamQuery::default()
        };
        assert!(stream_params(&q, &defaults).is_err());
    }

    #[tokio::test]
    async fn test_one_shot_delivers_tail_then_completes() {
        let (state, base) = serve(pod_with_history()).await;
        let url = format!("{base}/api/logs/stream/default/web-0?tail=2");
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let mut frames = Vec::new();
        while let Some(msg) = next_json(&mut client).await {
            frames.push((
                msg["type"].as_str().unwrap().to_string(),
                msg["message"].as_str().unwrap().to_string(),
            ));
        }
        let expected = [
            ("info", "Log stream started for pod default/web-0"),
            ("info", "Pod: web-0, Status: Running, Node: node-1"),
            ("info", "Successfully connected to pod logs"),
            ("log", "beta"),
            ("log", "gamma"),
            ("success", "Log stream completed"),
        ];
        let frames: Vec<(&str, &str)> = frames.iter().map(|(t, m)| (t.as_str(), m.as_str())).collect();
        assert_eq!(frames, expected);

        let id = only_session(&state).await;
        assert_eq!(state.registry.get(&id).await.unwrap().status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_client_close_stops_follow_session() {
        let (state, base) = serve(pod_with_history()).await;
        let url = format!("{base}/api/logs/stream/default/web-0?tail=0&follow=true");
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "info");

        let id = only_session(&state).await;
        wait_status(&state, &id, SessionStatus::Running).await;

        client.send(WsMessage::Close(None)).await.unwrap();
        wait_status(&state, &id, SessionStatus::Stopped).await;
    }

    #[tokio::test]
    async fn test_follow_streams_new_lines() {
        let fake = Arc::new(pod_with_history());
        let resolver: Arc<dyn TargetResolver> = fake.clone();
        let state = AppState::new(Config::default(), resolver);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::routes::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = format!("ws://{addr}/api/logs/stream/default/web-0?tail=1&follow=1");
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        assert_eq!(next_notable(&mut client).await.unwrap()["message"], "gamma");

        fake.follow(FollowEvent::Line("delta".into()));
        let msg = next_json(&mut client).await.unwrap();
        assert_eq!(msg["type"], "log");
        assert_eq!(msg["message"], "delta");

        let id = only_session(&state).await;
        state.registry.terminate(&id, None).await.unwrap();
        let last = next_json(&mut client).await.unwrap();
        assert_eq!(last["type"], "info");
        assert_eq!(last["message"], "Log stream stopped");
        assert!(next_json(&mut client).await.is_none());
    }

    #[tokio::test]
    async fn test_server_stop_with_reason_is_warning() {
        let (state, base) = serve(pod_with_history()).await;
        let url = format!("{base}/api/logs/stream/default/web-0?tail=0&follow=true");
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "info");

        let id = only_session(&state).await;
        wait_status(&state, &id, SessionStatus::Running).await;
        state
            .registry
            .terminate(&id, Some("pod no longer exists".into()))
            .await
            .unwrap();

        let last = next_notable(&mut client).await.unwrap();
        assert_eq!(last["type"], "warning");
        assert_eq!(last["message"], "Log stream stopped: pod no longer exists");
    }

    #[tokio::test]
    async fn test_open_failure_sends_error() {
        let fake = pod_with_history();
        fake.log_open_fails.store(true, std::sync::atomic::Ordering::SeqCst);
        let (state, base) = serve(fake).await;
        let url = format!("{base}/api/logs/stream/default/web-0");
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let last = next_notable(&mut client).await.unwrap();
        assert_eq!(last["type"], "error");
        assert!(last["message"].as_str().unwrap().starts_with("failed to open log stream"));

        let id = only_session(&state).await;
        assert_eq!(state.registry.get(&id).await.unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_invalid_tail_fails_handshake() {
        let (state, base) = serve(pod_with_history()).await;
        let url = format!("{base}/api/logs/stream/default/web-0?tail=-5");
        let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
        match err {
            tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 400),
            other => panic!("expected HTTP error, got {other:?}"),
        }
        assert!(state.registry.list(&SessionFilter::default()).await.is_empty());
    }
}
