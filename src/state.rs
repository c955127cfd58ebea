//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::logs::LogStreamManager;
use crate::portforward::PortForwardManager;
use crate::sessions::SessionRegistry;
use crate::target::TargetResolver;

/// Capacity of the session lifecycle broadcast channel.
const SESSION_EVENT_CAPACITY: usize = 256;

/// Shared application state for the podrelay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Every port-forward and log-stream session.
    pub registry: SessionRegistry,
    pub portforward: PortForwardManager,
    pub logs: LogStreamManager,
    /// How sessions reach pods (Kubernetes API in production).
    pub resolver: Arc<dyn TargetResolver>,
    /// Broadcast channel for session lifecycle and supervisor events.
    /// SSE clients subscribe to receive real-time updates.
    pub session_events: broadcast::Sender<Value>,
    /// Current number of SSE connections (for connection limiting).
    pub sse_connections: Arc<AtomicU32>,
    /// Cancelled when the server starts shutting down. Ends SSE streams and
    /// the supervisor.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, resolver: Arc<dyn TargetResolver>) -> Self {
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let registry = SessionRegistry::new(config.server.max_sessions, session_events.clone());
        let portforward = PortForwardManager::new(
            registry.clone(),
            Arc::clone(&resolver),
            config.portforward.clone(),
        );
        let logs = LogStreamManager::new(registry.clone(), Arc::clone(&resolver), config.logs.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            portforward,
            logs,
            resolver,
            session_events,
            sse_connections: Arc::new(AtomicU32::new(0)),
            shutdown: CancellationToken::new(),
        }
    }
}
