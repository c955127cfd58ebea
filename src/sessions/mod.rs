//! Session registry: the single source of truth for session existence and
//! status.
//!
//! [`SessionRegistry`] is shared by the HTTP handlers (create / list / get /
//! terminate), the port-forward and log-stream managers (status updates,
//! handle attachment) and the supervisor (periodic sweep).
//!
//! ## Concurrency
//!
//! Sessions and local-port reservations live behind one `RwLock`, so the
//! port check, the reservation and the insert of the `starting` record in
//! [`SessionRegistry::create`] happen in a single critical section. The lock
//! is never held across I/O: `terminate` takes the session's task handle out
//! of the map, drops the lock, and only then waits for the task to exit.
//!
//! ## Port reservations
//!
//! A reservation is released when the session is terminal **and** no task
//! handle is attached any more, i.e. after the listener has been closed. A
//! session stopped while still `starting` keeps its reservation until the
//! port-forward manager hands in (and shuts down) its handle, or abandons
//! the record.

pub mod handle;
pub mod session;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SessionError;
use crate::logs::buffer::LogBuffer;
use handle::RelayHandle;
use session::{SessionKind, SessionParams, SessionRecord, SessionStatus, SessionView};

/// How long `terminate` waits for a session task before aborting it.
const HANDLE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Optional filters for [`SessionRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub namespace: Option<String>,
    pub kind: Option<SessionKind>,
}

impl SessionFilter {
    fn matches(&self, record: &SessionRecord) -> bool {
        self.namespace
            .as_deref()
            .is_none_or(|ns| ns.is_empty() || record.namespace == ns)
            && self.kind.is_none_or(|k| record.kind() == k)
    }
}

/// Per-kind count of non-terminal sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    pub port_forward: usize,
    pub log_stream: usize,
}

/// Internal bookkeeping for a session.
struct SessionEntry {
    record: SessionRecord,
    /// Task driving the session. `None` until the manager attaches it, and
    /// again once the session has been torn down.
    handle: Option<RelayHandle>,
    /// Ring buffer of delivered lines (log streams only).
    buffer: Option<Arc<Mutex<LogBuffer>>>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    /// localPort -> owning session ID.
    ports: HashMap<u16, String>,
}

impl RegistryInner {
    fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|e| !e.record.status.is_terminal())
            .count()
    }

    /// Drop the reservation held by `id` if the session no longer needs it.
    fn release_port_if_idle(&mut self, id: &str) -> Option<u16> {
        let entry = self.sessions.get(id)?;
        if !entry.record.status.is_terminal() || entry.handle.is_some() {
            return None;
        }
        let port = entry.record.params.local_port()?;
        if self.ports.get(&port).map(String::as_str) == Some(id) {
            self.ports.remove(&port);
            return Some(port);
        }
        None
    }
}

/// Thread-safe table of port-forward and log-stream sessions.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    max_sessions: usize,
    events: broadcast::Sender<Value>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, events: broadcast::Sender<Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            max_sessions,
            events,
        }
    }

    fn emit(&self, event: Value) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_status(&self, record: &SessionRecord) {
        self.emit(json!({
            "type": "session.status_changed",
            "session_id": record.id,
            "kind": record.kind(),
            "status": record.status,
            "last_error": record.last_error,
        }));
    }

    /// Validate parameters, reserve the local port (port-forward) and insert
    /// a `starting` record. Returns the new session ID.
    pub async fn create(
        &self,
        namespace: &str,
        pod: &str,
        params: SessionParams,
    ) -> Result<String, SessionError> {
        validate::validate_target(namespace, pod)?;
        params.validate()?;

        let mut inner = self.inner.write().await;

        if inner.active_count() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }
        if let Some(port) = params.local_port() {
            if inner.ports.contains_key(&port) {
                return Err(SessionError::PortInUse(port));
            }
        }

        let id = Uuid::new_v4().to_string();
        let record = SessionRecord::new(id.clone(), namespace, pod, params);
        let buffer = match params {
            SessionParams::LogStream(p) => Some(Arc::new(Mutex::new(LogBuffer::new(p.buffer_size)))),
            SessionParams::PortForward(_) => None,
        };
        if let Some(port) = params.local_port() {
            inner.ports.insert(port, id.clone());
        }

        self.emit(json!({
            "type": "session.created",
            "session": record.view(),
        }));
        inner.sessions.insert(
            id.clone(),
            SessionEntry {
                record,
                handle: None,
                buffer,
            },
        );

        info!(
            "Session {id} created ({} {namespace}/{pod}), active: {}",
            params.kind().as_str(),
            inner.active_count()
        );
        Ok(id)
    }

    /// Snapshot of all sessions matching `filter`, oldest first.
    pub async fn list(&self, filter: &SessionFilter) -> Vec<SessionView> {
        let inner = self.inner.read().await;
        let mut views: Vec<SessionView> = inner
            .sessions
            .values()
            .filter(|e| filter.matches(&e.record))
            .map(|e| e.record.view())
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        views
    }

    pub async fn get(&self, id: &str) -> Result<SessionView, SessionError> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(id)
            .map(|e| e.record.view())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Clone of the internal record (used by managers to read parameters and
    /// grab the shared stats).
    pub async fn record(&self, id: &str) -> Result<SessionRecord, SessionError> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(id)
            .map(|e| e.record.clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// The delivered-lines ring buffer of a log-stream session.
    pub async fn log_buffer(&self, id: &str) -> Result<Arc<Mutex<LogBuffer>>, SessionError> {
        let inner = self.inner.read().await;
        let entry = inner
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry
            .buffer
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Stop a session. Idempotent: terminal sessions are left untouched.
    ///
    /// A non-terminal session becomes `stopped` (with `reason` as
    /// `lastError`, if given), its task is cancelled and awaited, and its
    /// port reservation is released.
    pub async fn terminate(&self, id: &str, reason: Option<String>) -> Result<(), SessionError> {
        let handle = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if entry.record.status.is_terminal() {
                return Ok(());
            }
            entry.record.transition(SessionStatus::Stopped, reason);
            self.emit_status(&entry.record);
            info!(
                "Session {id} stopped ({}/{})",
                entry.record.namespace, entry.record.pod
            );
            entry.handle.take()
        };

        if let Some(handle) = handle {
            handle.shutdown(HANDLE_SHUTDOWN_TIMEOUT).await;
            self.release_port(id).await;
        }
        Ok(())
    }

    /// Internal status mutation used by managers and the supervisor.
    ///
    /// Illegal transitions are ignored (returns `false`). Entering a terminal
    /// status cancels the attached task without waiting for it, so a task may
    /// call this on its own session.
    pub async fn mark_status(
        &self,
        id: &str,
        status: SessionStatus,
        error: Option<String>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.sessions.get_mut(id) else {
            return false;
        };
        let from = entry.record.status;
        if !entry.record.transition(status, error) {
            debug!("Session {id}: ignoring transition {from} -> {status}");
            return false;
        }
        self.emit_status(&entry.record);
        if status.is_terminal() {
            if let Some(handle) = entry.handle.take() {
                handle.cancel();
            }
            inner.release_port_if_idle(id);
        }
        true
    }

    /// `starting -> running`.
    pub async fn mark_running(&self, id: &str) -> bool {
        self.mark_status(id, SessionStatus::Running, None).await
    }

    /// Hand the session's task handle to the registry.
    ///
    /// If the session was stopped while it was still starting, the handle is
    /// given back so the caller can shut the task down and then call
    /// [`release_port`](Self::release_port).
    pub async fn attach_handle(&self, id: &str, handle: RelayHandle) -> Result<(), RelayHandle> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(id) {
            Some(entry) if !entry.record.status.is_terminal() => {
                entry.handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Release the port reservation of a terminal session with no live task.
    pub async fn release_port(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(port) = inner.release_port_if_idle(id) {
            debug!("Session {id}: released local port {port}");
        }
    }

    /// Remove a record whose synchronous establishment failed. Leaves no
    /// registry entry and no reservation behind.
    pub async fn abandon(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.remove(id) {
            if let Some(port) = entry.record.params.local_port() {
                if inner.ports.get(&port).map(String::as_str) == Some(id) {
                    inner.ports.remove(&port);
                }
            }
            if let Some(handle) = entry.handle {
                handle.cancel();
            }
            self.emit(json!({
                "type": "session.removed",
                "session_id": id,
                "reason": "abandoned",
            }));
            info!("Session {id} abandoned before it started");
        }
    }

    /// Stop (if needed) and purge a session record.
    pub async fn remove(&self, id: &str) -> Result<(), SessionError> {
        self.terminate(id, None).await?;
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.remove(id) {
            // Also covers a session stopped while its manager was still
            // binding: the manager's later bind or attach fails on its own.
            if let Some(port) = entry.record.params.local_port() {
                if inner.ports.get(&port).map(String::as_str) == Some(id) {
                    inner.ports.remove(&port);
                }
            }
            self.emit(json!({
                "type": "session.removed",
                "session_id": id,
                "reason": "removed",
            }));
            info!("Session {id} removed, remaining: {}", inner.sessions.len());
        }
        Ok(())
    }

    /// Whether `port` is reserved by a session.
    pub async fn is_port_reserved(&self, port: u16) -> bool {
        self.inner.read().await.ports.contains_key(&port)
    }

    pub async fn counts(&self) -> SessionCounts {
        let inner = self.inner.read().await;
        let mut counts = SessionCounts::default();
        for entry in inner.sessions.values() {
            if entry.record.status.is_terminal() {
                continue;
            }
            match entry.record.kind() {
                SessionKind::PortForward => counts.port_forward += 1,
                SessionKind::LogStream => counts.log_stream += 1,
            }
        }
        counts
    }

    /// `(id, namespace, pod)` of every `running` session.
    pub async fn running_targets(&self) -> Vec<(String, String, String)> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|e| e.record.status == SessionStatus::Running)
            .map(|e| {
                (
                    e.record.id.clone(),
                    e.record.namespace.clone(),
                    e.record.pod.clone(),
                )
            })
            .collect()
    }

    /// `running` sessions whose task has already exited.
    pub async fn orphaned(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|e| {
                e.record.status == SessionStatus::Running
                    && e.handle.as_ref().is_some_and(RelayHandle::is_finished)
            })
            .map(|e| e.record.id.clone())
            .collect()
    }

    /// `starting` sessions created more than `max_age` ago.
    pub async fn stale_starting(&self, max_age: Duration) -> Vec<String> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        inner
            .sessions
            .values()
            .filter(|e| {
                e.record.status == SessionStatus::Starting
                    && (now - e.record.created_at).to_std().is_ok_and(|age| age > max_age)
            })
            .map(|e| e.record.id.clone())
            .collect()
    }

    /// Purge terminal sessions that finished more than `retention` ago.
    pub async fn purge_terminal(&self, retention: Duration) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|e| {
                e.record.status.is_terminal()
                    && e.handle.is_none()
                    && e.record
                        .finished_at
                        .and_then(|t| (now - t).to_std().ok())
                        .is_some_and(|age| age >= retention)
            })
            .map(|e| e.record.id.clone())
            .collect();

        for id in &expired {
            inner.release_port_if_idle(id);
            inner.sessions.remove(id);
            self.emit(json!({
                "type": "session.removed",
                "session_id": id,
                "reason": "expired",
            }));
        }
        if !expired.is_empty() {
            info!(
                "Purged {} finished session(s), remaining: {}",
                expired.len(),
                inner.sessions.len()
            );
        }
        expired
    }

    /// Stop every live session (used during shutdown).
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .values()
                .filter(|e| !e.record.status.is_terminal())
                .map(|e| e.record.id.clone())
                .collect()
        };
        let count = ids.len();
        for id in ids {
            let _ = self.terminate(&id, Some("server shutting down".to_string())).await;
        }
        if count > 0 {
            info!("Shut down {count} session(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::{LogStreamParams, PortForwardParams};
    use tokio_util::sync::CancellationToken;

    fn registry(max: usize) -> SessionRegistry {
        let (tx, _) = broadcast::channel(64);
        SessionRegistry::new(max, tx)
    }

    fn pf(local: u16) -> SessionParams {
        SessionParams::PortForward(PortForwardParams {
            local_port: local,
            remote_port: 80,
        })
    }

    fn logs() -> SessionParams {
        SessionParams::LogStream(LogStreamParams {
            tail_lines: 10,
            follow: false,
            buffer_size: 10,
        })
    }

    fn idle_handle() -> RelayHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { token.cancelled().await });
        RelayHandle::new(cancel, task)
    }

    #[tokio::test]
    async fn test_concurrent_creates_same_port_single_winner() {
        let reg = registry(64);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                reg.create("default", "web-0", pf(18080)).await
            }));
        }
        let mut ok = 0;
        let mut in_use = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(SessionError::PortInUse(18080)) => in_use += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(in_use, 15);
    }

    #[tokio::test]
    async fn test_same_remote_port_different_local_ports() {
        let reg = registry(8);
        reg.create("default", "web-0", pf(18081)).await.unwrap();
        reg.create("default", "web-0", pf(18082)).await.unwrap();
        assert_eq!(reg.counts().await.port_forward, 2);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let reg = registry(8);
        let id = reg.create("default", "web-0", pf(18083)).await.unwrap();
        reg.attach_handle(&id, idle_handle()).await.unwrap();
        assert!(reg.mark_running(&id).await);

        reg.terminate(&id, None).await.unwrap();
        assert_eq!(reg.get(&id).await.unwrap().status, SessionStatus::Stopped);
        reg.terminate(&id, None).await.unwrap();
        assert_eq!(reg.get(&id).await.unwrap().status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_terminate_unknown_is_not_found() {
        let reg = registry(8);
        assert_eq!(
            reg.terminate("nope", None).await,
            Err(SessionError::NotFound("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_port_available_again_after_stop() {
        let reg = registry(8);
        let id = reg.create("default", "web-0", pf(18084)).await.unwrap();
        reg.attach_handle(&id, idle_handle()).await.unwrap();
        reg.mark_running(&id).await;
        assert!(reg.is_port_reserved(18084).await);

        reg.terminate(&id, None).await.unwrap();
        assert!(!reg.is_port_reserved(18084).await);
        reg.create("default", "web-1", pf(18084)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_starting_holds_port_until_handle_returned() {
        let reg = registry(8);
        let id = reg.create("default", "web-0", pf(18085)).await.unwrap();
        reg.terminate(&id, None).await.unwrap();
        // manager has not reported back yet
        assert!(reg.is_port_reserved(18085).await);

        let handle = reg.attach_handle(&id, idle_handle()).await.unwrap_err();
        handle.shutdown(Duration::from_secs(1)).await;
        reg.release_port(&id).await;
        assert!(!reg.is_port_reserved(18085).await);
    }

    #[tokio::test]
    async fn test_abandon_leaves_no_entry_or_reservation() {
        let reg = registry(8);
        let id = reg.create("default", "web-0", pf(18086)).await.unwrap();
        reg.abandon(&id).await;
        assert!(matches!(reg.get(&id).await, Err(SessionError::NotFound(_))));
        assert!(!reg.is_port_reserved(18086).await);
    }

    #[tokio::test]
    async fn test_invalid_parameters_never_enter_registry() {
        let reg = registry(8);
        assert!(matches!(
            reg.create("default", "", pf(18087)).await,
            Err(SessionError::InvalidParameter(_))
        ));
        assert!(matches!(
            reg.create("default", "web-0", pf(0)).await,
            Err(SessionError::InvalidParameter(_))
        ));
        assert!(reg.list(&SessionFilter::default()).await.is_empty());
        assert!(!reg.is_port_reserved(0).await);
    }

    #[tokio::test]
    async fn test_limit_counts_only_live_sessions() {
        let reg = registry(1);
        let id = reg.create("default", "web-0", logs()).await.unwrap();
        assert_eq!(
            reg.create("default", "web-0", logs()).await,
            Err(SessionError::LimitReached(1))
        );
        reg.terminate(&id, None).await.unwrap();
        reg.create("default", "web-0", logs()).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let reg = registry(8);
        let a = reg.create("default", "web-0", pf(18088)).await.unwrap();
        let b = reg.create("default", "web-0", logs()).await.unwrap();
        let c = reg.create("monitoring", "prom-0", logs()).await.unwrap();

        let all = reg.list(&SessionFilter::default()).await;
        assert_eq!(all.len(), 3);

        let default_ns = reg
            .list(&SessionFilter {
                namespace: Some("default".into()),
                kind: None,
            })
            .await;
        let ids: Vec<_> = default_ns.iter().map(|v| v.id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));

        let log_streams = reg
            .list(&SessionFilter {
                namespace: None,
                kind: Some(SessionKind::LogStream),
            })
            .await;
        assert_eq!(log_streams.len(), 2);
        assert!(log_streams.iter().any(|v| v.id == c));
    }

    #[tokio::test]
    async fn test_mark_status_ignores_illegal_transition() {
        let reg = registry(8);
        let id = reg.create("default", "web-0", logs()).await.unwrap();
        assert!(reg.mark_status(&id, SessionStatus::Error, Some("boom".into())).await);
        assert!(!reg.mark_running(&id).await);
        let view = reg.get(&id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Error);
        assert_eq!(view.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_purge_terminal_sessions() {
        let reg = registry(8);
        let stopped = reg.create("default", "web-0", logs()).await.unwrap();
        let live = reg.create("default", "web-1", logs()).await.unwrap();
        reg.terminate(&stopped, None).await.unwrap();

        let purged = reg.purge_terminal(Duration::ZERO).await;
        assert_eq!(purged, vec![stopped.clone()]);
        assert!(reg.get(&stopped).await.is_err());
        assert!(reg.get(&live).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_purges_record() {
        let reg = registry(8);
        let id = reg.create("default", "web-0", pf(18089)).await.unwrap();
        reg.remove(&id).await.unwrap();
        assert!(reg.get(&id).await.is_err());
        assert!(!reg.is_port_reserved(18089).await);
    }

    #[tokio::test]
    async fn test_lifecycle_events_broadcast() {
        let (tx, mut rx) = broadcast::channel(16);
        let reg = SessionRegistry::new(8, tx);
        let id = reg.create("default", "web-0", logs()).await.unwrap();
        reg.mark_running(&id).await;

        let created = rx.recv().await.unwrap();
        assert_eq!(created["type"], "session.created");
        assert_eq!(created["session"]["id"], id.as_str());

        let changed = rx.recv().await.unwrap();
        assert_eq!(changed["type"], "session.status_changed");
        assert_eq!(changed["status"], "running");
    }
}
