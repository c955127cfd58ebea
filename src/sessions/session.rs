//! Session records, the shared status state machine, and serializable views.
//!
//! A [`SessionRecord`] is the registry's bookkeeping for one port-forward
//! tunnel or log stream. Runtime counters live in a separate
//! [`SessionStats`] behind an `Arc` so relay and stream tasks can update them
//! without taking the registry lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::validate;
use crate::error::SessionError;

/// Which manager owns a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    PortForward,
    LogStream,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PortForward => "port-forward",
            Self::LogStream => "log-stream",
        }
    }
}

/// Session lifecycle status.
///
/// ```text
/// starting -> running | error | stopped
/// running  -> stopped | error
/// error, stopped: terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Error,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Stopped)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match self {
            Self::Starting => matches!(next, Self::Running | Self::Error | Self::Stopped),
            Self::Running => matches!(next, Self::Stopped | Self::Error),
            Self::Error | Self::Stopped => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a port-forward session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForwardParams {
    /// Host port the listener binds. Exclusive among non-terminal sessions.
    pub local_port: u16,
    /// Pod-side port every accepted connection is relayed to.
    pub remote_port: u16,
}

/// Parameters of a log-stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStreamParams {
    /// Historical lines requested at start.
    pub tail_lines: u32,
    /// Keep delivering new lines until stopped.
    pub follow: bool,
    /// Ring-buffer capacity for lines retained for late readers.
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionParams {
    PortForward(PortForwardParams),
    LogStream(LogStreamParams),
}

impl SessionParams {
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::PortForward(_) => SessionKind::PortForward,
            Self::LogStream(_) => SessionKind::LogStream,
        }
    }

    /// The local port this session reserves, if any.
    pub fn local_port(&self) -> Option<u16> {
        match self {
            Self::PortForward(p) => Some(p.local_port),
            Self::LogStream(_) => None,
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        match self {
            Self::PortForward(p) => {
                validate::check_port("localPort", i64::from(p.local_port))?;
                validate::check_port("remotePort", i64::from(p.remote_port))?;
            }
            Self::LogStream(p) => {
                if p.buffer_size == 0 {
                    return Err(SessionError::InvalidParameter(
                        "buffer must be a positive integer".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Lock-free runtime counters shared between the registry and the task
/// driving the session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub failed_connections: AtomicU64,
    /// Bytes copied local -> pod.
    pub bytes_in: AtomicU64,
    /// Bytes copied pod -> local.
    pub bytes_out: AtomicU64,
    pub lines_delivered: AtomicU64,
}

impl SessionStats {
    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Registry bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub namespace: String,
    pub pod: String,
    pub params: SessionParams,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stats: Arc<SessionStats>,
}

impl SessionRecord {
    pub fn new(id: String, namespace: &str, pod: &str, params: SessionParams) -> Self {
        Self {
            id,
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            params,
            status: SessionStatus::Starting,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.params.kind()
    }

    /// Apply a status transition. Returns `false` (and changes nothing) when
    /// the state machine forbids it.
    pub fn transition(&mut self, next: SessionStatus, error: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        if next == SessionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        if error.is_some() {
            self.last_error = error;
        }
        true
    }

    pub fn view(&self) -> SessionView {
        let stats = &self.stats;
        let detail = match self.params {
            SessionParams::PortForward(p) => SessionDetail::PortForward {
                local_port: p.local_port,
                remote_port: p.remote_port,
                url: format!("http://localhost:{}", p.local_port),
                active_connections: SessionStats::load(&stats.active_connections),
                total_connections: SessionStats::load(&stats.total_connections),
                failed_connections: SessionStats::load(&stats.failed_connections),
                bytes_in: SessionStats::load(&stats.bytes_in),
                bytes_out: SessionStats::load(&stats.bytes_out),
            },
            SessionParams::LogStream(p) => SessionDetail::LogStream {
                tail_lines: p.tail_lines,
                follow: p.follow,
                buffer_size: p.buffer_size,
                lines_delivered: SessionStats::load(&stats.lines_delivered),
            },
        };
        SessionView {
            id: self.id.clone(),
            kind: self.kind(),
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_error: self.last_error.clone(),
            detail,
        }
    }
}

/// Point-in-time snapshot of a session, as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub kind: SessionKind,
    pub namespace: String,
    pub pod: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub detail: SessionDetail,
}

/// Kind-specific fields, flattened into [`SessionView`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SessionDetail {
    #[serde(rename_all = "camelCase")]
    PortForward {
        local_port: u16,
        remote_port: u16,
        url: String,
        active_connections: u64,
        total_connections: u64,
        failed_connections: u64,
        bytes_in: u64,
        bytes_out: u64,
    },
    #[serde(rename_all = "camelCase")]
    LogStream {
        tail_lines: u32,
        follow: bool,
        buffer_size: usize,
        lines_delivered: u64,
    },
}
