//! Target resolver abstraction: how sessions reach a pod.
//!
//! [`TargetResolver`] is the seam between the session managers and the
//! cluster. [`cluster::KubeResolver`] talks to the Kubernetes API; tests use an
//! in-process fake that serves TCP echo upstreams and scripted log lines.

pub mod cluster;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Liveness of a pod as seen by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Running,
    Pending,
    /// Deletion requested (graceful termination in progress).
    Terminating,
    /// `Succeeded` or `Failed`: containers will not run again.
    Completed,
    /// The pod does not exist.
    Gone,
}

impl TargetState {
    /// Whether sessions targeting this pod may keep running.
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Running | Self::Pending)
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Terminating => "terminating",
            Self::Completed => "completed",
            Self::Gone => "gone",
        })
    }
}

/// What the API reports about a pod, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    /// Pod phase as reported (`Running`, `Pending`, ...).
    pub phase: String,
    pub node: Option<String>,
}

/// A bidirectional byte stream to a pod port.
pub trait Upstream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Upstream for T {}

pub type BoxUpstream = Box<dyn Upstream>;

/// Lines of a container log, without trailing newlines.
pub type LogLines = BoxStream<'static, io::Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRequest {
    /// Historical lines to replay before following. `0` means none.
    pub tail_lines: u32,
    pub follow: bool,
    /// Prefix each line with the kubelet's RFC 3339 timestamp.
    pub timestamps: bool,
    /// Only lines at or after this instant. Takes precedence over
    /// `tail_lines`.
    pub since_time: Option<DateTime<Utc>>,
}

/// Split the kubelet timestamp prefix off a log line.
pub fn split_timestamp(line: &str) -> Option<(DateTime<Utc>, &str)> {
    let (stamp, rest) = line.split_once(' ').unwrap_or((line, ""));
    let at = DateTime::parse_from_rfc3339(stamp).ok()?;
    Some((at.with_timezone(&Utc), rest))
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("pod {namespace}/{pod} not found")]
    PodNotFound { namespace: String, pod: String },

    #[error("kubernetes API error: {0}")]
    Api(String),

    #[error("log stream error: {0}")]
    Stream(String),

    #[error("connect to port {port} failed: {message}")]
    Connect { port: u16, message: String },
}

#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Current state of a pod.
    async fn probe(&self, namespace: &str, pod: &str) -> Result<TargetState, TargetError>;

    /// Phase and node of a pod.
    async fn describe(&self, namespace: &str, pod: &str) -> Result<PodSummary, TargetError>;

    /// Open a fresh byte stream to `port` inside the pod.
    async fn connect(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<BoxUpstream, TargetError>;

    /// Open the pod's container log as a line stream.
    async fn log_lines(
        &self,
        namespace: &str,
        pod: &str,
        request: LogRequest,
    ) -> Result<LogLines, TargetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_and_pending_are_alive() {
        assert!(TargetState::Running.is_alive());
        assert!(TargetState::Pending.is_alive());
        assert!(!TargetState::Terminating.is_alive());
        assert!(!TargetState::Completed.is_alive());
        assert!(!TargetState::Gone.is_alive());
    }

    #[test]
    fn test_split_timestamp() {
        let (at, rest) = split_timestamp("2024-05-01T10:00:00.123456789Z GET /healthz 200").unwrap();
        assert_eq!(at, DateTime::parse_from_rfc3339("2024-05-01T10:00:00.123456789Z").unwrap());
        assert_eq!(rest, "GET /healthz 200");

        let (_, rest) = split_timestamp("2024-05-01T10:00:00Z").unwrap();
        assert_eq!(rest, "");

        assert!(split_timestamp("plain line").is_none());
        assert!(split_timestamp("").is_none());
    }
}
