//! Error taxonomy for session operations.
//!
//! [`SessionError`] covers everything a caller of the registry or one of the
//! managers can get back synchronously. Failures that happen after a session
//! is established (target loss, relay I/O) are recorded on the session record
//! instead and never surface here.

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/// Synchronous failure of a session operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Bad port range, malformed pod/namespace, zero buffer size, ...
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The local port is reserved by another session, or the OS refused the bind.
    #[error("port {0} is already in use")]
    PortInUse(u16),
    /// Unknown or purged session ID.
    #[error("session {0} not found")]
    NotFound(String),
    /// The pod is missing or not running at the time of a synchronous check.
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),
    /// `max_sessions` non-terminal sessions already exist.
    #[error("session limit reached (max {0})")]
    LimitReached(usize),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Machine-readable error code included in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameter(_) => "INVALID_PARAMETER",
            Self::PortInUse(_) => "PORT_IN_USE",
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::TargetUnavailable(_) => "TARGET_UNAVAILABLE",
            Self::LimitReached(_) => "SESSION_LIMIT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidParameter(_) | Self::TargetUnavailable(_) => StatusCode::BAD_REQUEST,
            Self::PortInUse(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::LimitReached(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Lets handlers returning `Result<Json<Value>, (StatusCode, Json<Value>)>`
/// use `?` on registry and manager calls.
impl From<SessionError> for (StatusCode, Json<Value>) {
    fn from(err: SessionError) -> Self {
        (
            err.status_code(),
            Json(json!({
                "error": err.to_string(),
                "code": err.code(),
            })),
        )
    }
}
