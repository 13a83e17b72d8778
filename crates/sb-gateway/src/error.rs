use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

/// Per-operation failures surfaced at the channel dispatch boundary.
///
/// Every variant becomes an error-shaped payload scoped to the failing
/// channel/action; none of them crash the connection or the process.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Channel '{channel}' does not support '{action}'")]
    UnsupportedMessage { channel: String, action: String },
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("Session already running: {0}")]
    AlreadyRunning(Uuid),
    #[error("Failed to spawn process: {0}")]
    SpawnFailure(String),
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Failed to watch path: {0}")]
    WatchFailed(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::UnknownChannel(_) => "UNKNOWN_CHANNEL",
            GatewayError::UnsupportedMessage { .. } => "UNSUPPORTED_MESSAGE",
            GatewayError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            GatewayError::AlreadyRunning(_) => "ALREADY_RUNNING",
            GatewayError::SpawnFailure(_) => "SPAWN_FAILURE",
            GatewayError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            GatewayError::InvalidPayload(_) => "INVALID_PAYLOAD",
            GatewayError::WatchFailed(_) => "WATCH_FAILED",
        }
    }
}

impl From<sb_agent::AgentError> for GatewayError {
    fn from(err: sb_agent::AgentError) -> Self {
        match err {
            sb_agent::AgentError::SessionNotFound(id) => GatewayError::SessionNotFound(id),
            sb_agent::AgentError::AlreadyRunning(id) => GatewayError::AlreadyRunning(id),
            sb_agent::AgentError::Store(msg) => GatewayError::InvalidPayload(msg),
        }
    }
}

impl From<sb_pty::PtyError> for GatewayError {
    fn from(err: sb_pty::PtyError) -> Self {
        match err {
            sb_pty::PtyError::SessionNotFound(id) => GatewayError::SessionNotFound(id),
            other => GatewayError::SpawnFailure(other.to_string()),
        }
    }
}

/// JSON error body for the REST control surface.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new("UNAUTHORIZED", "Authentication required")
    }
}

#[derive(Debug)]
pub struct ApiErrorResponse {
    pub status: StatusCode,
    pub error: ApiError,
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&self.error).unwrap_or_default();
        (self.status, [("content-type", "application/json")], body).into_response()
    }
}

impl From<(StatusCode, ApiError)> for ApiErrorResponse {
    fn from((status, error): (StatusCode, ApiError)) -> Self {
        Self { status, error }
    }
}
