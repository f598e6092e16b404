// Error types shared by the relay core and the HTTP surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors produced while serving one client request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No live upstream channel and recovery did not bring one up.
    #[error("upstream channel unavailable: {0}")]
    TransportUnavailable(String),

    /// An account switch or recovery is in progress.
    #[error("server is busy switching accounts, retry shortly")]
    Busy,

    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Malformed client request body.
    #[error("invalid request: {0}")]
    Translation(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("{0}")]
    Auth(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TransportUnavailable(_) | Self::Busy => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Translation(_) => StatusCode::BAD_REQUEST,
            Self::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::TransportUnavailable(_) | Self::Busy => "service_unavailable",
            Self::Upstream { .. } => "api_error",
            Self::Translation(_) => "invalid_request_error",
            Self::Queue(_) => "internal_error",
            Self::Auth(_) => "authentication_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16()
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Per-request message queue failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue already exists for request {0}")]
    AlreadyExists(String),

    #[error("no queue for request {0}")]
    NotFound(String),

    #[error("timed out waiting for a message")]
    Timeout,

    /// The queue was destroyed while a consumer was waiting.
    #[error("queue closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no live upstream channel")]
    NoChannel,
}

/// Failures of the upstream session collaborator.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("account {0} has no auth file")]
    UnknownAccount(usize),

    #[error("automation channel for account {index} did not connect within {waited_ms}ms")]
    ChannelTimeout { index: usize, waited_ms: u64 },

    #[error("no live channel and no launcher configured")]
    NoLauncher,

    #[error("failed to spawn launcher: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Account rotation outcomes that are not a clean switch.
#[derive(Debug, Error)]
pub enum RotationError {
    /// Another rotation or recovery holds the lock.
    #[error("an account switch is already in progress")]
    Busy,

    #[error("only one usable account is available, nothing to switch to")]
    OnlyOneAccount,

    #[error("account {0} is not a usable account")]
    InvalidAccount(usize),

    /// The switch failed but the previous account was restored.
    #[error("switch to account {target} failed ({reason}), fell back to account {previous}")]
    FallbackSucceeded {
        target: usize,
        previous: usize,
        reason: String,
    },

    /// Both the switch and the fallback failed.
    #[error("switch to account {target} failed ({reason}) and fallback to account {previous} also failed ({fallback_reason})")]
    FallbackFailed {
        target: usize,
        previous: usize,
        reason: String,
        fallback_reason: String,
    },
}
