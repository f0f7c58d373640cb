//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **Domain errors** (`CodecError`, `UpstreamError`, `PoolError`, `TransportError`,
//!   `SessionError`) describe what can go wrong inside the audio path. They are plain
//!   `thiserror` enums so the pipeline can match on them and decide whether a failure
//!   only drops one frame or ends the whole session.
//! - **`AppError`** is what HTTP handlers return. It knows how to turn itself into a JSON
//!   response, the same way every endpoint of the service reports failures.
//!
//! ## Propagation Policy:
//! - Codec, pool-timeout and upstream failures are **per frame**: logged, frame dropped
//! - Transport failures on the client socket are **per session**: the session closes
//! - `PoolClosed` means the process is draining: the session closes

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use std::time::Duration;
use thiserror::Error;

/// Audio codec precondition violations.
///
/// The caller's frame is dropped; the session keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A zero-length packet reached the codec
    #[error("empty audio packet")]
    EmptyPacket,

    /// The bytes do not form whole samples of the expected encoding
    #[error("invalid audio input: {0}")]
    InvalidInput(String),
}

/// Failures reported by a remote audio connection.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The connection was already judged unhealthy and must not be used
    #[error("upstream connection is not healthy")]
    Unhealthy,

    /// Network-level failure talking to the speech API
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The speech API answered with a non-success status
    #[error("upstream returned status {0}")]
    Status(u16),

    /// `receive` was called but no response payload is available
    #[error("upstream produced no audio response")]
    NoResponse,

    /// The response could not be decoded
    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    /// The remote side closed the channel
    #[error("upstream connection closed")]
    Closed,
}

/// Connection pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available within the bounded wait
    #[error("timed out after {0:?} waiting for an upstream connection")]
    Timeout(Duration),

    /// The caller's cancellation scope fired while waiting
    #[error("acquire cancelled")]
    Cancelled,

    /// `acquire` after `shutdown`
    #[error("connection pool is closed")]
    PoolClosed,

    /// The connection factory could not open a new connection
    #[error("failed to open upstream connection: {0}")]
    Connect(#[from] UpstreamError),
}

/// Client-side WebSocket failures. All of them end the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Nothing (not even a pong) arrived before the inactivity deadline
    #[error("client read deadline exceeded")]
    ReadTimeout,

    /// The client closed with a code that is not a normal shutdown
    #[error("client closed abnormally (code {code}): {reason}")]
    AbnormalClose { code: u16, reason: String },

    /// The WebSocket protocol layer rejected a frame
    #[error("websocket protocol error: {0}")]
    Protocol(String),

    /// The client socket is gone and cannot take more frames
    #[error("failed to write to client")]
    WriteFailed,

    /// A write did not complete within its deadline
    #[error("client write deadline exceeded")]
    WriteTimeout,

    /// The keepalive ping could not be sent in time
    #[error("failed to send keepalive ping")]
    PingFailed,
}

/// Terminal session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection pool closed while session was active")]
    PoolClosed,
}

/// Errors returned by HTTP handlers.
///
/// ## Error Categories:
/// - **ServiceUnavailable**: The gateway is at its session limit (503)
/// - **ShuttingDown**: The process is draining and refuses new sessions (503)
#[derive(Debug)]
pub enum AppError {
    /// Too many concurrent client sessions
    ServiceUnavailable(String),

    /// New sessions are refused while the server drains
    ShuttingDown,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ShuttingDown => write!(f, "Server is shutting down"),
        }
    }
}

/// Converts handler errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum concurrent sessions (1000) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::SERVICE_UNAVAILABLE
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::ServiceUnavailable(msg) => ("service_unavailable", msg.clone()),
            AppError::ShuttingDown => ("shutting_down", self.to_string()),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}
