//! Error types for CodeBox.
//!
//! Infrastructure failures (the sandbox failed) are `Error` values. Failures of
//! the executed code (the sandboxed code failed) are never errors: they arrive
//! as `err` chunks inside a normally returned [`ExecResult`](crate::ExecResult).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::SessionState;

/// Result type alias using CodeBox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error body returned by a remote execution service.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body, or the raw text wrapped in a JSON string.
    pub body: serde_json::Value,
    /// Response headers (lower-cased names).
    pub headers: BTreeMap<String, String>,
}

impl ApiError {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body,
            headers: BTreeMap::new(),
        }
    }

    /// Build from a raw response body. Non-JSON payloads are kept as a string.
    pub fn from_raw(status: u16, raw: &[u8], headers: BTreeMap<String, String>) -> Self {
        let body = serde_json::from_slice(raw).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(raw).into_owned())
        });
        Self {
            status,
            body,
            headers,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name: String = name.into();
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Human-readable message extracted from the body.
    pub fn message(&self) -> String {
        for key in ["detail", "message", "error"] {
            if let Some(msg) = self.body.get(key).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
        match &self.body {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::from("error"),
            other => other.to_string(),
        }
    }

    /// Machine-readable error code, when the service provides one.
    pub fn code(&self) -> Option<&str> {
        self.body.get("code").and_then(|v| v.as_str())
    }

    /// Whether a not-found answer is about the session itself rather than
    /// something inside it.
    pub fn names_missing_session(&self) -> bool {
        if matches!(self.code(), Some("session_not_found" | "codebox_not_found")) {
            return true;
        }
        let message = self.message().to_ascii_lowercase();
        message.contains("not found")
            && (message.starts_with("codebox ") || message.starts_with("session "))
    }

    /// Delay requested by a `retry-after` header, in whole seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message())
    }
}

/// Which kind of endpoint produced an [`ApiError`]. A 404 means different
/// things for a file download and for a session-level call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiScope {
    Session,
    File,
    Restart,
}

/// Core error type for CodeBox.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Session Lifecycle
    // =========================================================================
    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Session busy: an execution is already in flight on session {0}")]
    SessionBusy(String),

    #[error("Unsupported kernel: {0}")]
    UnsupportedKernel(String),

    #[error("Restart failed: {0}")]
    Restart(String),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    // =========================================================================
    // File Transfer
    // =========================================================================
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    // =========================================================================
    // Remote Service
    // =========================================================================
    #[error("Authentication rejected: {0}")]
    Authentication(ApiError),

    #[error("Rate limited: {0}")]
    RateLimit(ApiError),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(ApiError),

    #[error("API error: {0}")]
    Api(ApiError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Container runtime error: {0}")]
    Docker(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a startup error.
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Create a restart error.
    pub fn restart(msg: impl Into<String>) -> Self {
        Self::Restart(msg.into())
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a container runtime error.
    pub fn docker(msg: impl Into<String>) -> Self {
        Self::Docker(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound(path.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify a non-success response from a remote execution service.
    pub fn from_api(api: ApiError, scope: ApiScope) -> Self {
        match (api.status, scope) {
            (401 | 403, _) => Self::Authentication(api),
            (429, _) => Self::RateLimit(api),
            (502..=504, _) => Self::ServiceUnavailable(api),
            (404, ApiScope::File) if api.names_missing_session() => {
                Self::SessionNotFound(api.message())
            }
            (404, ApiScope::File) => Self::FileNotFound(api.message()),
            (404 | 405 | 501, ApiScope::Restart) => Self::Restart(api.message()),
            (404, ApiScope::Session) => Self::SessionNotFound(api.message()),
            (410, _) => Self::SessionExpired(api.message()),
            (409, _) => Self::SessionBusy(api.message()),
            (400 | 422, _) if api.code() == Some("unsupported_kernel") => {
                Self::UnsupportedKernel(api.message())
            }
            _ => Self::Api(api),
        }
    }

    /// Whether the substrate behind the session is gone after this failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Startup(_) | Self::Restart(_) | Self::SessionNotFound(_) | Self::SessionExpired(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
