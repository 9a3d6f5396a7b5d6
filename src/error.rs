//! Error types for the session layer.
//!
//! `SessionError` is what callers of the session see. `HandlerError` is what
//! user handlers return, and `DispatchError` is what the error callback
//! receives when a handler fails.

use std::fmt;

use rmpv::Value;
use thiserror::Error;

/// Errors surfaced by session operations.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Malformed wire data (unknown tag, wrong array shape, oversized message).
    #[error("Framing error: {0}")]
    Framing(String),

    /// The peer closed the connection.
    #[error("EOF")]
    Eof,

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The peer answered the request with a non-nil error.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// The operation is not allowed in the current session state.
    #[error("Usage error: {0}")]
    Usage(&'static str),

    /// The session was closed with `close()`.
    #[error("Session closed")]
    Closed,

    /// The setup callback passed to `run_with_setup` failed.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// The loop was interrupted by a signal.
    #[error("Interrupted")]
    Interrupted,
}

impl SessionError {
    /// Whether this error ends the session (no further traffic is possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::Framing(_) | SessionError::Eof | SessionError::Io(_) | SessionError::Closed
        )
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => SessionError::Eof,
            _ => SessionError::Io(err.to_string()),
        }
    }
}

/// Error payload carried by a Response from the peer.
///
/// Editors usually send `[code, message]`; anything else is kept as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    payload: Value,
}

impl RemoteError {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// The raw error value from the wire.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Numeric code for `[code, message]` payloads.
    pub fn code(&self) -> Option<i64> {
        match &self.payload {
            Value::Array(items) if items.len() == 2 => items[0].as_i64(),
            _ => None,
        }
    }

    /// Human-readable message extracted from the payload.
    pub fn message(&self) -> String {
        match &self.payload {
            Value::Array(items) if items.len() == 2 => value_to_text(&items[1]),
            other => value_to_text(other),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{} (code {})", self.message(), code),
            None => f.write_str(&self.message()),
        }
    }
}

/// Render a wire value as text, decoding strings and binary as UTF-8.
pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => match s.as_str() {
            Some(text) => text.to_string(),
            None => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        },
        Value::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => other.to_string(),
    }
}

/// Failure returned by a request or notification handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Send this value verbatim as the error field of the Response.
    #[error("error response: {0}")]
    Response(Value),

    /// No handler is registered for the method.
    #[error("no handler for method '{0}'")]
    UnknownMethod(String),

    /// A nested request made by the handler failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Value to put in the error field of the Response.
    pub fn to_wire(&self) -> Value {
        match self {
            HandlerError::Response(value) => value.clone(),
            other => Value::from(format!("{:#}", other)),
        }
    }
}

/// Which kind of dispatch context a `DispatchError` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Request,
    Notification,
    Setup,
    ThreadsafeCall,
}

impl fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchKind::Request => "request",
            DispatchKind::Notification => "notification",
            DispatchKind::Setup => "setup",
            DispatchKind::ThreadsafeCall => "threadsafe call",
        };
        f.write_str(name)
    }
}

/// Report handed to the session's error callback when a handler fails.
#[derive(Debug, Clone)]
pub struct DispatchError {
    /// Context the failure happened in.
    pub kind: DispatchKind,
    /// Method name, empty for setup and threadsafe calls.
    pub method: String,
    /// Rendered error (includes panic messages).
    pub message: String,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.method.is_empty() {
            write!(f, "error in {}: {}", self.kind, self.message)
        } else {
            write!(
                f,
                "error while processing {} '{}': {}",
                self.kind, self.method, self.message
            )
        }
    }
}
