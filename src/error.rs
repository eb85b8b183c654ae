//! Error types for the debug client.

use thiserror::Error;

use crate::protocol::EncodeError;

/// Main error type for all debugger operations.
#[derive(Debug, Error)]
pub enum DebuggerError {
    /// I/O error on the target transport or a dump sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed inbound stream (bad handshake line, unknown dvalue tag).
    #[error("Parse error: {0}")]
    Parse(String),

    /// The target broke the request/reply/notify contract.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A value could not be represented as a dvalue.
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// A request was issued while the session was not attached and handshook.
    #[error("Invalid state for request: not attached")]
    InvalidState,

    /// The target answered a request with an error message.
    #[error("{description} (code {code})")]
    Target {
        /// Error code sent by the target.
        code: i32,
        /// Human readable description sent by the target.
        description: String,
    },

    /// The connection was torn down before the request was answered.
    #[error("Session disconnected")]
    Disconnected,

    /// A bounded wait expired.
    #[error("Timed out")]
    Timeout,

    /// The session driver task is no longer running.
    #[error("Session closed")]
    SessionClosed,
}

/// Result type alias using DebuggerError.
pub type Result<T> = std::result::Result<T, DebuggerError>;
