//! Error types for the remoting bridge.
//!
//! `RemotingError` covers the socket boundary: framing, encoding and I/O.
//! `MethodError` covers a single request and is collapsed into a JSON-RPC
//! error object only when the response envelope is built.

use thiserror::Error;

use crate::protocol::JsonRpcError;

/// Fixed JSON-RPC error code used for every failed request.
pub const ERROR_CODE: i32 = -1;

/// Transport-level error.
#[derive(Debug, Error)]
pub enum RemotingError {
    /// The peer closed the socket (zero-length frame, EOF, reset).
    #[error("Connection closed")]
    ConnectionClosed,

    /// A length prefix exceeded the frame size limit.
    #[error("Frame size {size} exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Protocol error (bad envelope, malformed buffer).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl RemotingError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, RemotingError::ConnectionClosed)
    }
}

impl From<std::io::Error> for RemotingError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => RemotingError::ConnectionClosed,
            _ => RemotingError::Io(err),
        }
    }
}

/// Result type alias using RemotingError.
pub type Result<T> = std::result::Result<T, RemotingError>;

/// Outcome of a failed method invocation.
#[derive(Debug, Error)]
pub enum MethodError {
    /// Malformed envelope or unknown method name.
    #[error("{0}")]
    Protocol(String),

    /// A session-bound method was invoked before `setContext`.
    #[error("{0}")]
    Precondition(String),

    /// Parameter decoding or plugin code failed.
    #[error("{0:#}")]
    Handler(anyhow::Error),

    /// The socket went away while the method was running. Fatal.
    #[error(transparent)]
    Transport(#[from] RemotingError),
}

impl MethodError {
    pub fn precondition() -> Self {
        MethodError::Precondition(
            "The data source context must be set before invoking other methods.".to_string(),
        )
    }

    /// Convert into the wire error object. Transport errors never reach the wire.
    pub fn to_json_rpc(&self) -> JsonRpcError {
        JsonRpcError {
            code: ERROR_CODE,
            message: self.to_string(),
            data: None,
        }
    }
}

impl From<anyhow::Error> for MethodError {
    fn from(err: anyhow::Error) -> Self {
        MethodError::Handler(err)
    }
}
