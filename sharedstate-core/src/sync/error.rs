//! Sync error types.

use thiserror::Error;

/// Errors that can occur during sync client operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid server url {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: &'static str },

    #[error("no tokio runtime available to drive the connection")]
    NoRuntime,

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("websocket error: {0}")]
    WebSocketError(String),

    #[error("sync protocol error: {0}")]
    ProtocolError(String),

    #[error("handshake failed: {0}")]
    HandshakeError(String),

    #[error("CBOR error: {0}")]
    CborError(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("HTTP error: {0}")]
    HttpError(String),
}
