//! Error types for crosscall.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all crosscall operations.
#[derive(Debug, Error)]
pub enum CrosscallError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack encode error on the send path.
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    /// Framing error: malformed bytes, an invalid message shape, or a
    /// message the endpoint's mode does not accept. Terminal for the
    /// endpoint that observes it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A call received no response within the configured timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote peer answered the call with an error string.
    #[error("remote error: {0}")]
    Remote(String),

    /// No live connection is attached; the client is reconnecting.
    #[error("not connected to {0}, reconnecting")]
    NotConnected(String),

    /// The connection went away while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using CrosscallError.
pub type Result<T> = std::result::Result<T, CrosscallError>;
