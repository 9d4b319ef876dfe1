//! P2P error types.

use std::io;
use thiserror::Error;

use crate::peer::ConnectionState;

/// P2P-specific errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A protocol line could not be decoded.
    #[error("Malformed message: {0}")]
    Decode(String),

    /// A line grew past the maximum length without a terminator.
    #[error("Line too long: {size} bytes (max: {max})")]
    LineTooLong { size: usize, max: usize },

    /// Handshake carried a version we do not speak.
    #[error("Incompatible protocol version: {peer_version} (our version: {our_version})")]
    IncompatibleVersion {
        peer_version: String,
        our_version: String,
    },

    /// A connection operation was issued in a state that does not allow it.
    #[error("Invalid connection state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// Invalid peer address.
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    /// Connection id is unknown or stale.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Connection is already closing.
    #[error("Connection closing: {0}")]
    ConnectionClosing(String),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Node is shutting down.
    #[error("Node shutting down")]
    Shutdown,
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
