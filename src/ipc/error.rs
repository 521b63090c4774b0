//! Error taxonomy for the IPC layer.
//!
//! Transport-level errors are local to one connection; handler errors never
//! appear here (they travel back to the requester as `error` envelopes).

use std::io;

use thiserror::Error;

/// Errors produced by the IPC core.
#[derive(Debug, Error)]
pub enum IpcError {
    /// A client operation was attempted without an active connection.
    #[error("not connected to helper")]
    NotConnected,

    /// Dialing the helper address failed (absent, refused, or timed out).
    #[error("failed to dial {address}: {source}")]
    Dial {
        /// The address that was dialed.
        address: String,
        /// The underlying dial failure.
        source: io::Error,
    },

    /// A read or write failed mid-session.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The connection was closed, either by the peer (clean EOF) or locally.
    ///
    /// Reported distinctly from [`IpcError::Transport`] so callers can tell
    /// an orderly close from mid-stream corruption.
    #[error("connection closed")]
    ConnectionClosed,

    /// A payload could not be encoded to JSON.
    #[error("failed to encode payload: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Received bytes were malformed, or the payload does not fit the
    /// requested target shape.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// A deadline elapsed before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// Another live server already owns the address, or this server is
    /// already started.
    #[error("another instance is already running at {0}")]
    AlreadyRunning(String),
}

impl IpcError {
    /// Build a [`IpcError::Dial`] from an address and an I/O failure.
    pub fn dial(address: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            address: address.into(),
            source,
        }
    }

    /// Build a [`IpcError::Dial`] for a dial that exceeded its timeout.
    pub fn dial_timeout(address: impl Into<String>) -> Self {
        Self::Dial {
            address: address.into(),
            source: io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
        }
    }
}
