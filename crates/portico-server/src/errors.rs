//! Error types for the server, registries, and transports.

use portico_core::{CloseFrameError, Opcode, SessionId};
use thiserror::Error;

/// Errors surfaced to embedders by configuration and API calls.
///
/// Network faults on individual sessions never become a `ServerError` on
/// their own; they are logged and the session is eventually swept.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Service path failed normalization.
    #[error("invalid service path {path:?}: {reason}")]
    InvalidPath {
        /// Path as given.
        path: String,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// A service is already registered at this path.
    #[error("a service is already registered at {0}")]
    DuplicatePath(String),
    /// `secure` was requested without certificate material.
    #[error("secure server requires a certificate and a private key")]
    MissingCertificate,
    /// Certificate or key could not be loaded.
    #[error("TLS configuration error: {0}")]
    Tls(String),
    /// Listen address is neither an IP literal nor `localhost`.
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
    /// Wait time of zero.
    #[error("wait time must be greater than zero")]
    InvalidWaitTime,
    /// Close code or reason rejected.
    #[error(transparent)]
    Close(#[from] CloseFrameError),
    /// No live session with this id.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    /// Only text and binary payloads can be sent as messages.
    #[error("{0} frames cannot be sent as messages")]
    UnsupportedOpcode(Opcode),
    /// Payload length above the registry's message size limit.
    #[error("message of {length} bytes exceeds the {limit}-byte limit")]
    MessageTooLarge {
        /// Requested length.
        length: usize,
        /// Configured `max_message_size`.
        limit: usize,
    },
    /// Text payload is not UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidText,
    /// A stopped server cannot be started again.
    #[error("server has already stopped")]
    AlreadyStopped,
    /// Transport-level failure on a single session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Accept loop failed and the server was torn down.
    #[error("listener failed: {0}")]
    Listener(String),
    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Failure delivering a frame on one connection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection is not in the `Open` state.
    #[error("connection is not open")]
    NotOpen,
    /// Writer has gone away.
    #[error("connection closed")]
    Closed,
    /// Outbound queue is full; the frame was dropped.
    #[error("outbound queue full")]
    QueueFull,
    /// Operation did not finish in time.
    #[error("timed out")]
    Timeout,
    /// WebSocket protocol or socket error.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Compressor failed or is missing.
    #[error("compression failed: {0}")]
    Compression(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_path_display() {
        let err = ServerError::InvalidPath {
            path: "chat".into(),
            reason: "must start with '/'",
        };
        assert_eq!(
            err.to_string(),
            "invalid service path \"chat\": must start with '/'"
        );
    }

    #[test]
    fn close_error_is_transparent() {
        let err: ServerError = CloseFrameError::MandatoryExtension.into();
        assert_eq!(err.to_string(), CloseFrameError::MandatoryExtension.to_string());
    }

    #[test]
    fn transport_error_converts() {
        let err: ServerError = TransportError::Timeout.into();
        assert!(matches!(err, ServerError::Transport(TransportError::Timeout)));
        assert_eq!(err.to_string(), "transport error: timed out");
    }

    #[test]
    fn unsupported_opcode_display() {
        let err = ServerError::UnsupportedOpcode(Opcode::Ping);
        assert_eq!(err.to_string(), "ping frames cannot be sent as messages");
    }
}
