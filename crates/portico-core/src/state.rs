//! Lifecycle states for servers, registries, and sessions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a server or a session registry.
///
/// Transitions only move forward: `Ready → Start → ShuttingDown → Stop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerState {
    /// Configured, not yet started.
    Ready,
    /// Accepting work.
    Start,
    /// Teardown in progress.
    ShuttingDown,
    /// Fully stopped.
    Stop,
}

impl ServerState {
    /// Whether configuration may still change.
    pub fn is_configurable(self) -> bool {
        self == Self::Ready
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Start => "start",
            Self::ShuttingDown => "shutting_down",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// State of one WebSocket connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum ConnectionState {
    /// Opening handshake not yet complete.
    Connecting = 0,
    /// Data may flow in both directions.
    Open = 1,
    /// A close frame has been sent or received.
    Closing = 2,
    /// Transport is gone.
    Closed = 3,
}

impl ConnectionState {
    /// Encode for storage in an `AtomicU8`.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a value produced by [`Self::as_u8`]. Unknown values map to `Closed`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}
