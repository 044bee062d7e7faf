//! Per-connection transport abstraction.
//!
//! The registry only talks to sessions through [`Transport`], so sweeping,
//! broadcasting and shutdown can be exercised without sockets.

pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use portico_core::{CloseFrame, CompressionMethod, ConnectionState, Opcode};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::TransportError;

pub use websocket::{WsEvent, WsReceiver, WsStream, WsTransport};

/// Raw byte stream under a WebSocket (plain TCP or TLS).
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased connection stream.
pub type BoxedIo = Box<dyn Io>;

/// Compresses a payload for one method. Supplied by the embedder.
pub type Compressor =
    Arc<dyn Fn(CompressionMethod, &[u8]) -> Result<Bytes, String> + Send + Sync>;

/// Completion of a queued send.
pub type Delivery = BoxFuture<'static, Result<(), TransportError>>;

/// Send, ping and close operations on one connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a data frame.
    ///
    /// The frame is queued before this returns, so frames queued by one
    /// caller reach the wire in call order whether or not the returned
    /// [`Delivery`] is awaited. The delivery resolves once the frame was
    /// written or failed.
    fn send(&self, opcode: Opcode, frame: &FrameCache) -> Delivery;

    /// Send a ping and wait up to `timeout` for a pong.
    async fn ping(&self, payload: Bytes, timeout: Duration) -> bool;

    /// Close with `frame`, waiting up to `wait` for the peer's close.
    ///
    /// Frames that must not be sent (1006 and friends) tear the connection
    /// down immediately.
    async fn close(&self, frame: &CloseFrame, wait: Duration);

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Compression negotiated for this connection.
    fn compression(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

/// A data message received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncomingMessage {
    /// UTF-8 text.
    Text(String),
    /// Arbitrary bytes.
    Binary(Bytes),
}

impl IncomingMessage {
    /// Opcode the message arrived with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Text(_) => Opcode::Text,
            Self::Binary(_) => Opcode::Binary,
        }
    }

    /// Payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Text content, if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

/// A payload plus its compressed forms, computed at most once per method.
///
/// One cache is shared by every recipient of a broadcast.
pub struct FrameCache {
    payload: Bytes,
    compressor: Option<Compressor>,
    compressed: Mutex<HashMap<CompressionMethod, Bytes>>,
}

impl FrameCache {
    /// Cache for an uncompressed payload.
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            compressor: None,
            compressed: Mutex::new(HashMap::new()),
        }
    }

    /// Cache that compresses through `compressor` on demand.
    pub fn with_compressor(payload: Bytes, compressor: Option<Compressor>) -> Self {
        Self {
            compressor,
            ..Self::new(payload)
        }
    }

    /// Raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload encoded for `method`.
    pub fn for_method(&self, method: CompressionMethod) -> Result<Bytes, TransportError> {
        if method == CompressionMethod::None {
            return Ok(self.payload.clone());
        }
        let mut compressed = self.compressed.lock();
        if let Some(bytes) = compressed.get(&method) {
            return Ok(bytes.clone());
        }
        let compressor = self.compressor.as_ref().ok_or_else(|| {
            TransportError::Compression(format!("no compressor configured for {method:?}"))
        })?;
        let bytes = compressor(method, &self.payload).map_err(TransportError::Compression)?;
        let _ = compressed.insert(method, bytes.clone());
        Ok(bytes)
    }
}
