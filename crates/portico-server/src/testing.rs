//! In-memory transport for registry and host tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portico_core::{CloseFrame, CompressionMethod, ConnectionState, Opcode};

use crate::errors::TransportError;
use crate::handshake::HandshakeContext;
use crate::transport::{Delivery, FrameCache, Transport};

/// Records everything sent to it. Answers pings unless told otherwise.
pub(crate) struct FakeTransport {
    state: AtomicU8,
    answers_pings: AtomicBool,
    fail_sends: AtomicBool,
    completes_close: AtomicBool,
    compression: CompressionMethod,
    pings: AtomicUsize,
    sent: Mutex<Vec<(Opcode, Bytes)>>,
    closes: Mutex<Vec<CloseFrame>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_compression(CompressionMethod::None)
    }

    pub(crate) fn with_compression(compression: CompressionMethod) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            answers_pings: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            completes_close: AtomicBool::new(true),
            compression,
            pings: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_answers_pings(&self, answers: bool) {
        self.answers_pings.store(answers, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Peer never answers the close handshake; the session stays `Closing`.
    pub(crate) fn set_completes_close(&self, completes: bool) {
        self.completes_close.store(completes, Ordering::SeqCst);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<(Opcode, Bytes)> {
        self.sent.lock().clone()
    }

    pub(crate) fn closes(&self) -> Vec<CloseFrame> {
        self.closes.lock().clone()
    }

    pub(crate) fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn send(&self, opcode: Opcode, frame: &FrameCache) -> Delivery {
        let result = if self.state() != ConnectionState::Open {
            Err(TransportError::NotOpen)
        } else if self.fail_sends.load(Ordering::SeqCst) {
            Err(TransportError::Protocol("connection reset".into()))
        } else {
            frame.for_method(self.compression).map(|payload| {
                self.sent.lock().push((opcode, payload));
            })
        };
        Box::pin(async move { result })
    }

    async fn ping(&self, _payload: Bytes, _timeout: Duration) -> bool {
        let _ = self.pings.fetch_add(1, Ordering::SeqCst);
        self.state() == ConnectionState::Open && self.answers_pings.load(Ordering::SeqCst)
    }

    async fn close(&self, frame: &CloseFrame, _wait: Duration) {
        self.closes.lock().push(frame.clone());
        let next = if !frame.is_sendable() || self.completes_close.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else {
            ConnectionState::Closing
        };
        self.set_state(next);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn compression(&self) -> CompressionMethod {
        self.compression
    }
}

pub(crate) fn test_context(path: &str) -> HandshakeContext {
    let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    HandshakeContext::new(path, peer)
}
