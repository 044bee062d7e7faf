//! One live WebSocket connection within a service.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use portico_core::{CloseCode, CloseFrame, ConnectionState, Opcode, SessionId};

use crate::errors::{Result, ServerError};
use crate::handshake::HandshakeContext;
use crate::registry::SessionRegistry;
use crate::transport::{Delivery, FrameCache, Transport};

/// A registered connection.
///
/// Sessions are created by [`SessionRegistry::add`] and owned by their
/// registry until removed.
pub struct Session {
    id: SessionId,
    context: HandshakeContext,
    transport: Arc<dyn Transport>,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    registry: Weak<SessionRegistry>,
    closing_since: Mutex<Option<Instant>>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        context: HandshakeContext,
        transport: Arc<dyn Transport>,
        registry: Weak<SessionRegistry>,
    ) -> Self {
        Self {
            id,
            context,
            transport,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            registry,
            closing_since: Mutex::new(None),
        }
    }

    /// Registry-assigned id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Handshake the session was opened with.
    pub fn context(&self) -> &HandshakeContext {
        &self.context
    }

    /// Connection state as reported by the transport.
    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// When the session was registered.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wall-clock registration time.
    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at_utc
    }

    /// Time since registration.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The registry that owns this session, while it is alive.
    pub fn sessions(&self) -> Option<Arc<SessionRegistry>> {
        self.registry.upgrade()
    }

    /// Send a text or binary message and wait until it is written.
    pub async fn send(&self, opcode: Opcode, payload: Bytes) -> Result<()> {
        self.queue(opcode, payload)?.await?;
        Ok(())
    }

    /// Send a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Opcode::Text, Bytes::from(text.into())).await
    }

    /// Send a binary message.
    pub async fn send_binary(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(Opcode::Binary, payload.into()).await
    }

    /// Queue a message without waiting for it to be written.
    ///
    /// Messages queued from one task reach the wire in call order.
    pub fn queue(&self, opcode: Opcode, payload: Bytes) -> Result<Delivery> {
        let cache = FrameCache::with_compressor(payload, self.compressor());
        self.queue_cached(opcode, &cache)
    }

    pub(crate) fn queue_cached(&self, opcode: Opcode, cache: &FrameCache) -> Result<Delivery> {
        check_data(opcode, cache.payload())?;
        Ok(self.transport.send(opcode, cache))
    }

    /// Ping and wait for the pong, bounded by the registry wait time.
    pub async fn ping(&self) -> bool {
        let wait = self
            .registry
            .upgrade()
            .map_or(Duration::from_secs(1), |registry| registry.wait_time());
        self.transport.ping(Bytes::new(), wait).await
    }

    /// Close with a validated code and reason.
    pub async fn close(&self, code: impl Into<CloseCode>, reason: &str) -> Result<()> {
        let frame = CloseFrame::new(code, reason)?;
        self.close_with(&frame).await;
        Ok(())
    }

    pub(crate) async fn close_with(&self, frame: &CloseFrame) {
        let wait = self
            .registry
            .upgrade()
            .map_or(Duration::from_secs(1), |registry| registry.wait_time());
        self.transport.close(frame, wait).await;
    }

    /// Record that a sweep saw this session `Closing`; returns for how long.
    pub(crate) fn observe_closing(&self, now: Instant) -> Duration {
        let mut since = self.closing_since.lock();
        now.saturating_duration_since(*since.get_or_insert(now))
    }

    fn compressor(&self) -> Option<crate::transport::Compressor> {
        self.registry.upgrade().and_then(|registry| registry.compressor())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("path", &self.context.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Reject control opcodes and non-UTF-8 text before anything is queued.
pub(crate) fn check_data(opcode: Opcode, payload: &[u8]) -> Result<()> {
    if !opcode.is_data() {
        return Err(ServerError::UnsupportedOpcode(opcode));
    }
    if opcode == Opcode::Text && std::str::from_utf8(payload).is_err() {
        return Err(ServerError::InvalidText);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, test_context};
    use assert_matches::assert_matches;

    fn session(transport: &Arc<FakeTransport>) -> Session {
        Session::new(
            SessionId::new(),
            test_context("/echo"),
            Arc::clone(transport) as Arc<dyn Transport>,
            Weak::new(),
        )
    }

    #[tokio::test]
    async fn send_text_reaches_transport() {
        let transport = FakeTransport::new();
        let session = session(&transport);
        session.send_text("hello").await.unwrap();
        assert_eq!(
            transport.sent(),
            vec![(Opcode::Text, Bytes::from_static(b"hello"))]
        );
    }

    #[tokio::test]
    async fn control_opcodes_are_refused() {
        let transport = FakeTransport::new();
        let session = session(&transport);
        assert_matches!(
            session.send(Opcode::Ping, Bytes::new()).await,
            Err(ServerError::UnsupportedOpcode(Opcode::Ping))
        );
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn invalid_text_is_refused() {
        let transport = FakeTransport::new();
        let session = session(&transport);
        assert_matches!(
            session.send(Opcode::Text, Bytes::from_static(&[0xC3])).await,
            Err(ServerError::InvalidText)
        );
    }

    #[tokio::test]
    async fn close_validates_before_touching_transport() {
        let transport = FakeTransport::new();
        let session = session(&transport);
        assert_matches!(
            session.close(1005, "reason").await,
            Err(ServerError::Close(_))
        );
        assert_eq!(session.state(), ConnectionState::Open);

        session.close(1000, "done").await.unwrap();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(transport.closes()[0].code(), CloseCode::NORMAL);
    }

    #[test]
    fn closing_observation_keeps_first_instant() {
        let transport = FakeTransport::new();
        let session = session(&transport);
        let first = Instant::now();
        assert_eq!(session.observe_closing(first), Duration::ZERO);
        let later = first + Duration::from_secs(3);
        assert_eq!(session.observe_closing(later), Duration::from_secs(3));
    }

    #[test]
    fn detached_session_has_no_registry() {
        let transport = FakeTransport::new();
        let session = session(&transport);
        assert!(session.sessions().is_none());
        assert!(session.started_at_utc() <= Utc::now());
    }
}
