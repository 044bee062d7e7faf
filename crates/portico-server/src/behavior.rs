//! Per-session application logic.
//!
//! A service is registered with a [`SessionFactory`]; every accepted
//! connection gets a fresh [`Behavior`] from it. Hooks run on the session's
//! own task, one at a time, so a behavior can keep mutable state without
//! locking.

use std::sync::Arc;

use async_trait::async_trait;
use portico_core::CloseFrame;
use tracing::debug;

use crate::errors::TransportError;
use crate::session::Session;
use crate::transport::IncomingMessage;

/// Handles the events of one session.
#[async_trait]
pub trait Behavior: Send + 'static {
    /// The session was registered and can send.
    async fn on_open(&mut self, _session: &Arc<Session>) {}

    /// A text or binary message arrived.
    async fn on_message(&mut self, session: &Arc<Session>, message: IncomingMessage);

    /// Reading from the connection failed. `on_close` follows.
    async fn on_error(&mut self, session: &Arc<Session>, error: &TransportError) {
        debug!(session_id = %session.id(), error = %error, "session read failed");
    }

    /// The connection is finished. `frame` is the peer's close frame, or
    /// 1006 when none arrived.
    async fn on_close(&mut self, _session: &Arc<Session>, _frame: &CloseFrame) {}
}

/// Creates one [`Behavior`] per accepted connection.
pub trait SessionFactory: Send + Sync + 'static {
    /// Behavior produced for each session.
    type Behavior: Behavior;

    /// Make a behavior for a new session.
    fn create(&self) -> Self::Behavior;
}

impl<F, B> SessionFactory for F
where
    F: Fn() -> B + Send + Sync + 'static,
    B: Behavior,
{
    type Behavior = B;

    fn create(&self) -> B {
        self()
    }
}
