//! Service hosts: one path, one factory, one registry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portico_core::{CloseFrame, ServerState, SessionId};
use tracing::{debug, info};

use crate::behavior::{Behavior, SessionFactory};
use crate::errors::Result;
use crate::handshake::HandshakeContext;
use crate::path::normalize_path;
use crate::registry::{RegistryOptions, SessionRegistry};
use crate::session::Session;
use crate::transport::{Transport, WsEvent, WsReceiver, WsStream, WsTransport};

/// Runs once on each new behavior before its session starts.
pub type Initializer<B> = Box<dyn Fn(&mut B) + Send + Sync>;

/// What the server needs from a hosted service, independent of its
/// behavior type.
#[async_trait]
pub trait ServiceHost: Send + Sync + 'static {
    /// Normalized service path.
    fn path(&self) -> &str;

    /// Sessions of this service.
    fn registry(&self) -> &Arc<SessionRegistry>;

    /// Lifecycle state of the registry.
    fn state(&self) -> ServerState {
        self.registry().state()
    }

    /// Start accepting sessions.
    fn start(&self) {
        self.registry().start();
    }

    /// Close every session with `frame` and stop.
    async fn stop(&self, frame: &CloseFrame) {
        self.registry().stop_with(frame).await;
    }

    /// Take over an upgraded connection.
    ///
    /// Returns the new session id, or `None` when the registry refused the
    /// session; the connection is then closed with 1001.
    fn start_session(&self, context: HandshakeContext, stream: WsStream) -> Option<SessionId>;

    /// Returns `false` once the host has left `Ready`.
    fn set_keep_clean(&self, keep_clean: bool) -> bool {
        self.registry().set_keep_clean(keep_clean)
    }

    /// Zero is an error; returns `Ok(false)` once the host has left `Ready`.
    fn set_wait_time(&self, wait_time: Duration) -> Result<bool> {
        self.registry().set_wait_time(wait_time)
    }
}

/// Hosts sessions whose behavior comes from `F`.
pub struct WebSocketServiceHost<F: SessionFactory> {
    path: String,
    factory: F,
    initializer: Option<Initializer<F::Behavior>>,
    registry: Arc<SessionRegistry>,
}

impl<F: SessionFactory> WebSocketServiceHost<F> {
    /// Host at `path` with default registry options.
    pub fn new(path: &str, factory: F) -> Result<Self> {
        Self::with_options(path, factory, RegistryOptions::default())
    }

    /// Host at `path` with explicit registry options.
    pub fn with_options(path: &str, factory: F, options: RegistryOptions) -> Result<Self> {
        let path = normalize_path(path)?;
        let registry = SessionRegistry::with_options(path.clone(), options)?;
        Ok(Self {
            path,
            factory,
            initializer: None,
            registry,
        })
    }

    /// Run `initializer` on every new behavior.
    #[must_use]
    pub fn with_initializer(
        mut self,
        initializer: impl Fn(&mut F::Behavior) + Send + Sync + 'static,
    ) -> Self {
        self.initializer = Some(Box::new(initializer));
        self
    }
}

#[async_trait]
impl<F: SessionFactory> ServiceHost for WebSocketServiceHost<F> {
    fn path(&self) -> &str {
        &self.path
    }

    fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn start_session(&self, context: HandshakeContext, stream: WsStream) -> Option<SessionId> {
        let mut behavior = self.factory.create();
        if let Some(initializer) = &self.initializer {
            initializer(&mut behavior);
        }

        let (transport, receiver) = WsTransport::new(stream);
        let Some(session) = self
            .registry
            .add(Arc::clone(&transport) as Arc<dyn Transport>, context)
        else {
            debug!(path = %self.path, "service not accepting sessions, closing connection");
            let wait = self.registry.wait_time();
            drop(tokio::spawn(async move {
                let frame = CloseFrame::going_away();
                let _ = tokio::join!(transport.close(&frame, wait), drain(receiver));
            }));
            return None;
        };

        let id = session.id().clone();
        drop(tokio::spawn(run_session(
            session,
            receiver,
            behavior,
            Arc::clone(&self.registry),
        )));
        Some(id)
    }
}

impl<F: SessionFactory> fmt::Debug for WebSocketServiceHost<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServiceHost")
            .field("path", &self.path)
            .field("initializer", &self.initializer.is_some())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Drive one session from open to removal.
async fn run_session<B: Behavior>(
    session: Arc<Session>,
    mut receiver: WsReceiver,
    mut behavior: B,
    registry: Arc<SessionRegistry>,
) {
    info!(
        path = %registry.path(),
        session_id = %session.id(),
        peer = %session.context().peer_addr,
        "session opened"
    );
    behavior.on_open(&session).await;

    while let Some(event) = receiver.next().await {
        match event {
            WsEvent::Message(message) => behavior.on_message(&session, message).await,
            WsEvent::Error(error) => behavior.on_error(&session, &error).await,
        }
    }

    let frame = receiver.close_frame();
    behavior.on_close(&session, &frame).await;
    let _ = registry.remove(session.id());
    info!(
        path = %registry.path(),
        session_id = %session.id(),
        code = %frame.code(),
        age_ms = session.age().as_millis() as u64,
        "session closed"
    );
}

async fn drain(mut receiver: WsReceiver) {
    while receiver.next().await.is_some() {}
}
