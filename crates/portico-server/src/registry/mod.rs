//! Session registry: the live sessions of one service path.
//!
//! The registry is the only authority over session lifetime for its path.
//! Its lifecycle state lives under the same lock as the session table, so a
//! session can only be added while the registry is started, and nothing is
//! visible once it has stopped.
//!
//! Fan-out lives in [`broadcast`], liveness sweeping and its timer in
//! [`sweep`].

pub mod broadcast;
pub mod sweep;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portico_core::{CloseCode, CloseFrame, Opcode, ServerState, SessionId};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, ServerError};
use crate::handshake::HandshakeContext;
use crate::metrics::{WS_SESSIONS_ACTIVE, WS_SESSIONS_TOTAL};
use crate::session::Session;
use crate::transport::{Compressor, Transport};

pub use broadcast::BroadcastSummary;
pub use sweep::SweepReport;

/// Tunables for one registry. Changeable only while it is `Ready`.
#[derive(Clone)]
pub struct RegistryOptions {
    /// Arm the periodic sweep on start.
    pub keep_clean: bool,
    /// Ping timeout and close-handshake bound.
    pub wait_time: Duration,
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// How long a session may stay `Closing` before it is torn down.
    pub closing_timeout: Duration,
    /// Produces compressed payloads for connections that negotiated it.
    pub compressor: Option<Compressor>,
    /// Largest payload [`SessionRegistry::send_stream_to`] will buffer.
    pub max_message_size: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            keep_clean: true,
            wait_time: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            closing_timeout: Duration::from_secs(5),
            compressor: None,
            max_message_size: 16 << 20,
        }
    }
}

impl fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("keep_clean", &self.keep_clean)
            .field("wait_time", &self.wait_time)
            .field("sweep_interval", &self.sweep_interval)
            .field("closing_timeout", &self.closing_timeout)
            .field("compressor", &self.compressor.is_some())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

struct Inner {
    state: ServerState,
    sessions: HashMap<SessionId, Arc<Session>>,
}

/// Live sessions of one service path.
pub struct SessionRegistry {
    path: String,
    inner: Mutex<Inner>,
    options: Mutex<RegistryOptions>,
    /// Separate from `inner` so a running sweep never blocks add/remove.
    sweeping: Mutex<bool>,
    sweep_timer: Mutex<Option<CancellationToken>>,
}

impl SessionRegistry {
    /// Registry with default options.
    pub fn new(path: impl Into<String>) -> Arc<Self> {
        Self::build(path.into(), RegistryOptions::default())
    }

    /// Registry with explicit options.
    pub fn with_options(path: impl Into<String>, options: RegistryOptions) -> Result<Arc<Self>> {
        if options.wait_time.is_zero() {
            return Err(ServerError::InvalidWaitTime);
        }
        Ok(Self::build(path.into(), options))
    }

    fn build(path: String, options: RegistryOptions) -> Arc<Self> {
        Arc::new(Self {
            path,
            inner: Mutex::new(Inner {
                state: ServerState::Ready,
                sessions: HashMap::new(),
            }),
            options: Mutex::new(options),
            sweeping: Mutex::new(false),
            sweep_timer: Mutex::new(None),
        })
    }

    /// Service path this registry belongs to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Lifecycle state.
    pub fn state(&self) -> ServerState {
        self.inner.lock().state
    }

    // ── Configuration ───────────────────────────────────────────────

    /// Snapshot of the current options.
    pub fn options(&self) -> RegistryOptions {
        self.options.lock().clone()
    }

    /// Whether the periodic sweep is armed on start.
    pub fn keep_clean(&self) -> bool {
        self.options.lock().keep_clean
    }

    /// Ping timeout and close-handshake bound.
    pub fn wait_time(&self) -> Duration {
        self.options.lock().wait_time
    }

    /// Time between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        self.options.lock().sweep_interval
    }

    /// How long a session may stay `Closing`.
    pub fn closing_timeout(&self) -> Duration {
        self.options.lock().closing_timeout
    }

    pub(crate) fn compressor(&self) -> Option<Compressor> {
        self.options.lock().compressor.clone()
    }

    /// Returns `false` (and logs) once the registry has left `Ready`.
    pub fn set_keep_clean(&self, keep_clean: bool) -> bool {
        self.configure("keep_clean", |options| options.keep_clean = keep_clean)
    }

    /// Zero is an error regardless of state.
    pub fn set_wait_time(&self, wait_time: Duration) -> Result<bool> {
        if wait_time.is_zero() {
            return Err(ServerError::InvalidWaitTime);
        }
        Ok(self.configure("wait_time", |options| options.wait_time = wait_time))
    }

    /// Returns `false` (and logs) once the registry has left `Ready`.
    pub fn set_sweep_interval(&self, interval: Duration) -> bool {
        let interval = interval.max(Duration::from_millis(1));
        self.configure("sweep_interval", |options| options.sweep_interval = interval)
    }

    /// Returns `false` (and logs) once the registry has left `Ready`.
    pub fn set_closing_timeout(&self, timeout: Duration) -> bool {
        self.configure("closing_timeout", |options| options.closing_timeout = timeout)
    }

    /// Returns `false` (and logs) once the registry has left `Ready`.
    pub fn set_compressor(&self, compressor: Option<Compressor>) -> bool {
        self.configure("compressor", |options| options.compressor = compressor)
    }

    fn configure(&self, option: &'static str, apply: impl FnOnce(&mut RegistryOptions)) -> bool {
        let inner = self.inner.lock();
        if !inner.state.is_configurable() {
            warn!(path = %self.path, option, state = %inner.state, "registry already started, ignoring configuration change");
            return false;
        }
        apply(&mut self.options.lock());
        true
    }

    // ── Table ───────────────────────────────────────────────────────

    /// Register a session for `transport`. `None` unless started.
    pub fn add(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        context: HandshakeContext,
    ) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        if inner.state != ServerState::Start {
            debug!(path = %self.path, state = %inner.state, "registry not started, rejecting session");
            return None;
        }
        let id = loop {
            let candidate = SessionId::new();
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(Session::new(
            id.clone(),
            context,
            transport,
            Arc::downgrade(self),
        ));
        let _ = inner.sessions.insert(id.clone(), Arc::clone(&session));
        let active = inner.sessions.len();
        drop(inner);

        metrics::counter!(WS_SESSIONS_TOTAL, "path" => self.path.clone()).increment(1);
        metrics::gauge!(WS_SESSIONS_ACTIVE, "path" => self.path.clone()).set(active as f64);
        debug!(path = %self.path, session_id = %id, active, "session registered");
        Some(session)
    }

    /// Drop a session from the table. Idempotent.
    pub fn remove(&self, id: &SessionId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.sessions.remove(id).is_some();
        let active = inner.sessions.len();
        drop(inner);
        if removed {
            metrics::gauge!(WS_SESSIONS_ACTIVE, "path" => self.path.clone()).set(active as f64);
            debug!(path = %self.path, session_id = %id, active, "session removed");
        }
        removed
    }

    /// Look up a live session. Always `None` unless started.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        let inner = self.inner.lock();
        if inner.state != ServerState::Start {
            return None;
        }
        inner.sessions.get(id).cloned()
    }

    /// Ids of every live session.
    pub fn ids(&self) -> Vec<SessionId> {
        let inner = self.inner.lock();
        if inner.state != ServerState::Start {
            return Vec::new();
        }
        inner.sessions.keys().cloned().collect()
    }

    /// Every live session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.lock();
        if inner.state != ServerState::Start {
            return Vec::new();
        }
        inner.sessions.values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        let inner = self.inner.lock();
        if inner.state != ServerState::Start {
            return 0;
        }
        inner.sessions.len()
    }

    fn require(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.get(id)
            .ok_or_else(|| ServerError::SessionNotFound(id.clone()))
    }

    // ── Unicast ─────────────────────────────────────────────────────

    /// Send to one session and wait until written.
    pub async fn send_to(&self, id: &SessionId, opcode: Opcode, payload: Bytes) -> Result<()> {
        self.require(id)?.send(opcode, payload).await
    }

    /// Queue for one session now; the handle resolves once written.
    pub fn send_to_async(
        &self,
        id: &SessionId,
        opcode: Opcode,
        payload: Bytes,
    ) -> Result<JoinHandle<Result<()>>> {
        let delivery = self.require(id)?.queue(opcode, payload)?;
        Ok(tokio::spawn(async move { delivery.await.map_err(ServerError::from) }))
    }

    /// Read up to `length` bytes from `reader` and send them as one message.
    ///
    /// `length` may not exceed `max_message_size`; the buffer grows with
    /// what is actually read.
    pub async fn send_stream_to<R>(
        &self,
        id: &SessionId,
        opcode: Opcode,
        reader: R,
        length: usize,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let limit = self.options.lock().max_message_size;
        if length > limit {
            return Err(ServerError::MessageTooLarge { length, limit });
        }
        let session = self.require(id)?;
        let mut payload = Vec::new();
        let read = reader.take(length as u64).read_to_end(&mut payload).await?;
        if read == 0 {
            return Err(ServerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream produced no data",
            )));
        }
        if read < length {
            warn!(path = %self.path, session_id = %id, expected = length, read, "stream ended early, sending what was read");
        }
        session.send(opcode, Bytes::from(payload)).await
    }

    /// Ping one session with the configured wait time.
    pub async fn ping_to(&self, id: &SessionId) -> Result<bool> {
        let session = self.require(id)?;
        Ok(session
            .transport()
            .ping(Bytes::new(), self.wait_time())
            .await)
    }

    /// Close one session.
    pub async fn close_session(
        &self,
        id: &SessionId,
        code: impl Into<CloseCode>,
        reason: &str,
    ) -> Result<()> {
        let frame = CloseFrame::new(code, reason)?;
        let session = self.require(id)?;
        session.transport().close(&frame, self.wait_time()).await;
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// `Ready → Start`, arming the sweep timer when `keep_clean`.
    pub fn start(self: &Arc<Self>) {
        let options = {
            let mut inner = self.inner.lock();
            if inner.state != ServerState::Ready {
                debug!(path = %self.path, state = %inner.state, "registry start ignored");
                return;
            }
            inner.state = ServerState::Start;
            self.options()
        };
        if options.keep_clean {
            sweep::arm_timer(self, options.sweep_interval);
        }
        info!(path = %self.path, keep_clean = options.keep_clean, "session registry started");
    }

    /// Close every session with `code`/`reason` and stop.
    pub async fn stop(&self, code: impl Into<CloseCode>, reason: &str) -> Result<()> {
        let frame = CloseFrame::new(code, reason)?;
        self.stop_with(&frame).await;
        Ok(())
    }

    /// Stop with an already validated frame. No-op unless started.
    pub async fn stop_with(&self, frame: &CloseFrame) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            if inner.state != ServerState::Start {
                return;
            }
            inner.state = ServerState::ShuttingDown;
            inner.sessions.values().cloned().collect()
        };
        self.disarm_timer();

        let wait = self.wait_time();
        let count = sessions.len();
        let closes = sessions
            .iter()
            .map(|session| session.transport().close(frame, wait));
        let _ = futures::future::join_all(closes).await;

        {
            let mut inner = self.inner.lock();
            inner.sessions.clear();
            inner.state = ServerState::Stop;
        }
        metrics::gauge!(WS_SESSIONS_ACTIVE, "path" => self.path.clone()).set(0.0);
        info!(path = %self.path, sessions = count, code = %frame.code(), "session registry stopped");
    }

    fn disarm_timer(&self) {
        if let Some(token) = self.sweep_timer.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.disarm_timer();
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SessionRegistry")
            .field("path", &self.path)
            .field("state", &inner.state)
            .field("sessions", &inner.sessions.len())
            .finish_non_exhaustive()
    }
}
