//! `WebSocketServer`: listener, accept loop, and the table of services.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use portico_core::{CloseCode, CloseFrame, ServerState};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::AuthScheme;
use crate::behavior::SessionFactory;
use crate::config::ServerConfig;
use crate::connection::ConnectionHandler;
use crate::errors::{Result, ServerError};
use crate::host::{ServiceHost, WebSocketServiceHost};
use crate::path::normalize_path;
use crate::registry::RegistryOptions;
use crate::service_table::ServiceTable;
use crate::shutdown::ShutdownCoordinator;
use crate::tls;

/// Backlog passed to `listen(2)`.
const LISTEN_BACKLOG: u32 = 1024;

/// Registry settings applied to services as they are added.
#[derive(Clone, Copy, Debug)]
struct ServiceDefaults {
    keep_clean: bool,
    wait_time: Duration,
}

struct Shared {
    config: ServerConfig,
    state: Mutex<ServerState>,
    services: Arc<ServiceTable>,
    auth: Mutex<AuthScheme>,
    defaults: Mutex<ServiceDefaults>,
    accept_task: Mutex<Option<JoinHandle<Result<()>>>>,
    shutdown: ShutdownCoordinator,
    connections: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
    fault: Mutex<Option<String>>,
    stopped: CancellationToken,
}

/// Hosts WebSocket services on one listener.
///
/// Cloning is cheap; clones share the same server.
#[derive(Clone)]
pub struct WebSocketServer {
    shared: Arc<Shared>,
}

impl WebSocketServer {
    /// Server for `config`. Nothing is bound until [`Self::start`].
    pub fn new(config: ServerConfig) -> Self {
        let defaults = ServiceDefaults {
            keep_clean: config.keep_clean,
            wait_time: config.wait_time,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ServerState::Ready),
                services: Arc::new(ServiceTable::new()),
                auth: Mutex::new(AuthScheme::default()),
                defaults: Mutex::new(defaults),
                accept_task: Mutex::new(None),
                shutdown: ShutdownCoordinator::new(),
                connections: TaskTracker::new(),
                local_addr: Mutex::new(None),
                fault: Mutex::new(None),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.shared.state.lock()
    }

    /// Bound address once started. Resolves port `0` to the real port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Current authentication scheme.
    pub fn auth_scheme(&self) -> AuthScheme {
        self.shared.auth.lock().clone()
    }

    /// Replace the authentication scheme. Only while `Ready`.
    pub fn set_auth_scheme(&self, scheme: AuthScheme) -> bool {
        let state = self.shared.state.lock();
        if !state.is_configurable() {
            warn!(state = %*state, "server already started, ignoring auth scheme change");
            return false;
        }
        *self.shared.auth.lock() = scheme;
        true
    }

    // ── Services ────────────────────────────────────────────────────

    /// Add a service at `path`.
    ///
    /// Services added while the server runs are started immediately.
    pub fn add_websocket_service<F: SessionFactory>(&self, path: &str, factory: F) -> Result<()> {
        let host = WebSocketServiceHost::with_options(path, factory, self.registry_options())?;
        self.register(Arc::new(host))
    }

    /// Add a service whose behaviors are passed through `initializer` first.
    pub fn add_websocket_service_with<F, I>(&self, path: &str, factory: F, initializer: I) -> Result<()>
    where
        F: SessionFactory,
        I: Fn(&mut F::Behavior) + Send + Sync + 'static,
    {
        let host = WebSocketServiceHost::with_options(path, factory, self.registry_options())?
            .with_initializer(initializer);
        self.register(Arc::new(host))
    }

    fn registry_options(&self) -> RegistryOptions {
        let defaults = *self.shared.defaults.lock();
        RegistryOptions {
            keep_clean: defaults.keep_clean,
            wait_time: defaults.wait_time,
            sweep_interval: self.shared.config.sweep_interval,
            closing_timeout: self.shared.config.closing_timeout,
            compressor: None,
            max_message_size: self.shared.config.max_message_size,
        }
    }

    fn register(&self, host: Arc<dyn ServiceHost>) -> Result<()> {
        let state = self.shared.state.lock();
        self.shared.services.add(Arc::clone(&host))?;
        if *state == ServerState::Start {
            host.start();
        }
        info!(path = host.path(), state = %*state, "service added");
        Ok(())
    }

    /// Stop the service at `path` with 1001 and drop it.
    pub async fn remove_websocket_service(&self, path: &str) -> bool {
        let Ok(path) = normalize_path(path) else {
            return false;
        };
        let Some(host) = self.shared.services.remove(&path) else {
            debug!(%path, "no service to remove");
            return false;
        };
        host.stop(&CloseFrame::going_away()).await;
        info!(%path, "service removed");
        true
    }

    /// Paths of every service, sorted.
    pub fn service_paths(&self) -> Vec<String> {
        self.shared.services.paths()
    }

    /// The service at `path`, if any.
    pub fn service(&self, path: &str) -> Option<Arc<dyn ServiceHost>> {
        let path = normalize_path(path).ok()?;
        self.shared.services.get(&path)
    }

    /// Apply to every service and to services added later.
    ///
    /// Services that already started keep their setting.
    pub fn set_keep_clean(&self, keep_clean: bool) {
        self.shared.defaults.lock().keep_clean = keep_clean;
        for host in self.shared.services.hosts() {
            let _ = host.set_keep_clean(keep_clean);
        }
    }

    /// Apply to every service and to services added later. Zero is an error.
    pub fn set_wait_time(&self, wait_time: Duration) -> Result<()> {
        if wait_time.is_zero() {
            return Err(ServerError::InvalidWaitTime);
        }
        self.shared.defaults.lock().wait_time = wait_time;
        for host in self.shared.services.hosts() {
            let _ = host.set_wait_time(wait_time)?;
        }
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Bind, start every service, and begin accepting.
    ///
    /// Must be called within a tokio runtime. A no-op once started; a
    /// stopped server cannot be started again. On error the server stays
    /// `Ready`.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        match *state {
            ServerState::Ready => {}
            ServerState::Stop => return Err(ServerError::AlreadyStopped),
            ServerState::Start | ServerState::ShuttingDown => {
                debug!(state = %*state, "server start ignored");
                return Ok(());
            }
        }

        shared.config.validate()?;
        let tls = tls::acceptor_for(&shared.config)?;
        let listener = bind(&shared.config)?;
        let local_addr = listener.local_addr()?;

        for host in shared.services.hosts() {
            host.start();
        }

        let handler = Arc::new(ConnectionHandler::new(
            &shared.config,
            Arc::clone(&shared.services),
            shared.auth.lock().clone(),
            tls,
            local_addr.port(),
        ));
        let task = tokio::spawn(supervise(
            Arc::clone(shared),
            listener,
            handler,
            shared.shutdown.token(),
        ));
        *shared.accept_task.lock() = Some(task);
        *shared.local_addr.lock() = Some(local_addr);
        *state = ServerState::Start;

        info!(
            address = %local_addr,
            scheme = shared.config.scheme(),
            services = shared.services.len(),
            "websocket server started"
        );
        Ok(())
    }

    /// Stop accepting, close every session with `code`/`reason`, and stop.
    ///
    /// The frame is validated before anything changes. A listener fault
    /// seen while stopping is returned after the services are stopped.
    pub async fn stop(&self, code: impl Into<CloseCode>, reason: &str) -> Result<()> {
        let frame = CloseFrame::new(code, reason)?;
        self.stop_with(&frame).await
    }

    async fn stop_with(&self, frame: &CloseFrame) -> Result<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if *state != ServerState::Start {
                debug!(state = %*state, "server stop ignored");
                return Ok(());
            }
            *state = ServerState::ShuttingDown;
        }
        info!(code = %frame.code(), "websocket server stopping");

        let handles: Vec<_> = shared.accept_task.lock().take().into_iter().collect();
        let faults = shared
            .shutdown
            .graceful_shutdown(handles, Some(shared.config.stop_timeout))
            .await;
        drain_connections(shared).await;

        stop_services(&shared.services, frame).await;
        *shared.state.lock() = ServerState::Stop;

        let first = faults.into_iter().next();
        if let Some(fault) = &first {
            *shared.fault.lock() = Some(fault.to_string());
        }
        shared.stopped.cancel();
        info!("websocket server stopped");
        first.map_or(Ok(()), Err)
    }

    /// Resolve once the server has stopped.
    ///
    /// Returns the listener fault if the accept loop died. Never resolves
    /// for a server that was not started.
    pub async fn wait(&self) -> Result<()> {
        self.shared.stopped.cancelled().await;
        match self.shared.fault.lock().clone() {
            Some(fault) => Err(ServerError::Listener(fault)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("services", &self.service_paths())
            .finish_non_exhaustive()
    }
}

fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = config.socket_addr();
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if config.reuse_address {
        socket.set_reuseaddr(true)?;
    }
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

/// Wait for connections still in their handshake. The shutdown token must
/// already be cancelled.
async fn drain_connections(shared: &Shared) {
    let _ = shared.connections.close();
    if tokio::time::timeout(shared.config.stop_timeout, shared.connections.wait())
        .await
        .is_err()
    {
        warn!(
            pending = shared.connections.len(),
            "connections still handshaking after stop timeout"
        );
    }
}

async fn stop_services(services: &ServiceTable, frame: &CloseFrame) {
    let hosts = services.hosts();
    let _ = join_all(hosts.iter().map(|host| host.stop(frame))).await;
}

/// Run the accept loop; on a listener fault, abort the whole server.
async fn supervise(
    shared: Arc<Shared>,
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    let result = accept_loop(&shared, &listener, &handler, &cancel).await;
    if let Err(err) = &result {
        abort(&shared, err).await;
    }
    result
}

async fn accept_loop(
    shared: &Shared,
    listener: &TcpListener,
    handler: &Arc<ConnectionHandler>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                let handler = Arc::clone(handler);
                let cancel = cancel.clone();
                drop(shared.connections.spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            debug!(peer = %peer_addr, "dropping connection mid-handshake");
                        }
                        () = handler.handle(stream, peer_addr) => {}
                    }
                }));
            }
            Err(_)
                if shared.shutdown.is_shutting_down()
                    || *shared.state.lock() == ServerState::ShuttingDown =>
            {
                return Ok(());
            }
            Err(err) if is_transient(&err) => {
                debug!(error = %err, "accept failed, continuing");
            }
            Err(err) => return Err(ServerError::Listener(err.to_string())),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn abort(shared: &Shared, err: &ServerError) {
    {
        let mut state = shared.state.lock();
        if *state != ServerState::Start {
            return;
        }
        *state = ServerState::ShuttingDown;
    }
    error!(error = %err, "listener failed, stopping every service");
    shared.shutdown.shutdown();
    drain_connections(shared).await;
    stop_services(&shared.services, &CloseFrame::abnormal()).await;
    *shared.fault.lock() = Some(err.to_string());
    *shared.state.lock() = ServerState::Stop;
    shared.stopped.cancel();
}
