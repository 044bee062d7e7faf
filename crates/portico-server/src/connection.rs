//! One accepted socket: TLS, upgrade, hand-off to a service host.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, trace};

use crate::auth::AuthScheme;
use crate::config::ServerConfig;
use crate::handshake::{Accepted, HandshakeRules, validate};
use crate::metrics::{
    WS_CONNECTIONS_TOTAL, WS_HANDSHAKE_REJECTIONS_TOTAL, WS_HANDSHAKE_TIMEOUTS_TOTAL,
};
use crate::service_table::ServiceTable;
use crate::transport::{BoxedIo, WsStream};

/// Everything a connection task needs, fixed when the server starts.
pub(crate) struct ConnectionHandler {
    services: Arc<ServiceTable>,
    auth: AuthScheme,
    tls: Option<TlsAcceptor>,
    port: u16,
    hostname: Option<String>,
    allow_forwarded_request: bool,
    handshake_timeout: Duration,
    websocket: WebSocketConfig,
}

impl ConnectionHandler {
    pub(crate) fn new(
        config: &ServerConfig,
        services: Arc<ServiceTable>,
        auth: AuthScheme,
        tls: Option<TlsAcceptor>,
        port: u16,
    ) -> Self {
        Self {
            services,
            auth,
            tls,
            port,
            hostname: config.hostname.clone(),
            allow_forwarded_request: config.allow_forwarded_request,
            handshake_timeout: config.handshake_timeout,
            websocket: WebSocketConfig::default().max_message_size(Some(config.max_message_size)),
        }
    }

    /// Upgrade `stream` and start a session. Failures are logged, never
    /// returned.
    ///
    /// TLS and the upgrade together are bounded by the handshake timeout;
    /// a peer that stalls is dropped.
    pub(crate) async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
        metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
        let _ = stream.set_nodelay(true);

        let upgraded =
            tokio::time::timeout(self.handshake_timeout, self.upgrade(stream, peer_addr)).await;
        let Ok(upgraded) = upgraded else {
            metrics::counter!(WS_HANDSHAKE_TIMEOUTS_TOTAL).increment(1);
            debug!(
                peer = %peer_addr,
                timeout_ms = self.handshake_timeout.as_millis() as u64,
                "handshake timed out"
            );
            return;
        };
        let Some((stream, Accepted { context, host })) = upgraded else {
            return;
        };

        let path = context.path.clone();
        match host.start_session(context, stream) {
            Some(id) => trace!(peer = %peer_addr, %path, session_id = %id, "connection handed to service"),
            None => debug!(peer = %peer_addr, %path, "service refused session"),
        }
    }

    async fn upgrade(&self, stream: TcpStream, peer_addr: SocketAddr) -> Option<(WsStream, Accepted)> {
        let io: BoxedIo = match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => Box::new(tls),
                Err(err) => {
                    debug!(peer = %peer_addr, error = %err, "TLS handshake failed");
                    return None;
                }
            },
            None => Box::new(stream),
        };

        let rules = HandshakeRules {
            auth: &self.auth,
            services: &self.services,
            port: self.port,
            hostname: self.hostname.as_deref(),
            allow_forwarded_request: self.allow_forwarded_request,
            secure: self.tls.is_some(),
        };
        let mut accepted: Option<Accepted> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match validate(request, peer_addr, &rules) {
                Ok(ok) => {
                    accepted = Some(ok);
                    Ok(response)
                }
                Err(rejection) => {
                    metrics::counter!(
                        WS_HANDSHAKE_REJECTIONS_TOTAL,
                        "status" => rejection.status().as_u16().to_string()
                    )
                    .increment(1);
                    debug!(
                        peer = %peer_addr,
                        path = request.uri().path(),
                        %rejection,
                        "handshake rejected"
                    );
                    Err(rejection.into_response())
                }
            }
        };

        let upgraded = accept_hdr_async_with_config(io, callback, Some(self.websocket)).await;
        match (upgraded, accepted) {
            (Ok(stream), Some(accepted)) => Some((stream, accepted)),
            (Ok(_), None) => {
                debug!(peer = %peer_addr, "upgrade completed without a service");
                None
            }
            (Err(err), _) => {
                trace!(peer = %peer_addr, error = %err, "websocket handshake failed");
                None
            }
        }
    }
}
