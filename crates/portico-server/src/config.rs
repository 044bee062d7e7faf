//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use portico_settings::ServerSettings;

use crate::errors::{Result, ServerError};

/// Configuration for a [`WebSocketServer`](crate::server::WebSocketServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind.
    pub address: IpAddr,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Host name requests must name when the server was configured by name
    /// (`localhost`). `None` for IP-literal configuration.
    pub hostname: Option<String>,
    /// Serve over TLS.
    pub secure: bool,
    /// PEM certificate chain.
    pub certificate_path: Option<PathBuf>,
    /// PEM private key.
    pub private_key_path: Option<PathBuf>,
    /// Set `SO_REUSEADDR` before binding.
    pub reuse_address: bool,
    /// Skip `Host` header port/hostname checks (behind a proxy).
    pub allow_forwarded_request: bool,
    /// Default for new services: sweep unresponsive sessions.
    pub keep_clean: bool,
    /// Default for new services: ping and close-handshake timeout.
    pub wait_time: Duration,
    /// Default for new services: time between sweeps.
    pub sweep_interval: Duration,
    /// Default for new services: how long a session may stay `Closing`.
    pub closing_timeout: Duration,
    /// Bound on joining the accept task during stop.
    pub stop_timeout: Duration,
    /// Bound on TLS plus the opening handshake for one connection.
    pub handshake_timeout: Duration,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            hostname: None,
            secure: false,
            certificate_path: None,
            private_key_path: None,
            reuse_address: true,
            allow_forwarded_request: false,
            keep_clean: true,
            wait_time: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            closing_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl ServerConfig {
    /// Plain configuration bound to `address:port`.
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            ..Self::default()
        }
    }

    /// Loopback configured by name, which turns on hostname checks.
    pub fn localhost(port: u16) -> Self {
        Self {
            hostname: Some("localhost".into()),
            port,
            ..Self::default()
        }
    }

    /// Convert loaded settings, validating the address and timings.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let (address, hostname) = parse_host(&settings.host)?;
        if settings.wait_time_ms == 0 {
            return Err(ServerError::InvalidWaitTime);
        }
        let config = Self {
            address,
            port: settings.port,
            hostname,
            secure: settings.secure,
            certificate_path: settings.certificate_path.as_ref().map(PathBuf::from),
            private_key_path: settings.private_key_path.as_ref().map(PathBuf::from),
            reuse_address: settings.reuse_address,
            allow_forwarded_request: settings.allow_forwarded_request,
            keep_clean: settings.keep_clean,
            wait_time: Duration::from_millis(settings.wait_time_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms.max(1)),
            closing_timeout: Duration::from_millis(settings.closing_timeout_ms),
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms.max(1)),
            max_message_size: settings.max_message_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check settings that would otherwise fail late, at `start()`.
    pub fn validate(&self) -> Result<()> {
        if self.wait_time.is_zero() {
            return Err(ServerError::InvalidWaitTime);
        }
        if self.secure && (self.certificate_path.is_none() || self.private_key_path.is_none()) {
            return Err(ServerError::MissingCertificate);
        }
        Ok(())
    }

    /// Address the listener binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// URL scheme clients use.
    pub fn scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }
}

fn parse_host(host: &str) -> Result<(IpAddr, Option<String>)> {
    if host.eq_ignore_ascii_case("localhost") {
        return Ok((IpAddr::V4(Ipv4Addr::LOCALHOST), Some("localhost".into())));
    }
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    trimmed
        .parse::<IpAddr>()
        .map(|ip| (ip, None))
        .map_err(|_| ServerError::InvalidAddress(host.to_string()))
}
