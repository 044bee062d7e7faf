//! Opening-handshake validation.
//!
//! Runs inside the tungstenite request callback. Checks happen in a fixed
//! order (authentication, request path, `Host` header, service lookup,
//! service state) and the first failure decides the HTTP status.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::header::{HOST, WWW_AUTHENTICATE};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};

use portico_core::ServerState;

use crate::auth::{AuthOutcome, AuthScheme};
use crate::host::ServiceHost;
use crate::path::normalize_path;
use crate::service_table::ServiceTable;

/// What a behavior can learn about the request that opened its session.
#[derive(Clone, Debug)]
pub struct HandshakeContext {
    /// Normalized service path.
    pub path: String,
    /// Raw query string, without the `?`.
    pub query: Option<String>,
    /// Remote address.
    pub peer_addr: SocketAddr,
    /// `Host` header as sent.
    pub host: Option<String>,
    /// All request headers.
    pub headers: HeaderMap,
    /// Authenticated user, for Basic auth.
    pub user: Option<String>,
    /// Whether the connection is TLS.
    pub secure: bool,
}

impl HandshakeContext {
    /// Bare context for `path` from `peer_addr`.
    pub fn new(path: impl Into<String>, peer_addr: SocketAddr) -> Self {
        Self {
            path: path.into(),
            query: None,
            peer_addr,
            host: None,
            headers: HeaderMap::new(),
            user: None,
            secure: false,
        }
    }
}

/// Server-wide inputs to validation.
pub(crate) struct HandshakeRules<'a> {
    pub(crate) auth: &'a AuthScheme,
    pub(crate) services: &'a ServiceTable,
    /// Port the listener is bound to.
    pub(crate) port: u16,
    /// Set when the server was configured by name.
    pub(crate) hostname: Option<&'a str>,
    pub(crate) allow_forwarded_request: bool,
    pub(crate) secure: bool,
}

/// Why an upgrade request was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Basic credentials missing; carries the challenge.
    Unauthorized(String),
    Forbidden,
    BadRequest(&'static str),
    /// `Host` names a different server.
    NotFound,
    /// No service at the path.
    NotImplemented,
    /// Service exists but is not accepting sessions.
    Unavailable,
}

impl Rejection {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub(crate) fn into_response(self) -> ErrorResponse {
        let status = self.status();
        let body = match &self {
            Self::BadRequest(reason) => (*reason).to_string(),
            _ => status.canonical_reason().unwrap_or_default().to_string(),
        };
        let mut response = ErrorResponse::new(Some(body));
        *response.status_mut() = status;
        if let Self::Unauthorized(challenge) = &self
            && let Ok(value) = HeaderValue::from_str(challenge)
        {
            let _ = response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
        response
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(reason) => write!(f, "{} ({reason})", self.status()),
            _ => write!(f, "{}", self.status()),
        }
    }
}

/// A request that passed every check.
pub(crate) struct Accepted {
    pub(crate) context: HandshakeContext,
    pub(crate) host: Arc<dyn ServiceHost>,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("context", &self.context)
            .field("host", &self.host.path())
            .finish()
    }
}

/// Validate an upgrade request.
pub(crate) fn validate(
    request: &Request,
    peer_addr: SocketAddr,
    rules: &HandshakeRules<'_>,
) -> Result<Accepted, Rejection> {
    let user = match rules.auth.authenticate(request.headers()) {
        AuthOutcome::Accepted(user) => user,
        AuthOutcome::Challenge(challenge) => return Err(Rejection::Unauthorized(challenge)),
        AuthOutcome::Rejected => return Err(Rejection::Forbidden),
    };

    let path = normalize_path(request.uri().path())
        .map_err(|_| Rejection::BadRequest("malformed request path"))?;

    let host_header = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if !rules.allow_forwarded_request {
        check_host(host_header.as_deref(), rules)?;
    }

    let host = rules.services.get(&path).ok_or(Rejection::NotImplemented)?;
    if host.state() != ServerState::Start {
        return Err(Rejection::Unavailable);
    }

    let context = HandshakeContext {
        path,
        query: request.uri().query().map(str::to_string),
        peer_addr,
        host: host_header,
        headers: request.headers().clone(),
        user,
        secure: rules.secure,
    };
    Ok(Accepted { context, host })
}

fn check_host(header: Option<&str>, rules: &HandshakeRules<'_>) -> Result<(), Rejection> {
    let header = header.ok_or(Rejection::BadRequest("missing Host header"))?;
    let (name, port) = split_host(header).ok_or(Rejection::BadRequest("malformed Host header"))?;
    let port = port.unwrap_or(if rules.secure { 443 } else { 80 });
    if port != rules.port {
        return Err(Rejection::BadRequest("Host port does not match"));
    }
    if let Some(expected) = rules.hostname
        && name.parse::<IpAddr>().is_err()
        && !name.eq_ignore_ascii_case(expected)
    {
        return Err(Rejection::NotFound);
    }
    Ok(())
}

/// Split `name[:port]` or `[v6][:port]`.
fn split_host(value: &str) -> Option<(&str, Option<u16>)> {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix('[') {
        let (name, after) = rest.split_once(']')?;
        return match after {
            "" => Some((name, None)),
            _ => Some((name, Some(after.strip_prefix(':')?.parse().ok()?))),
        };
    }
    match value.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => Some((name, Some(port.parse().ok()?))),
        Some(_) => None,
        None if value.is_empty() => None,
        None => Some((value, None)),
    }
}
