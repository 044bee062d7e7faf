//! # portico-server
//!
//! WebSocket service hosting over `tokio-tungstenite`.
//!
//! - **Server**: [`WebSocketServer`] binds one listener (plain or TLS), runs
//!   the accept loop, validates upgrade requests, and routes them by path
//! - **Services**: [`WebSocketServiceHost`] pairs a path with a
//!   [`SessionFactory`] producing one [`Behavior`] per connection
//! - **Registry**: [`SessionRegistry`] owns the live sessions of a path, with
//!   broadcast, broadping, unicast helpers, and periodic liveness sweeping
//! - **Transport**: [`Transport`] abstracts a connection; [`WsTransport`]
//!   implements it with a single writer task per session
//! - **Shutdown**: close frames are validated before anything changes state;
//!   stop is bounded by configurable timeouts

#![deny(unsafe_code)]

pub mod auth;
pub mod behavior;
pub mod config;
mod connection;
pub mod errors;
pub mod handshake;
pub mod host;
pub mod metrics;
pub mod path;
pub mod registry;
pub mod server;
mod service_table;
pub mod session;
pub mod shutdown;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{AuthScheme, CredentialLookup, Credentials};
pub use behavior::{Behavior, SessionFactory};
pub use config::ServerConfig;
pub use errors::{Result, ServerError, TransportError};
pub use handshake::HandshakeContext;
pub use host::{ServiceHost, WebSocketServiceHost};
pub use registry::{BroadcastSummary, RegistryOptions, SessionRegistry, SweepReport};
pub use server::WebSocketServer;
pub use session::Session;
pub use transport::{FrameCache, IncomingMessage, Transport, WsTransport};
