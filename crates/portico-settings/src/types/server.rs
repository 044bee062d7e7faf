//! Listener, TLS, authentication, and session housekeeping settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How upgrade requests are authenticated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthSchemeSetting {
    /// Every request is rejected with 403.
    None,
    /// Every request is accepted.
    #[default]
    Anonymous,
    /// HTTP Basic against [`ServerSettings::basic_users`].
    Basic,
}

impl AuthSchemeSetting {
    /// Parse a case-insensitive scheme name.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "anonymous" => Some(Self::Anonymous),
            "basic" => Some(Self::Basic),
            _ => None,
        }
    }
}

/// Server network and session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address: an IP literal or `localhost`.
    pub host: String,
    /// Listen port. `0` picks an ephemeral port.
    pub port: u16,
    /// Serve `wss://` instead of `ws://`.
    pub secure: bool,
    /// PEM certificate chain, required when `secure`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<String>,
    /// PEM private key, required when `secure`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    /// Set `SO_REUSEADDR` on the listening socket.
    pub reuse_address: bool,
    /// Skip the `Host` header port and hostname checks.
    pub allow_forwarded_request: bool,
    /// Authentication scheme for upgrade requests.
    pub auth_scheme: AuthSchemeSetting,
    /// Realm advertised in Basic challenges.
    pub realm: String,
    /// Username to password table for Basic authentication.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub basic_users: BTreeMap<String, String>,
    /// Periodically sweep unresponsive sessions.
    pub keep_clean: bool,
    /// Ping and close-handshake timeout in milliseconds.
    pub wait_time_ms: u64,
    /// Interval between sweeps in milliseconds.
    pub sweep_interval_ms: u64,
    /// How long a session may stay `Closing` before it is torn down.
    pub closing_timeout_ms: u64,
    /// Bound on joining the accept task during stop.
    pub stop_timeout_ms: u64,
    /// How long a connection may take to finish TLS and the upgrade.
    pub handshake_timeout_ms: u64,
    /// Largest accepted message in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            secure: false,
            certificate_path: None,
            private_key_path: None,
            reuse_address: true,
            allow_forwarded_request: false,
            auth_scheme: AuthSchemeSetting::Anonymous,
            realm: "portico".to_string(),
            basic_users: BTreeMap::new(),
            keep_clean: true,
            wait_time_ms: 1_000,
            sweep_interval_ms: 60_000,
            closing_timeout_ms: 5_000,
            stop_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            max_message_size: 16 << 20,
        }
    }
}
