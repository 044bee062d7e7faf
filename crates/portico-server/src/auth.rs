//! Upgrade-request authentication.
//!
//! Three schemes: reject everyone, accept everyone, or HTTP Basic checked
//! against an embedder-supplied credential lookup. A request with no Basic
//! credentials at all gets a `401` challenge so browsers can prompt; any
//! credentials that do not resolve are a `403`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use portico_settings::{AuthSchemeSetting, ServerSettings};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

/// A resolved user and the password they must present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Expected password.
    pub password: String,
}

/// Resolves a user name to its credentials.
pub type CredentialLookup = Arc<dyn Fn(&str) -> Option<Credentials> + Send + Sync>;

/// How upgrade requests are authenticated.
#[derive(Clone, Default)]
pub enum AuthScheme {
    /// Reject every request (403).
    None,
    /// Accept every request.
    #[default]
    Anonymous,
    /// HTTP Basic.
    Basic {
        /// Realm advertised in the challenge.
        realm: String,
        /// Credential source.
        lookup: CredentialLookup,
    },
}

/// Result of checking one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Proceed; carries the authenticated user, if any.
    Accepted(Option<String>),
    /// No credentials; respond 401 with this `WWW-Authenticate` value.
    Challenge(String),
    /// Credentials missing under `None`, or did not resolve (403).
    Rejected,
}

impl AuthScheme {
    /// Basic authentication with the given lookup.
    pub fn basic<F>(realm: impl Into<String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<Credentials> + Send + Sync + 'static,
    {
        Self::Basic {
            realm: realm.into(),
            lookup: Arc::new(lookup),
        }
    }

    /// Basic authentication against a static user table.
    pub fn basic_from_table(realm: impl Into<String>, users: BTreeMap<String, String>) -> Self {
        Self::basic(realm, move |name| {
            users.get(name).map(|password| Credentials {
                username: name.to_string(),
                password: password.clone(),
            })
        })
    }

    /// Build from loaded settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        match settings.auth_scheme {
            AuthSchemeSetting::None => Self::None,
            AuthSchemeSetting::Anonymous => Self::Anonymous,
            AuthSchemeSetting::Basic => {
                Self::basic_from_table(settings.realm.clone(), settings.basic_users.clone())
            }
        }
    }

    /// Check the request headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> AuthOutcome {
        match self {
            Self::None => AuthOutcome::Rejected,
            Self::Anonymous => AuthOutcome::Accepted(None),
            Self::Basic { realm, lookup } => {
                let Some(header) = headers.get(AUTHORIZATION) else {
                    return AuthOutcome::Challenge(format!("Basic realm=\"{realm}\""));
                };
                let Some((user, password)) = header.to_str().ok().and_then(parse_basic) else {
                    return AuthOutcome::Rejected;
                };
                match lookup(&user) {
                    Some(expected)
                        if expected.username == user
                            && constant_time_eq(expected.password.as_bytes(), password.as_bytes()) =>
                    {
                        AuthOutcome::Accepted(Some(user))
                    }
                    _ => AuthOutcome::Rejected,
                }
            }
        }
    }
}

impl fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { realm, .. } => f.debug_struct("Basic").field("realm", realm).finish_non_exhaustive(),
        }
    }
}

/// Parse `Basic <base64(user:password)>`.
fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
