//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may name only the fields it changes.

mod logging;
mod server;

pub use logging::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the Portico daemon.
///
/// ```json
/// {
///   "server": { "port": 9090, "authScheme": "basic", "basicUsers": { "ops": "secret" } },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PorticoSettings {
    /// Listener, TLS, authentication and session housekeeping.
    pub server: ServerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl PorticoSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.wait_time_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.waitTimeMs must be greater than zero".into(),
            ));
        }
        if server.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sweepIntervalMs must be greater than zero".into(),
            ));
        }
        if server.secure
            && (server.certificate_path.is_none() || server.private_key_path.is_none())
        {
            return Err(SettingsError::InvalidValue(
                "server.secure requires certificatePath and privateKeyPath".into(),
            ));
        }
        if server.auth_scheme == AuthSchemeSetting::Basic && server.realm.is_empty() {
            return Err(SettingsError::InvalidValue(
                "server.realm must be set for basic authentication".into(),
            ));
        }
        Ok(())
    }
}
