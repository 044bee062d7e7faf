//! # portico
//!
//! Portico server binary: loads settings, mounts the bundled services, and
//! serves until interrupted.

#![deny(unsafe_code)]

mod services;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use portico_server::{AuthScheme, ServerConfig, WebSocketServer};
use portico_settings::{LogLevel, PorticoSettings, load_settings_from_path, settings_path};
use tracing::{info, warn};

/// Portico WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "portico", about = "Portico WebSocket server")]
struct Cli {
    /// Host to bind: an IP literal or `localhost` (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.portico/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level: error, warn, info, debug, or trace.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

/// Load the settings file and apply command-line overrides on top.
fn resolve_settings(cli: &Cli) -> Result<PorticoSettings> {
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = cli.log_level.as_deref() {
        settings.logging.level =
            LogLevel::parse(level).with_context(|| format!("Unknown log level: {level}"))?;
    }
    if cli.json_logs {
        settings.logging.json = true;
    }
    Ok(settings)
}

fn init_logging(settings: &PorticoSettings) {
    let level = settings.logging.level.as_filter_str();
    if settings.logging.json {
        portico_core::logging::init_json_subscriber(level);
    } else {
        portico_core::logging::init_subscriber(level);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;
    init_logging(&settings);

    let config = ServerConfig::from_settings(&settings.server).context("Invalid server settings")?;
    let server = WebSocketServer::new(config);
    let _ = server.set_auth_scheme(AuthScheme::from_settings(&settings.server));
    services::mount(&server).context("Failed to register services")?;

    server.start().context("Failed to start server")?;
    if let Some(addr) = server.local_addr() {
        info!(
            url = %format!("{}://{addr}", server.config().scheme()),
            services = ?server.service_paths(),
            "portico listening"
        );
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("shutdown signal received");
        }
        outcome = server.wait() => {
            if let Err(err) = outcome {
                warn!(error = %err, "server stopped on its own");
            }
        }
    }

    server
        .stop(1001, "server shutting down")
        .await
        .context("Failed to stop server")?;
    info!("portico stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["portico"]);
        assert_eq!(cli.host, None);
        assert_eq!(cli.port, None);
        assert_eq!(cli.settings, None);
        assert!(!cli.json_logs);
    }

    #[test]
    fn cli_custom_port_and_host() {
        let cli = Cli::parse_from(["portico", "--port", "8080", "--host", "0.0.0.0"]);
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn cli_settings_path() {
        let cli = Cli::parse_from(["portico", "--settings", "/tmp/portico.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/portico.json")));
    }

    #[test]
    fn cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["portico", "--port", "not-a-port"]).is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7001}, "logging": {"level": "warn"}}"#)
            .unwrap();

        let cli = Cli::parse_from([
            "portico",
            "--settings",
            path.to_str().unwrap(),
            "--host",
            "127.0.0.1",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert!(settings.logging.json);
    }

    #[test]
    fn unknown_log_level_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "portico",
            "--settings",
            dir.path().join("missing.json").to_str().unwrap(),
            "--log-level",
            "loud",
        ]);
        assert!(resolve_settings(&cli).is_err());
    }

    #[test]
    fn config_builds_from_resolved_settings() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "portico",
            "--settings",
            dir.path().join("missing.json").to_str().unwrap(),
            "--host",
            "localhost",
            "--port",
            "0",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        let config = ServerConfig::from_settings(&settings.server).unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.hostname.as_deref(), Some("localhost"));
    }
}
