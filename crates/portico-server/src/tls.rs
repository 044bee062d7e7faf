//! TLS acceptor construction from PEM files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};

/// Build the acceptor for a secure server, or `None` for plain `ws://`.
pub fn acceptor_for(config: &ServerConfig) -> Result<Option<TlsAcceptor>> {
    if !config.secure {
        return Ok(None);
    }
    let (Some(cert), Some(key)) = (&config.certificate_path, &config.private_key_path) else {
        return Err(ServerError::MissingCertificate);
    };
    load_acceptor(cert, key).map(Some)
}

/// Load a certificate chain and private key into a rustls acceptor.
pub fn load_acceptor(certificate: &Path, private_key: &Path) -> Result<TlsAcceptor> {
    let (certs, key) = load_identity(certificate, private_key)?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ServerError::Tls(err.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_identity(
    certificate: &Path,
    private_key: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = File::open(certificate).map_err(|err| {
        ServerError::Tls(format!("certificate file {}: {err}", certificate.display()))
    })?;
    let mut reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| ServerError::Tls(format!("parse certificate: {err}")))?;
    if certs.is_empty() {
        return Err(ServerError::Tls("no certificates found".into()));
    }

    let key_file = File::open(private_key).map_err(|err| {
        ServerError::Tls(format!("private key file {}: {err}", private_key.display()))
    })?;
    let mut reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|err| ServerError::Tls(format!("parse private key: {err}")))?
        .ok_or_else(|| ServerError::Tls("no private key found in file".into()))?;

    Ok((certs, key))
}
