//! TLS setup for the IST channel, loaded from PEM files named in config.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::{
    Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig,
};

use crate::utils::SyncrepError;

fn read_certs(path: &str) -> Result<Vec<Certificate>, SyncrepError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| {
        SyncrepError::Config(format!("cannot open cert file '{}': {}", path, e))
    })?);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| {
            SyncrepError::Config(format!("bad cert file '{}': {}", path, e))
        })?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(SyncrepError::Config(format!(
            "no certificates in '{}'",
            path
        )));
    }
    Ok(certs)
}

fn read_key(path: &str) -> Result<PrivateKey, SyncrepError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| {
        SyncrepError::Config(format!("cannot open key file '{}': {}", path, e))
    })?);
    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|e| {
            SyncrepError::Config(format!("bad key file '{}': {}", path, e))
        })?;
    match keys.pop() {
        Some(key) => Ok(PrivateKey(key)),
        None => Err(SyncrepError::Config(format!(
            "no PKCS#8 private key in '{}'",
            path
        ))),
    }
}

/// Acceptor-side TLS configuration from the configured cert and key.
pub(crate) fn server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<Arc<ServerConfig>, SyncrepError> {
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(read_certs(cert_path)?, read_key(key_path)?)
        .map_err(|e| {
            SyncrepError::Config(format!("tls server setup failed: {}", e))
        })?;
    Ok(Arc::new(config))
}

/// Connector-side TLS configuration trusting the configured CA bundle.
pub(crate) fn client_config(
    ca_path: &str,
) -> Result<Arc<ClientConfig>, SyncrepError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_path)? {
        roots.add(&cert).map_err(|e| {
            SyncrepError::Config(format!("bad CA certificate: {}", e))
        })?;
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
