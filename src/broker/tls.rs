//! TLS acceptor setup
//!
//! Loads certificates and keys from PEM files and builds the acceptor that
//! wraps the MQTT/TCP listener when TLS is enabled.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use super::TlsSettings;

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    Certificate(String),
    /// Private key error
    PrivateKey(String),
    /// TLS configuration error
    Config(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::Certificate(msg) => write!(f, "certificate error: {}", msg),
            TlsError::PrivateKey(msg) => write!(f, "private key error: {}", msg),
            TlsError::Config(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::Certificate(format!(
            "no certificates found in {}",
            path
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {}", e)))
}

fn load_ca_certs(path: &str) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store
            .add(cert)
            .map_err(|e| TlsError::Certificate(format!("failed to add CA certificate: {}", e)))?;
    }
    Ok(root_store)
}

/// Build a TlsAcceptor from the configured certificate material
pub fn load_tls_config(settings: &TlsSettings) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&settings.cert_file)?;
    let key = load_private_key(&settings.key_file)?;

    let server_config = if let Some(ca_path) = &settings.ca_file {
        let root_store = load_ca_certs(ca_path)?;
        let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| TlsError::Config(format!("failed to build client verifier: {}", e)))?;

        ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to build TLS config: {}", e)))?
    } else {
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to build TLS config: {}", e)))?
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::Certificate("test error".to_string());
        assert!(err.to_string().contains("certificate error"));

        let err = TlsError::PrivateKey("key error".to_string());
        assert!(err.to_string().contains("private key error"));
    }

    #[test]
    fn test_missing_cert_file() {
        let settings = TlsSettings {
            cert_file: "/nonexistent/server.pem".to_string(),
            key_file: "/nonexistent/server.key".to_string(),
            ca_file: None,
        };
        assert!(matches!(load_tls_config(&settings), Err(TlsError::Io(_))));
    }
}
