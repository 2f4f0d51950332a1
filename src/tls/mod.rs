use crate::error::{GatewayError, Result};
use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// TLS configuration for the gateway
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TlsConfig {
    /// Path to the TLS certificate chain (PEM format)
    pub cert_path: String,

    /// Path to the TLS private key file (PEM format, PKCS#8, PKCS#1 or SEC1)
    pub key_path: String,
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| {
        GatewayError::Tls(format!("Failed to open {} {}: {}", what, path.display(), e))
    })
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path, "certificate file")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            GatewayError::Tls(format!(
                "Failed to parse certificates from {}: {}",
                path.display(),
                e
            ))
        })?;

    if certs.is_empty() {
        return Err(GatewayError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load the first private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path, "private key file")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            GatewayError::Tls(format!(
                "Failed to parse private key from {}: {}",
                path.display(),
                e
            ))
        })?
        .ok_or_else(|| {
            GatewayError::Tls(format!("No private keys found in {}", path.display()))
        })
}

/// Build TLS server configuration
pub fn build_tls_config(tls_config: &TlsConfig) -> Result<ServerConfig> {
    info!("Building TLS configuration");

    let certs = load_certs(Path::new(&tls_config.cert_path))?;
    let key = load_private_key(Path::new(&tls_config.key_path))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(format!("Failed to build TLS config: {}", e)))?;

    // Enable ALPN for HTTP/2 and HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!("TLS configuration built successfully");
    Ok(config)
}

/// TLS acceptor settings for `axum-server`
pub fn rustls_config(tls_config: &TlsConfig) -> Result<RustlsConfig> {
    Ok(RustlsConfig::from_config(Arc::new(build_tls_config(
        tls_config,
    )?)))
}
