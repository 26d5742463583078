//! TLS trust configuration for the stream transport.
//!
//! The relay certificate is checked against a private CA, supplied either as
//! a PEM file or as raw DER bytes.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{LyncnatError, Result};

/// Where the trusted CA certificates come from.
#[derive(Debug, Clone)]
pub enum TrustConfig {
    /// PEM file with one or more CA certificates.
    PemFile {
        /// Path to the PEM file.
        path: PathBuf,
    },
    /// DER-encoded CA certificates.
    Der {
        /// One entry per certificate.
        certs: Vec<Vec<u8>>,
    },
}

impl TrustConfig {
    /// Trust the CAs in a PEM file.
    pub fn pem_file(path: impl Into<PathBuf>) -> Self {
        Self::PemFile { path: path.into() }
    }

    /// Trust a single DER certificate.
    pub fn der(cert: Vec<u8>) -> Self {
        Self::Der { certs: vec![cert] }
    }

    /// Load the certificates for rustls 0.21.
    pub fn load(&self) -> Result<Vec<rustls::Certificate>> {
        let certs: Vec<rustls::Certificate> = match self {
            Self::PemFile { path } => {
                let pem = fs::read(path).map_err(|e| {
                    LyncnatError::Config(format!("Failed to read CA file {:?}: {}", path, e))
                })?;
                rustls_pemfile::certs(&mut pem.as_slice())
                    .map_err(|e| LyncnatError::Config(format!("Failed to parse CA PEM: {}", e)))?
                    .into_iter()
                    .map(rustls::Certificate)
                    .collect()
            }
            Self::Der { certs } => certs.iter().cloned().map(rustls::Certificate).collect(),
        };

        if certs.is_empty() {
            return Err(LyncnatError::Config(
                "No CA certificates found".to_string(),
            ));
        }
        Ok(certs)
    }

    /// Root store holding the configured CAs.
    pub fn root_store(&self) -> Result<rustls::RootCertStore> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in self.load()? {
            roots.add(&cert)?;
        }
        Ok(roots)
    }

    /// Client configuration trusting only the configured CAs.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(self.root_store()?)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Parse a DNS name or IP literal for SNI and certificate checks.
pub fn server_name(name: &str) -> Result<rustls::ServerName> {
    rustls::ServerName::try_from(name)
        .map_err(|e| LyncnatError::Tls(format!("Invalid server name '{}': {}", name, e)))
}
