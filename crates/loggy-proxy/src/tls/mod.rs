//! TLS certificate management for the intercepting proxy.
//!
//! The [`CertificateAuthority`] is the persistent root of trust; the
//! [`CertificateCache`] memoizes the per-host server configurations it
//! signs; [`TlsManager`] ties the two together for the CONNECT path.

pub mod ca;
pub mod cert_cache;
pub mod trust;

pub use ca::{CertificateAuthority, CertificateAuthorityError};
pub use cert_cache::CertificateCache;
pub use trust::{trust_root, TrustError};

use std::path::Path;
use std::sync::Arc;

/// Coordinates leaf minting and caching on top of the root CA.
pub struct TlsManager {
    ca: Arc<CertificateAuthority>,
    cert_cache: CertificateCache,
}

impl TlsManager {
    /// Load the persisted CA (generating one on first run) and set up
    /// the leaf cache.
    pub fn new(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateAuthorityError> {
        let ca = CertificateAuthority::load_or_create(cert_path, key_path)?;
        Ok(Self {
            ca: Arc::new(ca),
            cert_cache: CertificateCache::with_default_size(),
        })
    }

    /// Server configuration for a host, minting and caching the leaf on
    /// first use.
    pub async fn server_config(
        &self,
        host: &str,
    ) -> Result<Arc<rustls::ServerConfig>, CertificateAuthorityError> {
        if let Some(config) = self.cert_cache.get(host).await {
            return Ok(config);
        }

        let (cert, key) = self.ca.generate_cert(host)?;

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(|e| CertificateAuthorityError::RustlsError(e.to_string()))?;
        // The inner connection is served as HTTP/1.1
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let server_config = Arc::new(server_config);
        self.cert_cache
            .insert(host.to_string(), server_config.clone())
            .await;

        Ok(server_config)
    }

    /// The CA certificate in PEM format, for trust-store installation.
    pub fn ca_cert_pem(&self) -> &str {
        self.ca.cert_pem()
    }
}
