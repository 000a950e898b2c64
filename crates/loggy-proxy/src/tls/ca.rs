//! Certificate Authority for TLS interception.
//!
//! Generates and persists the root CA that signs per-host server
//! certificates on demand. The root lives under the per-user data
//! directory so it survives restarts and can be installed into the
//! system trust store once.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Common name of the root certificate.
const CA_COMMON_NAME: &str = "Loggy Proxy CA";

/// Errors that can occur during CA operations
#[derive(Debug, Error)]
pub enum CertificateAuthorityError {
    #[error("Failed to generate key pair: {0}")]
    KeyGenerationError(String),

    #[error("Failed to generate certificate: {0}")]
    CertificateGenerationError(String),

    #[error("Failed to read file: {0}")]
    FileReadError(#[from] std::io::Error),

    #[error("Failed to parse PEM: {0}")]
    PemParseError(String),

    #[error("Failed to parse private key: {0}")]
    PrivateKeyParseError(String),

    #[error("Rustls error: {0}")]
    RustlsError(String),
}

/// Root Certificate Authority that signs leaf certificates for
/// intercepted hosts.
pub struct CertificateAuthority {
    /// The CA certificate in PEM format
    cert_pem: String,
    /// The CA certificate in DER format (for signing)
    cert_der: Vec<u8>,
    /// The CA key pair
    key_pair: Arc<KeyPair>,
}

impl CertificateAuthority {
    /// Create a new CA with a freshly generated key pair and certificate
    pub fn new() -> Result<Self, CertificateAuthorityError> {
        let key_pair = KeyPair::generate()
            .map_err(|e| CertificateAuthorityError::KeyGenerationError(e.to_string()))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(CA_COMMON_NAME.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Loggy Proxy".to_string()),
        );
        params.distinguished_name = dn;

        // Signing-only CA, two intermediates deep at most
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(2));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // Backdate a day so clients with slightly-behind clocks accept it;
        // valid for 10 years
        params.not_before = time::OffsetDateTime::now_utc() - Duration::from_secs(24 * 60 * 60);
        params.not_after =
            time::OffsetDateTime::now_utc() + Duration::from_secs(10 * 365 * 24 * 60 * 60);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertificateAuthorityError::CertificateGenerationError(e.to_string()))?;

        let cert_pem = cert.pem();
        let cert_der = cert.der().to_vec();

        info!("Generated new CA certificate");

        Ok(Self {
            cert_pem,
            cert_der,
            key_pair: Arc::new(key_pair),
        })
    }

    /// Load the CA from PEM files, or create and persist a new one if
    /// they don't exist yet. Idempotent across restarts.
    pub fn load_or_create(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, CertificateAuthorityError> {
        if cert_path.exists() && key_path.exists() {
            Self::load(cert_path, key_path)
        } else {
            let ca = Self::new()?;
            ca.save(cert_path, key_path)?;
            Ok(ca)
        }
    }

    /// Load a CA from PEM files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateAuthorityError> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| CertificateAuthorityError::PrivateKeyParseError(e.to_string()))?;

        let cert_der = pem_to_der(&cert_pem).map_err(CertificateAuthorityError::PemParseError)?;

        info!(path = %cert_path.display(), "Loaded CA certificate from disk");

        Ok(Self {
            cert_pem,
            cert_der,
            key_pair: Arc::new(key_pair),
        })
    }

    /// Save the CA certificate and key to PEM files.
    ///
    /// The certificate is world-readable; the key is owner-only.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<(), CertificateAuthorityError> {
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(cert_path, &self.cert_pem)?;
        fs::write(key_path, self.key_pair.serialize_pem())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(cert_path, fs::Permissions::from_mode(0o644))?;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
        }

        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Saved CA certificate and key"
        );

        Ok(())
    }

    /// Mint a server certificate for the given hostname, signed by this
    /// CA. Covers the host itself and its first-level wildcard.
    pub fn generate_cert(
        &self,
        hostname: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), CertificateAuthorityError> {
        let key_pair = KeyPair::generate()
            .map_err(|e| CertificateAuthorityError::KeyGenerationError(e.to_string()))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(hostname.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Loggy Proxy".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        params.subject_alt_names = vec![SanType::DnsName(hostname.try_into().map_err(|e| {
            CertificateAuthorityError::CertificateGenerationError(format!(
                "Invalid hostname '{}': {}",
                hostname, e
            ))
        })?)];

        // Wildcard SAN so one leaf covers sibling subdomains
        if !hostname.starts_with("*.") && hostname.matches('.').count() >= 1 {
            let wildcard = format!("*.{}", hostname);
            if let Ok(san) = wildcard.as_str().try_into() {
                params.subject_alt_names.push(SanType::DnsName(san));
            }
        }

        // Valid for 1 year
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after =
            time::OffsetDateTime::now_utc() + Duration::from_secs(365 * 24 * 60 * 60);

        // Rebuild a signing certificate from our CA's DER and key
        let ca_cert_der = CertificateDer::from(self.cert_der.clone());
        let ca_params = CertificateParams::from_ca_cert_der(&ca_cert_der)
            .map_err(|e| CertificateAuthorityError::PemParseError(e.to_string()))?;
        let ca_cert = ca_params
            .self_signed(&self.key_pair)
            .map_err(|e| CertificateAuthorityError::CertificateGenerationError(e.to_string()))?;

        let cert = params
            .signed_by(&key_pair, &ca_cert, &self.key_pair)
            .map_err(|e| CertificateAuthorityError::CertificateGenerationError(e.to_string()))?;

        debug!(hostname = %hostname, "Minted leaf certificate");

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        Ok((cert_der, key_der))
    }

    /// Get the CA certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Get the CA certificate in DER format
    pub fn cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }
}

/// Parse PEM certificate to DER bytes
fn pem_to_der(pem: &str) -> Result<Vec<u8>, String> {
    let begin_marker = "-----BEGIN CERTIFICATE-----";
    let end_marker = "-----END CERTIFICATE-----";

    let start = pem
        .find(begin_marker)
        .ok_or_else(|| "Missing BEGIN CERTIFICATE marker".to_string())?
        + begin_marker.len();
    let end = pem
        .find(end_marker)
        .ok_or_else(|| "Missing END CERTIFICATE marker".to_string())?;

    let base64_content: String = pem[start..end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &base64_content)
        .map_err(|e| format!("Failed to decode base64: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ca_generation() {
        let ca = CertificateAuthority::new().unwrap();
        assert!(!ca.cert_pem().is_empty());
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_ca_save_and_load() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca-key.pem");

        let ca1 = CertificateAuthority::new().unwrap();
        ca1.save(&cert_path, &key_path).unwrap();

        let ca2 = CertificateAuthority::load(&cert_path, &key_path).unwrap();

        assert_eq!(ca1.cert_pem(), ca2.cert_pem());
        assert_eq!(ca1.cert_der.len(), ca2.cert_der.len());
    }

    #[test]
    fn test_load_or_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca-key.pem");

        let first = CertificateAuthority::load_or_create(&cert_path, &key_path).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());

        // Second call loads the persisted pair instead of regenerating
        let second = CertificateAuthority::load_or_create(&cert_path, &key_path).unwrap();
        assert_eq!(first.cert_pem(), second.cert_pem());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca-key.pem");

        CertificateAuthority::load_or_create(&cert_path, &key_path).unwrap();

        let key_mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        let cert_mode = std::fs::metadata(&cert_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(key_mode, 0o600);
        assert_eq!(cert_mode, 0o644);
    }

    #[test]
    fn test_generate_server_cert() {
        let ca = CertificateAuthority::new().unwrap();
        let (cert, key) = ca.generate_cert("example.com").unwrap();

        assert!(!cert.as_ref().is_empty());
        match &key {
            PrivateKeyDer::Pkcs8(k) => assert!(!k.secret_pkcs8_der().is_empty()),
            _ => panic!("Expected PKCS8 key"),
        }
    }

    #[test]
    fn test_generate_cert_for_subdomain() {
        let ca = CertificateAuthority::new().unwrap();
        assert!(ca.generate_cert("api.segment.io").is_ok());
        assert!(ca.generate_cert("sub.api.example.com").is_ok());
    }
}
