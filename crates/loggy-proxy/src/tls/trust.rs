//! Best-effort installation of the root CA into the user's trust store.
//!
//! Platform-dependent and never fatal: the proxy works without a trusted
//! root, clients just see certificate warnings until it is installed.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("Trust store unavailable: {0}")]
    TrustStoreUnavailable(String),
}

/// Install the root certificate into the user's trust store.
#[cfg(target_os = "macos")]
pub fn trust_root(cert_path: &Path) -> Result<(), TrustError> {
    use std::process::Command;
    use tracing::info;

    if !cert_path.exists() {
        return Err(TrustError::TrustStoreUnavailable(format!(
            "CA certificate not found at {}",
            cert_path.display()
        )));
    }

    let keychain = dirs::home_dir()
        .ok_or_else(|| TrustError::TrustStoreUnavailable("no home directory".to_string()))?
        .join("Library/Keychains/login.keychain-db");

    let status = Command::new("security")
        .args(["add-trusted-cert", "-d", "-r", "trustRoot", "-k"])
        .arg(&keychain)
        .arg(cert_path)
        .status()
        .map_err(|e| TrustError::TrustStoreUnavailable(e.to_string()))?;

    if !status.success() {
        return Err(TrustError::TrustStoreUnavailable(format!(
            "security add-trusted-cert exited with {}",
            status
        )));
    }

    info!(cert = %cert_path.display(), "CA certificate added to login keychain");
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub fn trust_root(cert_path: &Path) -> Result<(), TrustError> {
    Err(TrustError::TrustStoreUnavailable(format!(
        "No trust-store integration on this platform; import {} manually",
        cert_path.display()
    )))
}
