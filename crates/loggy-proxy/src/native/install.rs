//! Native messaging host manifest installation.
//!
//! Writes the JSON manifest the browser uses to locate and launch the
//! host, plus a thin wrapper script the manifest points at. Some
//! browsers sanitize argv when launching native hosts, so the manifest
//! must reference a script that `exec`s the real binary rather than the
//! binary itself.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Host identifier the extension connects to.
pub const HOST_NAME: &str = "com.analytics_logger.proxy";

/// Chrome native messaging host manifest.
#[derive(Debug, Serialize)]
pub struct HostManifest {
    pub name: String,
    pub description: String,
    pub path: String,
    #[serde(rename = "type")]
    pub transport: String,
    pub allowed_origins: Vec<String>,
}

impl HostManifest {
    fn new(wrapper_path: &str, extension_id: &str) -> Self {
        Self {
            name: HOST_NAME.to_string(),
            description: "Loggy Analytics Proxy Control".to_string(),
            path: wrapper_path.to_string(),
            transport: "stdio".to_string(),
            allowed_origins: vec![format!("chrome-extension://{}/", extension_id)],
        }
    }
}

/// Install the host manifest for the given extension id. Returns the
/// manifest path.
pub fn install(extension_id: &str) -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to get executable path")?;
    let exe = exe
        .canonicalize()
        .unwrap_or(exe);

    let wrapper_path = exe
        .parent()
        .context("Executable has no parent directory")?
        .join("loggy-proxy-host");
    write_wrapper_script(&wrapper_path, &exe)?;
    info!(path = %wrapper_path.display(), "Wrapper script created");

    let manifest = HostManifest::new(&wrapper_path.to_string_lossy(), extension_id);

    let hosts_dir = native_messaging_hosts_dir()?;
    fs::create_dir_all(&hosts_dir)
        .with_context(|| format!("Failed to create {}", hosts_dir.display()))?;

    let manifest_path = hosts_dir.join(format!("{}.json", HOST_NAME));
    let contents =
        serde_json::to_string_pretty(&manifest).context("Failed to serialize manifest")?;
    fs::write(&manifest_path, contents)
        .with_context(|| format!("Failed to write manifest {}", manifest_path.display()))?;

    info!(path = %manifest_path.display(), "Native messaging host manifest installed");
    Ok(manifest_path)
}

fn write_wrapper_script(wrapper_path: &PathBuf, exe: &PathBuf) -> Result<()> {
    let script = format!("#!/bin/bash\nexec {} \"$@\"\n", exe.display());
    fs::write(wrapper_path, script)
        .with_context(|| format!("Failed to write wrapper script {}", wrapper_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(wrapper_path, fs::Permissions::from_mode(0o755))
            .context("Failed to mark wrapper script executable")?;
    }

    Ok(())
}

/// Platform directory Chrome scans for host manifests.
fn native_messaging_hosts_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;

    #[cfg(target_os = "macos")]
    {
        Ok(home.join("Library/Application Support/Google/Chrome/NativeMessagingHosts"))
    }

    #[cfg(not(target_os = "macos"))]
    {
        Ok(home.join(".config/google-chrome/NativeMessagingHosts"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_shape() {
        let manifest = HostManifest::new("/usr/local/bin/loggy-proxy-host", "abcdefgh");
        let value = serde_json::to_value(&manifest).unwrap();

        assert_eq!(value["name"], HOST_NAME);
        assert_eq!(value["type"], "stdio");
        assert_eq!(value["path"], "/usr/local/bin/loggy-proxy-host");
        assert_eq!(
            value["allowed_origins"][0],
            "chrome-extension://abcdefgh/"
        );
    }

    #[test]
    fn test_hosts_dir_is_under_home() {
        let dir = native_messaging_hosts_dir().unwrap();
        assert!(dir.ends_with("NativeMessagingHosts"));
    }
}
