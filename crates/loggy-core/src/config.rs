//! Runtime settings and per-user file locations.
//!
//! Settings live in `~/.loggy-proxy/config.toml`; defaults are used when
//! the file is absent, so a fresh install needs no configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Data-plane proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8888;

/// Control-plane HTTP API port.
pub const DEFAULT_API_PORT: u16 = 8889;

/// Runtime settings for the proxy process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Port the MITM proxy listens on
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port the HTTP control API listens on
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Largest request body the capture pipeline will inspect, in bytes
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,

    /// How many captured events to keep in memory
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Grace window for in-flight connections on shutdown, in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            api_port: default_api_port(),
            max_capture_bytes: default_max_capture_bytes(),
            event_capacity: default_event_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_max_capture_bytes() -> usize {
    1024 * 1024
}

fn default_event_capacity() -> usize {
    crate::events::DEFAULT_EVENT_CAPACITY
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    2
}

impl ProxySettings {
    /// Load settings from the data directory, falling back to defaults
    /// when no config file exists.
    pub fn load() -> Result<Self> {
        let path = data_dir()?.join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Write settings to the data directory.
    pub fn save(&self) -> Result<()> {
        let dir = data_dir()?;
        fs::create_dir_all(&dir).context("Failed to create data directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(dir.join("config.toml"), contents).context("Failed to write config file")
    }
}

/// Per-user data directory (`~/.loggy-proxy`).
pub fn data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".loggy-proxy"))
}

/// Directory holding the CA certificate and key.
pub fn cert_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("certs"))
}

/// Path of the PEM-encoded root certificate.
pub fn ca_cert_path() -> Result<PathBuf> {
    Ok(cert_dir()?.join("ca.pem"))
}

/// Path of the PEM-encoded root private key.
pub fn ca_key_path() -> Result<PathBuf> {
    Ok(cert_dir()?.join("ca-key.pem"))
}

/// Path of the running proxy's PID file, owned by the supervisor.
pub fn pid_file_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(".proxy.pid"))
}
