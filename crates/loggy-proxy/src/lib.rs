//! Loggy Proxy - intercepting HTTPS proxy for analytics traffic.
//!
//! The data plane (MITM proxy + capture pipeline) and the control plane
//! (HTTP API) run in one process started by [`run_proxy`]; the native
//! messaging supervisor in [`native`] runs in a separate host-invoked
//! process and manages this one via signals and the PID file.

pub mod api;
pub mod capture;
pub mod native;
pub mod server;
pub mod tls;

use anyhow::{Context, Result};
use loggy_core::{config, EventBuffer, ProxySettings, SourceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tls::TlsManager;
use tokio::sync::Mutex;
use tracing::info;

/// Process-wide shared state, constructed once at startup and threaded
/// into the servers. The registry and buffer are shared between the
/// request path and the control API.
pub struct AppState {
    pub settings: ProxySettings,
    pub registry: SourceRegistry,
    pub events: Mutex<EventBuffer>,
    pub tls: TlsManager,
}

impl AppState {
    pub fn new(settings: ProxySettings, tls: TlsManager) -> Self {
        Self {
            registry: SourceRegistry::with_defaults(),
            events: Mutex::new(EventBuffer::new(settings.event_capacity)),
            tls,
            settings,
        }
    }
}

/// Run the data plane until a shutdown signal arrives.
///
/// Fatal setup errors (CA material, port binds) propagate out so the
/// process exits nonzero; after that, per-connection failures never
/// bring the servers down.
pub async fn run_proxy(settings: ProxySettings) -> Result<()> {
    // rustls resolves its crypto provider process-wide, once
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_path = config::ca_cert_path()?;
    let key_path = config::ca_key_path()?;
    let tls = TlsManager::new(&cert_path, &key_path).context("Failed to initialize CA")?;

    let grace = Duration::from_secs(settings.shutdown_grace_secs);
    let state = Arc::new(AppState::new(settings, tls));

    let proxy = Arc::new(server::ProxyServer::new(state.clone())?);
    let api = api::ApiServer::new(state.clone());

    info!("Loggy Proxy running");
    info!("  MITM proxy:  http://0.0.0.0:{}", state.settings.proxy_port);
    info!("  Control API: http://0.0.0.0:{}", state.settings.api_port);

    tokio::select! {
        result = proxy.run() => result.context("Proxy server failed")?,
        result = api.run() => result.context("API server failed")?,
        signal = shutdown_signal() => {
            info!("Received {}, draining in-flight connections...", signal);
            tokio::time::sleep(grace).await;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives, reporting which.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    }
}
