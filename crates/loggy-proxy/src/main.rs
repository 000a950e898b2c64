//! Loggy Proxy binary entry point.
//!
//! With a subcommand this is a normal CLI; with no arguments and a
//! non-TTY stdin it is being launched by the browser and speaks the
//! native messaging protocol instead.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use loggy_core::{config, ProxySettings};
use loggy_proxy::{native, run_proxy, tls};
use std::io::{IsTerminal, Write};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "loggy-proxy",
    version,
    about = "Analytics event interception proxy",
    long_about = "Intercepts HTTPS analytics traffic through a local MITM proxy and exposes \
                  the captured events over a local HTTP API. Run without arguments under a \
                  browser to act as its native messaging host."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MITM proxy server (port 8888) and control API (port 8889)
    Proxy,
    /// Install the Chrome native messaging host manifest
    Install {
        /// Extension id from chrome://extensions
        extension_id: Option<String>,
    },
    /// Trust the CA certificate in the system trust store
    TrustCert,
}

/// Logs go to stderr: stdout belongs to the native messaging protocol.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,loggy_proxy=debug,loggy_core=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Proxy) => {
            tracing::info!("Starting Loggy Proxy v{}", env!("CARGO_PKG_VERSION"));
            let settings = match ProxySettings::load() {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("Falling back to default settings: {}", e);
                    ProxySettings::default()
                }
            };
            run_proxy(settings).await
        }
        Some(Command::Install { extension_id }) => install(extension_id),
        Some(Command::TrustCert) => trust_cert(),
        None => {
            if std::io::stdin().is_terminal() {
                Cli::command().print_help()?;
                Ok(())
            } else {
                // Launched by the browser
                tokio::task::spawn_blocking(native::run)
                    .await
                    .context("Native messaging host panicked")?
                    .context("Native messaging host failed")
            }
        }
    }
}

fn install(extension_id: Option<String>) -> Result<()> {
    let extension_id = match extension_id {
        Some(id) => id,
        None => {
            print!("Enter your extension id (from chrome://extensions): ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            line.trim().to_string()
        }
    };

    if extension_id.is_empty() {
        bail!("Extension id is required");
    }

    let manifest_path =
        native::install::install(&extension_id).context("Failed to install native host")?;
    println!("Native messaging host installed: {}", manifest_path.display());
    println!("The extension can now start and stop the proxy.");
    Ok(())
}

fn trust_cert() -> Result<()> {
    let cert_path = config::ca_cert_path()?;
    let key_path = config::ca_key_path()?;

    // Make sure there is a certificate to trust
    tls::CertificateAuthority::load_or_create(&cert_path, &key_path)
        .context("Failed to prepare CA certificate")?;

    println!("Adding the CA certificate to the system trust store...");
    println!("You may be prompted for your password.");

    tls::trust_root(&cert_path).context("Failed to trust CA certificate")?;
    println!("CA certificate trusted: {}", cert_path.display());
    Ok(())
}
