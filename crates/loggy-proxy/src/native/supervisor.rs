//! Proxy lifecycle management for the native messaging host.
//!
//! The supervisor and the proxy child communicate only through OS
//! signals and the PID file; the HTTP API is the query surface for
//! everything else. The supervisor owns the PID file exclusively.

use super::HostResponse;
use crate::tls;
use loggy_core::config;
use loggy_core::ProxySettings;
use std::fs;
use std::net::{SocketAddr, TcpStream};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How long to wait for the child to come up before probing its port.
const START_PROBE_DELAY: Duration = Duration::from_millis(500);

/// How long to wait after SIGTERM before verifying shutdown.
const STOP_WAIT: Duration = Duration::from_millis(300);

/// Dispatch one extension action.
pub fn handle(action: &str) -> HostResponse {
    match action {
        "ping" => HostResponse::ok(),
        "startProxy" => start_proxy(),
        "stopProxy" => stop_proxy(),
        "getStatus" => get_status(),
        other => HostResponse::err(format!("Unknown action: {}", other)),
    }
}

fn start_proxy() -> HostResponse {
    let settings = ProxySettings::load().unwrap_or_default();

    // A previous proxy (ours or a stale one) may still hold the ports
    if port_in_use(settings.proxy_port) || port_in_use(settings.api_port) {
        kill_port_listeners(settings.proxy_port);
        kill_port_listeners(settings.api_port);
        thread::sleep(START_PROBE_DELAY);
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return HostResponse::err(format!("Failed to get executable path: {}", e)),
    };

    let mut command = Command::new(&exe);
    command
        .arg("proxy")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // New process group so the child outlives the host and never
    // receives the browser's signals
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return HostResponse::err(format!("Failed to start proxy: {}", e)),
    };
    let pid = child.id() as i32;

    if let Err(e) = write_pid_file(pid) {
        warn!("Failed to write PID file: {}", e);
    }

    // Reap the child whenever it exits; the PID file remains the source
    // of truth for liveness
    thread::spawn(move || {
        let _ = child.wait();
    });

    thread::sleep(START_PROBE_DELAY);
    if !port_in_use(settings.proxy_port) {
        return HostResponse::err("Proxy failed to start");
    }

    // Trust the CA and hand the user a proxied browser, off the reply path
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        if let Ok(cert_path) = config::ca_cert_path() {
            if let Err(e) = tls::trust_root(&cert_path) {
                debug!("Trust store install skipped: {}", e);
            }
        }
        launch_browser(settings.proxy_port);
    });

    HostResponse {
        message: Some("Proxy started; HTTPS interception active".to_string()),
        pid: Some(pid),
        auto_launched: Some(true),
        ..HostResponse::ok()
    }
}

fn stop_proxy() -> HostResponse {
    let settings = ProxySettings::load().unwrap_or_default();

    let pid = read_pid_file();
    if pid == 0 {
        return HostResponse::err("No proxy PID found. Proxy may not be running.");
    }

    // The process may already be gone; that's fine, we still verify the
    // port below
    send_signal(pid, Some(Sig::Term));

    thread::sleep(STOP_WAIT);

    if port_in_use(settings.proxy_port) {
        return HostResponse::err("Proxy may still be running");
    }

    if let Ok(path) = config::pid_file_path() {
        let _ = fs::remove_file(path);
    }

    HostResponse {
        message: Some("Proxy stopped".to_string()),
        ..HostResponse::ok()
    }
}

fn get_status() -> HostResponse {
    let pid = read_pid_file();
    let running = pid != 0 && send_signal(pid, None);

    HostResponse {
        running: Some(running),
        pid: Some(pid),
        ..HostResponse::ok()
    }
}

/// Signals the supervisor sends.
enum Sig {
    Term,
}

/// Send a signal to a PID; `None` is the null signal (liveness probe).
/// Returns whether the delivery succeeded.
fn send_signal(pid: i32, sig: Option<Sig>) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let signal = sig.map(|s| match s {
            Sig::Term => Signal::SIGTERM,
        });
        signal::kill(Pid::from_raw(pid), signal).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, sig);
        false
    }
}

fn write_pid_file(pid: i32) -> std::io::Result<()> {
    let path = config::pid_file_path()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pid.to_string())
}

/// PID from the PID file, or 0 when absent or malformed.
fn read_pid_file() -> i32 {
    config::pid_file_path()
        .ok()
        .and_then(|path| fs::read_to_string(path).ok())
        .map(|contents| parse_pid(&contents))
        .unwrap_or(0)
}

fn parse_pid(contents: &str) -> i32 {
    contents.trim().parse().unwrap_or(0)
}

/// Whether something is listening on the local port.
fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(250)).is_ok()
}

/// SIGTERM whatever is listening on the port, via lsof.
fn kill_port_listeners(port: u16) {
    let output = match Command::new("lsof")
        .args(["-ti", &format!(":{}", port)])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            debug!("lsof unavailable: {}", e);
            return;
        }
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Ok(pid) = line.trim().parse::<i32>() {
            debug!(pid, port, "Terminating stale listener");
            send_signal(pid, Some(Sig::Term));
        }
    }
}

/// Open a browser pointed at the proxy with a scratch profile.
/// Best effort; failure only means the user opens one themselves.
#[cfg(target_os = "macos")]
fn launch_browser(proxy_port: u16) {
    let _ = Command::new("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
        .arg(format!("--proxy-server=http://127.0.0.1:{}", proxy_port))
        .arg("--user-data-dir=/tmp/loggy-proxy-profile")
        .arg("--ignore-certificate-errors")
        .spawn();
}

#[cfg(not(target_os = "macos"))]
fn launch_browser(proxy_port: u16) {
    for browser in ["google-chrome", "chromium", "chromium-browser"] {
        let spawned = Command::new(browser)
            .arg(format!("--proxy-server=http://127.0.0.1:{}", proxy_port))
            .arg("--user-data-dir=/tmp/loggy-proxy-profile")
            .arg("--ignore-certificate-errors")
            .spawn();
        if spawned.is_ok() {
            return;
        }
    }
    debug!("No Chrome-family browser found to launch");
}
