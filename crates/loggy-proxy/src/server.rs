//! The MITM proxy server.
//!
//! Accepts plain HTTP proxy requests and HTTPS CONNECT tunnels on one
//! listener. CONNECT targets get a TLS handshake with a leaf minted by
//! our CA, after which the inner HTTP/1.1 requests are relayed to the
//! real origin. POST/PUT bodies are teed into the capture pipeline on
//! the way through; the original bytes always reach the origin.

use crate::capture;
use crate::AppState;
use anyhow::{Context, Result};
use futures::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

type ProxyBody = BoxBody<Bytes, std::io::Error>;

/// Headers a proxy must not forward hop-to-hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(message.to_string()))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// The data-plane proxy: one listener handling both plain HTTP and
/// CONNECT, sharing the app state with the control plane.
pub struct ProxyServer {
    state: Arc<AppState>,
    client: reqwest::Client,
}

impl ProxyServer {
    pub fn new(state: Arc<AppState>) -> Result<Self> {
        // Transparent upstream leg: no redirect following, no automatic
        // decompression, bounded connect and idle-read times.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(state.settings.idle_timeout_secs))
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self { state, client })
    }

    /// Bind the proxy port and serve until the task is dropped.
    ///
    /// A bind failure is fatal; per-connection failures are logged and
    /// the accept loop continues.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let port = self.state.settings.proxy_port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind proxy port {}", port))?;

        info!("MITM proxy listening on http://{}", addr);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept proxy connection: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            let idle_timeout = Duration::from_secs(self.state.settings.idle_timeout_secs);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.route(req).await }
                });

                let conn = http1::Builder::new()
                    .preserve_header_case(true)
                    .header_read_timeout(idle_timeout)
                    .serve_connection(io, service)
                    .with_upgrades();

                if let Err(e) = conn.await {
                    debug!(peer = %peer, "Proxy connection ended: {}", e);
                }
            });
        }
    }

    /// Dispatch one proxied request: CONNECT becomes a MITM tunnel,
    /// everything else is relayed directly.
    async fn route(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        if *req.method() == Method::CONNECT {
            return Ok(self.connect(req));
        }

        Ok(self.relay(req, None).await)
    }

    /// Accept a CONNECT, then intercept the tunnel with a minted leaf.
    fn connect(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let authority = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                warn!(uri = %req.uri(), "CONNECT without authority");
                return error_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = self.serve_tls(upgraded, &authority).await {
                        debug!(target = %authority, "Intercepted tunnel closed: {}", e);
                    }
                }
                Err(e) => warn!(target = %authority, "CONNECT upgrade failed: {}", e),
            }
        });

        // hyper transmits this as `200 Connection Established` and then
        // hands us the raw stream via the upgrade above
        Response::new(empty_body())
    }

    /// Terminate TLS on the client side of an upgraded CONNECT stream
    /// and serve the inner HTTP/1.1 requests.
    async fn serve_tls(self: Arc<Self>, upgraded: Upgraded, authority: &str) -> Result<()> {
        let host = authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(authority)
            .to_string();

        let server_config = self
            .state
            .tls
            .server_config(&host)
            .await
            .with_context(|| format!("Failed to mint certificate for {}", host))?;

        let acceptor = TlsAcceptor::from(server_config);
        let tls_stream = acceptor
            .accept(TokioIo::new(upgraded))
            .await
            .with_context(|| format!("TLS handshake with client failed for {}", host))?;

        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            let host = host.clone();
            async move { Ok::<_, Infallible>(server.relay(req, Some(&host)).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
            .context("Inner connection error")?;

        Ok(())
    }

    /// Relay one request to its origin, teeing POST/PUT bodies into the
    /// capture pipeline first. Inspection failures never affect the
    /// relay; the body forwarded upstream is byte-identical to what the
    /// client sent.
    async fn relay(&self, req: Request<Incoming>, connect_host: Option<&str>) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let full_url = match reconstruct_url(&parts.uri, connect_host, &parts.headers) {
            Some(url) => url,
            None => {
                warn!(uri = %parts.uri, "Could not determine request target");
                return error_response(StatusCode::BAD_REQUEST, "Missing request host");
            }
        };

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(url = %full_url, "Failed to read request body: {}", e);
                return error_response(StatusCode::BAD_GATEWAY, "Failed to read request body");
            }
        };

        if parts.method == Method::POST || parts.method == Method::PUT {
            // Plain-HTTP proxying sees all kinds of form posts; only
            // JSON-shaped ones are worth the extractor's time. Inside
            // intercepted TLS everything is fair game.
            let inspect = connect_host.is_some()
                || !full_url.starts_with("http://")
                || capture::is_json_shaped(&parts.headers, &body_bytes);
            if inspect {
                capture::inspect_request(&self.state, &full_url, &parts.headers, &body_bytes)
                    .await;
            }
        }

        self.forward(parts.method, &full_url, &parts.headers, body_bytes)
            .await
    }

    /// The upstream leg: send the original request and stream the
    /// response back.
    async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response<ProxyBody> {
        let mut request = self.client.request(method, url).body(body);

        for (name, value) in headers {
            if forwardable_request_header(name) {
                request = request.header(name, value);
            }
        }

        let upstream = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, "Upstream request failed: {}", e);
                return error_response(StatusCode::BAD_GATEWAY, "Upstream unreachable");
            }
        };

        let mut builder = Response::builder().status(upstream.status());
        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if forwardable_response_header(name) {
                    // append, not insert: Set-Cookie arrives as repeats
                    response_headers.append(name.clone(), value.clone());
                }
            }
        }

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(std::io::Error::other);
        let body = BodyExt::boxed(StreamBody::new(stream));

        builder
            .body(body)
            .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "Invalid upstream response"))
    }
}

/// Request headers we pass upstream. Host and Content-Length are
/// recomputed by the client from the target URL and the restored body.
fn forwardable_request_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name != "host" && name != "content-length" && !HOP_BY_HOP_HEADERS.contains(&name)
}

/// Response headers we pass back. The body streams through unchanged,
/// so the upstream Content-Length stays valid.
fn forwardable_response_header(name: &HeaderName) -> bool {
    !HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Rebuild the absolute URL of a proxied request.
///
/// Plain proxy requests carry an absolute URI already; requests inside
/// an intercepted tunnel only carry the path, so the CONNECT host (or
/// the Host header) supplies the rest.
fn reconstruct_url(
    uri: &hyper::Uri,
    connect_host: Option<&str>,
    headers: &HeaderMap,
) -> Option<String> {
    if uri.scheme().is_some() {
        return Some(uri.to_string());
    }

    let host = connect_host
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Some(format!("https://{}{}", host, path_and_query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconstruct_absolute_uri_passthrough() {
        let uri: hyper::Uri = "http://example.com/track?x=1".parse().unwrap();
        let url = reconstruct_url(&uri, None, &HeaderMap::new()).unwrap();
        assert_eq!(url, "http://example.com/track?x=1");
    }

    #[test]
    fn test_reconstruct_from_connect_host() {
        let uri: hyper::Uri = "/v1/batch?b=1".parse().unwrap();
        let url = reconstruct_url(&uri, Some("api.segment.io"), &HeaderMap::new()).unwrap();
        assert_eq!(url, "https://api.segment.io/v1/batch?b=1");
    }

    #[test]
    fn test_reconstruct_falls_back_to_host_header() {
        let uri: hyper::Uri = "/collect".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "www.google-analytics.com".parse().unwrap());
        let url = reconstruct_url(&uri, None, &headers).unwrap();
        assert_eq!(url, "https://www.google-analytics.com/collect");
    }

    #[test]
    fn test_reconstruct_without_host_fails() {
        let uri: hyper::Uri = "/path".parse().unwrap();
        assert!(reconstruct_url(&uri, None, &HeaderMap::new()).is_none());
    }

    #[test]
    fn test_request_header_filtering() {
        assert!(!forwardable_request_header(&HeaderName::from_static("connection")));
        assert!(!forwardable_request_header(&HeaderName::from_static("transfer-encoding")));
        assert!(!forwardable_request_header(&HeaderName::from_static("host")));
        assert!(!forwardable_request_header(&HeaderName::from_static("content-length")));
        assert!(forwardable_request_header(&HeaderName::from_static("content-encoding")));
        assert!(forwardable_request_header(&HeaderName::from_static("content-type")));
        assert!(forwardable_request_header(&HeaderName::from_static("authorization")));
    }

    #[test]
    fn test_response_header_filtering() {
        assert!(!forwardable_response_header(&HeaderName::from_static("connection")));
        assert!(!forwardable_response_header(&HeaderName::from_static("transfer-encoding")));
        assert!(forwardable_response_header(&HeaderName::from_static("content-length")));
        assert!(forwardable_response_header(&HeaderName::from_static("set-cookie")));
    }
}
