//! HTTP control API for the extension.
//!
//! Serves captured events, source sync, and the unmatched-domain list on
//! the control port. Every response is JSON with permissive CORS so the
//! extension's pages can call it directly.
//!
//! ## Endpoints
//!
//! - `GET /events` - captured events plus the unmatched-domain map
//! - `POST /clear` - drop all captured events and unmatched domains
//! - `GET /sources` - current source rules
//! - `POST /sources` - replace the source rules (full sync)
//! - `GET /unmatched` - unmatched-domain map

use crate::AppState;
use anyhow::{Context, Result};
use http_body_util::BodyExt;
use hyper::{
    body::Incoming, server::conn::http1, service::service_fn, Method, Request, Response,
    StatusCode,
};
use hyper_util::rt::TokioIo;
use loggy_core::Source;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Control API server sharing state with the data plane.
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Bind the API port and serve until the task is dropped. A bind
    /// failure is fatal.
    pub async fn run(self) -> Result<()> {
        let port = self.state.settings.api_port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind API port {}", port))?;

        info!("Control API listening on http://{}", addr);

        let state = self.state;

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept API connection: {}", e);
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let state = state.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = state.clone();
                    async move { handle_request(req, state).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("API connection ended: {}", e);
                }
            });
        }
    }
}

/// Route one API request.
async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> std::result::Result<Response<String>, hyper::Error> {
    let (parts, body) = req.into_parts();

    if parts.method == Method::OPTIONS {
        return Ok(cors_preflight());
    }

    match (parts.method, parts.uri.path()) {
        (Method::GET, "/events") => {
            let events = state.events.lock().await.snapshot();
            let unmatched = state.registry.unmatched_snapshot().await;
            let count = events.len();

            Ok(json_response(
                StatusCode::OK,
                json!({
                    "events": events,
                    "count": count,
                    "unmatchedDomains": unmatched,
                }),
            ))
        }
        (Method::POST, "/clear") => {
            state.events.lock().await.clear();
            state.registry.clear_unmatched().await;
            debug!("Cleared captured events and unmatched domains");

            Ok(json_response(StatusCode::OK, json!({"success": true})))
        }
        (Method::GET, "/sources") => {
            let sources = state.registry.snapshot().await;
            Ok(json_response(
                StatusCode::OK,
                serde_json::to_value(sources).unwrap_or_else(|_| json!([])),
            ))
        }
        (Method::POST, "/sources") => {
            let body_bytes = body.collect().await?.to_bytes();

            let new_sources: Vec<Source> = match serde_json::from_slice(&body_bytes) {
                Ok(sources) => sources,
                Err(e) => {
                    return Ok(json_response(
                        StatusCode::BAD_REQUEST,
                        json!({"error": format!("Invalid JSON: {}", e)}),
                    ));
                }
            };

            let count = new_sources.len();
            state.registry.replace_all(new_sources).await;
            info!(count, "Synced sources from extension");

            Ok(json_response(
                StatusCode::OK,
                json!({"success": true, "count": count}),
            ))
        }
        (Method::GET, "/unmatched") => {
            let unmatched = state.registry.unmatched_snapshot().await;
            Ok(json_response(
                StatusCode::OK,
                serde_json::to_value(unmatched).unwrap_or_else(|_| json!({})),
            ))
        }
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            json!({"error": "Not found"}),
        )),
    }
}

/// Create a JSON response with permissive CORS headers.
fn json_response(status: StatusCode, value: serde_json::Value) -> Response<String> {
    let body = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());

    with_cors(Response::builder().status(status))
        .header("Content-Type", "application/json")
        .body(body)
        .unwrap_or_default()
}

fn cors_preflight() -> Response<String> {
    with_cors(Response::builder().status(StatusCode::OK))
        .body(String::new())
        .unwrap_or_default()
}

fn with_cors(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}
