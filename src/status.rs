//! Loopback status API: health, version, routes and clients

use crate::forward::ForwardStats;
use crate::inventory::InventoryFetcher;
use crate::relay::WebSocketRelay;
use crate::routes::RouteTableHandle;
use crate::sync::SyncStatus;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// What the status endpoints report on
pub struct StatusState {
    pub sync: Arc<SyncStatus>,
    pub table: Arc<RouteTableHandle>,
    /// None in setup mode
    pub fetcher: Option<Arc<InventoryFetcher>>,
    pub relay: Arc<WebSocketRelay>,
    pub forward: Arc<ForwardStats>,
    pub max_staleness: Duration,
    /// Bearer token for `/routes` and `/clients`; open when unset
    pub token: Option<String>,
}

pub struct StatusServer {
    bind_addr: SocketAddr,
    state: Arc<StatusState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StatusServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<StatusState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Status API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_status_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Status connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept status connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Status server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_status_connection(stream: TcpStream, state: Arc<StatusState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_status_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Status connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth) == expected)
        .unwrap_or(false)
}

async fn handle_status_request(
    req: Request<Incoming>,
    state: Arc<StatusState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Status API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => health(&state),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/routes") | (&Method::GET, "/clients")
            if !check_auth(&req, state.token.as_deref()) =>
        {
            warn!(path, "Unauthorized status API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/routes") => {
            let table = state.table.snapshot();
            let routes: Vec<_> = table.entries().collect();
            let body = serde_json::json!({
                "routes": routes,
                "count": routes.len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/clients") => clients(&state).await,

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn health(state: &StatusState) -> Response<Full<Bytes>> {
    let healthy = state.sync.is_healthy(state.max_staleness);
    let body = serde_json::json!({
        "status": if healthy { "ok" } else { "stale" },
        "sync": state.sync.snapshot(),
        "max_staleness_secs": state.max_staleness.as_secs(),
        "active_relays": state.relay.active(),
        "total_relays": state.relay.total(),
        "forwarded_requests": state.forward.get_requests(),
        "forward_failures": state.forward.get_failures(),
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, body.to_string())
}

async fn clients(state: &StatusState) -> Response<Full<Bytes>> {
    let Some(fetcher) = &state.fetcher else {
        return json_response(StatusCode::OK, r#"{"clients":[],"count":0}"#);
    };

    match fetcher.fetch_clients().await {
        Ok(clients) => {
            let body = serde_json::json!({
                "count": clients.len(),
                "clients": clients,
            });
            json_response(StatusCode::OK, body.to_string())
        }
        Err(e) => {
            error!(error = %e, "Failed to load clients");
            let body = serde_json::json!({ "error": e.to_string() });
            json_response(StatusCode::SERVICE_UNAVAILABLE, body.to_string())
        }
    }
}
