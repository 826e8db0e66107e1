//! Public gateway server: route lookup and dispatch
//!
//! Every request is resolved against one snapshot of the routing table.
//! Dashboard routes are forwarded over HTTP behind the [`AccessGuard`];
//! listener routes only accept WebSocket upgrades. Anything else is a 404.

use crate::error::not_found;
use crate::forward::HttpForwarder;
use crate::guard::AccessGuard;
use crate::relay::{is_upgrade_request, WebSocketRelay};
use crate::routes::{RouteKind, RouteTableHandle};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Everything a request handler needs, shared across connections
pub struct GatewayState {
    pub table: Arc<RouteTableHandle>,
    /// None in setup mode
    pub guard: Option<AccessGuard>,
    pub forwarder: HttpForwarder,
    pub relay: Arc<WebSocketRelay>,
}

/// The public-facing gateway
pub struct GatewayServer {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<GatewayState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(handle_request(req, state, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Add the client address to `x-forwarded-for`, keeping any earlier hops
fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let client_ip = client_ip.to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing.trim(), client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    append_forwarded_for(headers, client_addr.ip());

    let table = state.table.snapshot();
    let Some(route) = table.resolve(req.uri().path()) else {
        debug!(path = %req.uri().path(), request_id, "No route");
        return not_found();
    };

    if route.guarded {
        if let Some(guard) = &state.guard {
            if !guard.admits(&req) {
                debug!(
                    path = %req.uri().path(),
                    host = ?req.headers().get(hyper::header::HOST),
                    request_id,
                    "Host does not match the public domain"
                );
                return not_found();
            }
        }
    }

    debug!(
        method = %req.method(),
        uri = %req.uri(),
        route = %route.path_prefix,
        request_id,
        "Incoming request"
    );

    match (route.kind, is_upgrade_request(&req)) {
        (RouteKind::Http, false) => state.forwarder.forward(req, route, &request_id).await,
        (RouteKind::WebSocket, true) => state.relay.handle_upgrade(req, route, &request_id),
        (kind, upgrade) => {
            debug!(route = %route.path_prefix, ?kind, upgrade, request_id, "Route does not serve this request");
            not_found()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    #[test]
    fn test_forwarded_for_is_set() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, CLIENT);
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
    }

    #[test]
    fn test_forwarded_for_keeps_earlier_hops() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.1, 10.0.0.1"));
        append_forwarded_for(&mut headers, CLIENT);
        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "198.51.100.1, 10.0.0.1, 203.0.113.7"
        );
    }

    #[test]
    fn test_blank_forwarded_for_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static(" "));
        append_forwarded_for(&mut headers, CLIENT);
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
    }
}
