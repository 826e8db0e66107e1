//! HTTP forwarding to the dashboard backend
//!
//! Requests are replayed against the backend over a pooled client; the
//! backend's response is read in full and re-served with its status and
//! headers, minus the headers describing the original body framing.

use crate::error::{json_error_response, GatewayErrorCode};
use crate::routes::RouteEntry;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{
    HeaderName, ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, TE, TRANSFER_ENCODING,
    UPGRADE,
};
use hyper::http::uri::InvalidUri;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Response headers that describe the backend's body framing rather than
/// the body we re-emit
const STRIPPED_RESPONSE_HEADERS: [HeaderName; 4] =
    [CONTENT_LENGTH, CONTENT_ENCODING, TRANSFER_ENCODING, CONNECTION];

/// Request headers that belong to the inbound connection. `accept-encoding`
/// is dropped so the backend answers with an identity body.
const STRIPPED_REQUEST_HEADERS: [HeaderName; 5] =
    [CONNECTION, TRANSFER_ENCODING, TE, UPGRADE, ACCEPT_ENCODING];

/// Counters for forwarded requests
#[derive(Debug, Default)]
pub struct ForwardStats {
    pub requests: AtomicU64,
    pub failures: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Configuration for the forwarding client
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Covers sending the request and reading the whole response
    pub request_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

enum ForwardError {
    Client(hyper_util::client::legacy::Error),
    Body(hyper::Error),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Client(e) => write!(f, "Client error: {}", e),
            ForwardError::Body(e) => write!(f, "Response body error: {}", e),
        }
    }
}

/// Replays inbound requests against HTTP backends
pub struct HttpForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    stats: Arc<ForwardStats>,
    config: ForwardConfig,
}

impl HttpForwarder {
    pub fn new(config: ForwardConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            request_timeout_secs = config.request_timeout.as_secs(),
            "HTTP forwarder initialized"
        );

        Self {
            client,
            stats: Arc::new(ForwardStats::default()),
            config,
        }
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `route`'s backend. Never fails: backend problems
    /// become 5xx responses.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        route: &RouteEntry,
        request_id: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        self.stats.record_request();

        let uri = match backend_uri(&route.dial_target, req.uri()) {
            Ok(uri) => uri,
            Err(e) => {
                self.stats.record_failure();
                error!(route = %route.path_prefix, target = %route.dial_target, request_id, error = %e, "Invalid backend URI");
                return json_error_response(GatewayErrorCode::InternalError, "Invalid backend address");
            }
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                self.stats.record_failure();
                warn!(route = %route.path_prefix, request_id, error = %e, "Failed to read request body");
                return json_error_response(GatewayErrorCode::BadRequestBody, "Failed to read request body");
            }
        };

        let mut builder = Request::builder().method(parts.method).uri(uri);
        for (key, value) in parts.headers.iter() {
            if STRIPPED_REQUEST_HEADERS.contains(key) {
                continue;
            }
            builder = builder.header(key, value);
        }
        let backend_req = match builder.body(Full::new(body)) {
            Ok(r) => r,
            Err(e) => {
                self.stats.record_failure();
                error!(route = %route.path_prefix, request_id, error = %e, "Failed to build backend request");
                return json_error_response(GatewayErrorCode::InternalError, "Failed to build backend request");
            }
        };

        let result = tokio::time::timeout(self.config.request_timeout, self.send(backend_req)).await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.record_failure();
                error!(
                    route = %route.path_prefix,
                    target = %route.dial_target,
                    request_id,
                    error = %e,
                    "Failed to forward request"
                );
                json_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    format!("Failed to reach backend: {}", e),
                )
            }
            Err(_) => {
                self.stats.record_failure();
                warn!(
                    route = %route.path_prefix,
                    target = %route.dial_target,
                    request_id,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Backend request timed out"
                );
                json_error_response(
                    GatewayErrorCode::RequestTimeout,
                    format!(
                        "Backend did not respond within {} seconds",
                        self.config.request_timeout.as_secs()
                    ),
                )
            }
        }
    }

    async fn send(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let response = self.client.request(req).await.map_err(ForwardError::Client)?;
        let (mut parts, body) = response.into_parts();
        let body = body.collect().await.map_err(ForwardError::Body)?.to_bytes();

        for name in STRIPPED_RESPONSE_HEADERS.iter() {
            parts.headers.remove(name);
        }

        Ok(Response::from_parts(
            parts,
            Full::new(body).map_err(|never| match never {}).boxed(),
        ))
    }
}

/// `http://{dial_target}{path}{?query}` with the query copied verbatim
pub fn backend_uri(dial_target: &str, inbound: &Uri) -> Result<Uri, InvalidUri> {
    let path_and_query = inbound.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://{}{}", dial_target, path_and_query).parse::<Uri>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_uri_keeps_path_and_query() {
        let inbound: Uri = "/panel/xui/inbounds?a=1&b=2".parse().unwrap();
        let uri = backend_uri("10.0.0.2:54321", &inbound).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.2:54321/panel/xui/inbounds?a=1&b=2");
        assert_eq!(uri.query(), Some("a=1&b=2"));
    }

    #[test]
    fn test_backend_uri_from_absolute_form() {
        let inbound: Uri = "http://vpn.example.com/panel/?x=%20y".parse().unwrap();
        let uri = backend_uri("backend:80", &inbound).unwrap();
        assert_eq!(uri.to_string(), "http://backend:80/panel/?x=%20y");
    }

    #[test]
    fn test_backend_uri_rejects_bad_target() {
        let inbound: Uri = "/".parse().unwrap();
        assert!(backend_uri("bad host", &inbound).is_err());
    }

    #[test]
    fn test_forward_stats() {
        let stats = ForwardStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_requests(), 2);
        assert_eq!(stats.get_failures(), 1);
    }

    #[test]
    fn test_forward_config_default() {
        let config = ForwardConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder = HttpForwarder::new(ForwardConfig::default());
        let route = RouteEntry::dashboard("/panel", format!("127.0.0.1:{}", port), true);
        let req = Request::builder()
            .uri("/panel/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = forwarder.forward(req, &route, "test").await;
        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
        assert_eq!(forwarder.stats().get_failures(), 1);
    }
}
