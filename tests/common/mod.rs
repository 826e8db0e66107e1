//! In-process servers shared by the integration tests
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::json;
use shadowgate::forward::{ForwardConfig, HttpForwarder};
use shadowgate::guard::AccessGuard;
use shadowgate::proxy::{GatewayServer, GatewayState};
use shadowgate::relay::{RelayConfig, WebSocketRelay};
use shadowgate::routes::RouteTableHandle;
use shadowgate::session::{Credentials, SessionConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::Message;

pub const PANEL_PATH: &str = "/panel";
pub const PUBLIC_DOMAIN: &str = "vpn.example.com";
/// Dial timeout of the gateway started by [`TestGateway`]
pub const RELAY_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

fn full(body: impl Into<Bytes>) -> Full<Bytes> {
    Full::new(body.into())
}

/// Serve `handler` over HTTP/1.1 on an ephemeral port
pub async fn serve_http<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, hyper::Error>(handler(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

// ============================================================================
// Mock panel
// ============================================================================

/// Observable state of the mock panel
#[derive(Default)]
pub struct PanelState {
    pub logins: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub login_times: Mutex<Vec<Instant>>,
    /// Logins "succeed" without handing out a cookie
    pub reject_logins: AtomicBool,
    /// Bumped to invalidate every issued cookie
    epoch: AtomicU64,
    /// Body returned by an authenticated list call
    list_body: Mutex<String>,
}

impl PanelState {
    pub fn set_inbounds(&self, inbounds: &[(u16, &str)]) {
        *self.list_body.lock() = inbound_list(inbounds);
    }

    pub fn set_list_body(&self, body: &str) {
        *self.list_body.lock() = body.to_string();
    }

    pub fn expire_sessions(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn cookie(&self) -> String {
        format!("session=ok-{}", self.epoch.load(Ordering::SeqCst))
    }
}

/// Panel inventory envelope with one client per inbound
pub fn inbound_list(inbounds: &[(u16, &str)]) -> String {
    let entries: Vec<serde_json::Value> = inbounds
        .iter()
        .map(|(port, path)| {
            json!({
                "id": port,
                "port": port,
                "protocol": "vless",
                "streamSettings": json!({ "network": "ws", "wsSettings": { "path": path } }).to_string(),
                "settings": json!({ "clients": [
                    { "id": format!("00000000-0000-4000-8000-{:012}", port), "email": format!("user{}", port) }
                ] }).to_string(),
            })
        })
        .collect();
    json!({ "success": true, "msg": "", "obj": entries }).to_string()
}

pub struct MockPanel {
    pub addr: SocketAddr,
    pub state: Arc<PanelState>,
}

impl MockPanel {
    pub async fn start(inbounds: &[(u16, &str)]) -> Self {
        let state = Arc::new(PanelState::default());
        state.set_inbounds(inbounds);

        let handler_state = Arc::clone(&state);
        let addr = serve_http(move |req| {
            let state = Arc::clone(&handler_state);
            async move { panel_response(req, &state) }
        })
        .await;

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}{}", self.addr, PANEL_PATH)
    }

    pub fn session_config(&self, login_interval: Duration) -> SessionConfig {
        SessionConfig {
            base_url: self.base_url(),
            login_path: "/login".to_string(),
            credentials: Credentials {
                username: "admin".to_string(),
                password: "admin".to_string(),
            },
            login_interval,
            max_login_attempts: None,
            call_timeout: Duration::from_secs(10),
        }
    }
}

fn panel_response(req: Request<Incoming>, state: &PanelState) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();

    match (req.method(), path.strip_prefix(PANEL_PATH)) {
        (&Method::POST, Some("/login")) => {
            state.logins.fetch_add(1, Ordering::SeqCst);
            state.login_times.lock().push(Instant::now());

            if state.reject_logins.load(Ordering::SeqCst) {
                return Response::new(full(r#"{"success":false,"msg":"wrong credentials"}"#));
            }
            Response::builder()
                .header("set-cookie", format!("{}; Path=/; HttpOnly", state.cookie()))
                .body(full(r#"{"success":true}"#))
                .unwrap()
        }
        (&Method::POST, Some("/xui/inbound/list")) => {
            state.list_calls.fetch_add(1, Ordering::SeqCst);

            let authenticated = req
                .headers()
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|cookie| cookie.split("; ").any(|pair| pair == state.cookie()));

            if authenticated {
                Response::new(full(state.list_body.lock().clone()))
            } else {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(full("not logged in"))
                    .unwrap()
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("not found"))
            .unwrap(),
    }
}

// ============================================================================
// HTTP backend
// ============================================================================

/// Backend that echoes the request line, selected headers and body. Its
/// responses carry headers the gateway must not pass through verbatim.
pub async fn start_echo_backend() -> SocketAddr {
    serve_http(|req: Request<Incoming>| async move {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let accept_encoding = req
            .headers()
            .get("accept-encoding")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        let request_id = req.headers().contains_key("x-request-id");
        let body = req.into_body().collect().await.unwrap().to_bytes();

        let echo = json!({
            "method": method,
            "uri": uri,
            "accept_encoding": accept_encoding,
            "has_request_id": request_id,
            "body": String::from_utf8_lossy(&body),
        });

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .header("content-encoding", "identity")
            .header("x-backend", "echo")
            .body(full(echo.to_string()))
            .unwrap()
    })
    .await
}

// ============================================================================
// WebSocket backend
// ============================================================================

/// Counters from the WebSocket echo backend
#[derive(Default)]
pub struct WsBackendState {
    pub connections: AtomicUsize,
    pub closes_received: AtomicUsize,
    pub finished: AtomicUsize,
    pub paths: Mutex<Vec<String>>,
}

/// Echo text and binary frames. The text frame "bye" makes the backend
/// close the connection itself.
pub async fn start_ws_backend() -> (SocketAddr, Arc<WsBackendState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(WsBackendState::default());
    let server_state = Arc::clone(&state);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = Arc::clone(&server_state);
            tokio::spawn(async move {
                let path_state = Arc::clone(&state);
                let callback = move |req: &HandshakeRequest, response: HandshakeResponse| {
                    path_state.paths.lock().push(req.uri().to_string());
                    Ok(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                state.connections.fetch_add(1, Ordering::SeqCst);

                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(ref text) if text == "bye" => {
                            let _ = ws.close(None).await;
                        }
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => {
                            state.closes_received.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                }
                state.finished.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    (addr, state)
}

/// A listener that accepts TCP connections and never answers. Returns the
/// address and a count of live accepted sockets.
pub async fn start_stalled_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let open = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&open);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                // Read until the peer hangs up, never replying
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
                counter.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    (addr, open)
}

// ============================================================================
// Gateway
// ============================================================================

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: Arc<GatewayState>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl TestGateway {
    pub async fn start(table: Arc<RouteTableHandle>, guard: Option<AccessGuard>) -> Self {
        Self::start_with_timeout(table, guard, Duration::from_secs(5)).await
    }

    pub async fn start_with_timeout(
        table: Arc<RouteTableHandle>,
        guard: Option<AccessGuard>,
        request_timeout: Duration,
    ) -> Self {
        let relay = RelayConfig {
            dial_timeout: RELAY_DIAL_TIMEOUT,
            close_timeout: Duration::from_secs(2),
        };
        Self::start_with(table, guard, request_timeout, relay).await
    }

    pub async fn start_with_relay(
        table: Arc<RouteTableHandle>,
        guard: Option<AccessGuard>,
        relay: RelayConfig,
    ) -> Self {
        Self::start_with(table, guard, Duration::from_secs(5), relay).await
    }

    async fn start_with(
        table: Arc<RouteTableHandle>,
        guard: Option<AccessGuard>,
        request_timeout: Duration,
        relay: RelayConfig,
    ) -> Self {
        let state = Arc::new(GatewayState {
            table,
            guard,
            forwarder: HttpForwarder::new(ForwardConfig {
                request_timeout,
                ..ForwardConfig::default()
            }),
            relay: Arc::new(WebSocketRelay::new(relay)),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = GatewayServer::new(addr, Arc::clone(&state), shutdown_rx);
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            addr,
            state,
            shutdown_tx,
        }
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// A port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// ============================================================================
// Raw HTTP helpers
// ============================================================================

/// Send a raw HTTP/1.1 request and read the whole response
pub async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    host: &str,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr).await?;

    let mut request = format!("{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", method, path, host);
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send HTTP request with custom Host header (for proxy testing)
pub async fn http_get_with_host(
    addr: SocketAddr,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    http_request(addr, "GET", path, host, &[], "").await
}

/// Status line code of a raw response
pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

/// Header block of a raw response, lowercased
pub fn headers_of(response: &str) -> String {
    response
        .split("\r\n\r\n")
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

/// Body of a raw response
pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default()
}
