//! WebSocket relay between public clients and data-plane listeners
//!
//! The client handshake is completed by the gateway before the backend is
//! dialed. The dial is bounded by `dial_timeout` and abandoned if the client
//! leaves first. Once both sides are open, text and binary frames are copied in
//! each direction until either side closes; the other side is then sent a
//! close frame and given `close_timeout` to finish.

use crate::error::not_found;
use crate::routes::RouteEntry;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Check if a request is a WebSocket upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(UPGRADE)
}

fn is_websocket_handshake<B>(req: &Request<B>) -> bool {
    let upgrade_is_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    req.method() == Method::GET
        && is_upgrade_request(req)
        && upgrade_is_websocket
        && req.headers().contains_key(SEC_WEBSOCKET_KEY)
}

/// Which side ended a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Backend,
}

impl Side {
    fn as_str(&self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Backend => "backend",
        }
    }
}

/// How one direction of a relay ended
#[derive(Debug)]
enum PumpEnd {
    /// The sender closed with (or without) a close frame
    Closed(Option<CloseFrame<'static>>),
    /// The sender vanished or misbehaved
    Dropped,
    /// The receiving side could not take the frame
    SendFailed,
}

/// Copy data frames from `from` to `to` until `from` ends
async fn pump<R, W>(from: &mut R, to: &mut W, source: Side) -> PumpEnd
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = from.next().await {
        let message = match message {
            Ok(message) => message,
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return PumpEnd::Closed(None),
            Err(e) => {
                debug!(side = source.as_str(), error = %e, "WebSocket read failed");
                return PumpEnd::Dropped;
            }
        };

        match message {
            Message::Text(_) | Message::Binary(_) => {
                if let Err(e) = to.send(message).await {
                    debug!(side = source.as_str(), error = %e, "Failed to relay frame");
                    return PumpEnd::SendFailed;
                }
            }
            // Answered locally by each connection
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => return PumpEnd::Closed(frame),
            Message::Frame(_) => {
                warn!(side = source.as_str(), "Unexpected raw frame, dropping connection");
                return PumpEnd::Dropped;
            }
        }
    }

    PumpEnd::Dropped
}

fn close_frame(code: CloseCode, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }
}

/// Decrements the active relay count when dropped
struct ActiveRelay(Arc<AtomicUsize>);

impl ActiveRelay {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveRelay {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Relay timeouts
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Max time to open the backend connection, handshake included
    pub dial_timeout: Duration,
    /// Max time spent delivering close frames when a relay ends
    pub close_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Relays upgraded client connections to listener backends
pub struct WebSocketRelay {
    config: RelayConfig,
    active: Arc<AtomicUsize>,
    total: AtomicU64,
}

impl WebSocketRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicUsize::new(0)),
            total: AtomicU64::new(0),
        }
    }

    /// Relays currently open
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Relays started since creation
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Answer the client's handshake and relay it to `route` in the
    /// background. Requests that are not WebSocket handshakes get a 404.
    pub fn handle_upgrade<B>(
        self: &Arc<Self>,
        req: Request<B>,
        route: &RouteEntry,
        request_id: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Send + 'static,
    {
        if !is_websocket_handshake(&req) {
            debug!(path = %req.uri().path(), request_id, "Not a WebSocket handshake");
            return not_found();
        }

        let accept = match req.headers().get(SEC_WEBSOCKET_KEY) {
            Some(key) => derive_accept_key(key.as_bytes()),
            None => return not_found(),
        };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let relay = Arc::clone(self);
        let route = route.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                    relay.relay(client, &route, &path_and_query, &request_id).await;
                }
                Err(e) => {
                    error!(route = %route.path_prefix, request_id, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder")
    }

    /// Dial the route's backend and relay frames until either side closes
    pub async fn relay<S>(
        &self,
        mut client: WebSocketStream<S>,
        route: &RouteEntry,
        path_and_query: &str,
        request_id: &str,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let _active = ActiveRelay::new(&self.active);
        self.total.fetch_add(1, Ordering::Relaxed);

        let url = format!("ws://{}{}", route.dial_target, path_and_query);
        let dial = tokio::time::timeout(
            self.config.dial_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        tokio::pin!(dial);

        // Frames the client sends before the backend is up
        let mut pending = Vec::new();
        let dialed = loop {
            tokio::select! {
                result = &mut dial => break result,
                message = client.next() => match message {
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => pending.push(message),
                    Some(Ok(Message::Close(_))) => {
                        debug!(route = %route.path_prefix, request_id, "Client closed during backend dial");
                        let _ = tokio::time::timeout(self.config.close_timeout, client.close(None)).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => {
                        debug!(route = %route.path_prefix, request_id, "Client left during backend dial");
                        return;
                    }
                },
            }
        };

        let mut backend = match dialed {
            Ok(Ok((backend, _))) => backend,
            Ok(Err(e)) => {
                error!(
                    route = %route.path_prefix,
                    target = %route.dial_target,
                    request_id,
                    error = %e,
                    "Failed to connect to listener backend"
                );
                self.close_client(client, CloseCode::Away, "backend unavailable").await;
                return;
            }
            Err(_) => {
                error!(
                    route = %route.path_prefix,
                    target = %route.dial_target,
                    request_id,
                    timeout_secs = self.config.dial_timeout.as_secs_f64(),
                    "Timed out connecting to listener backend"
                );
                self.close_client(client, CloseCode::Away, "backend unavailable").await;
                return;
            }
        };

        for message in pending {
            if let Err(e) = backend.send(message).await {
                warn!(route = %route.path_prefix, request_id, error = %e, "Failed to deliver early frames");
                let _ = tokio::time::timeout(self.config.close_timeout, backend.close(None)).await;
                self.close_client(client, CloseCode::Away, "backend unavailable").await;
                return;
            }
        }

        info!(route = %route.path_prefix, target = %route.dial_target, request_id, "WebSocket relay established");

        let (mut client_tx, mut client_rx) = client.split();
        let (mut backend_tx, mut backend_rx) = backend.split();

        let (ended, end) = tokio::select! {
            end = pump(&mut client_rx, &mut backend_tx, Side::Client) => (Side::Client, end),
            end = pump(&mut backend_rx, &mut client_tx, Side::Backend) => (Side::Backend, end),
        };

        // The surviving side learns how the other one left
        let frame = match end {
            PumpEnd::Closed(frame) => frame.unwrap_or_else(|| close_frame(CloseCode::Normal, "")),
            PumpEnd::Dropped | PumpEnd::SendFailed => close_frame(CloseCode::Away, "peer went away"),
        };
        debug!(
            route = %route.path_prefix,
            request_id,
            ended = ended.as_str(),
            code = u16::from(frame.code),
            "Closing WebSocket relay"
        );

        let closed = tokio::time::timeout(self.config.close_timeout, async {
            match ended {
                Side::Client => {
                    let _ = backend_tx.send(Message::Close(Some(frame))).await;
                    let _ = backend_tx.close().await;
                    let _ = client_tx.close().await;
                }
                Side::Backend => {
                    let _ = client_tx.send(Message::Close(Some(frame))).await;
                    let _ = client_tx.close().await;
                    let _ = backend_tx.close().await;
                }
            }
        })
        .await;

        if closed.is_err() {
            warn!(route = %route.path_prefix, request_id, "Timed out closing WebSocket relay");
        }
        info!(route = %route.path_prefix, request_id, ended = ended.as_str(), "WebSocket relay closed");
    }

    /// Send the client a close frame and wait briefly for its reply
    async fn close_client<S>(&self, mut client: WebSocketStream<S>, code: CloseCode, reason: &'static str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = close_frame(code, reason);
        let _ = tokio::time::timeout(self.config.close_timeout, async {
            if client.close(Some(frame)).await.is_ok() {
                // Wait for the client's reply to finish the handshake
                while let Some(Ok(_)) = client.next().await {}
            }
        })
        .await;
    }
}
