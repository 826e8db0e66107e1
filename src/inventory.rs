//! Listener and client inventory read from the panel
//!
//! The panel's inbound list is a JSON envelope whose entries carry their
//! transport and client settings as *embedded JSON strings*:
//!
//! ```json
//! { "obj": [ { "port": 10001,
//!              "streamSettings": "{\"wsSettings\":{\"path\":\"/ws-a\"}}",
//!              "settings": "{\"clients\":[{\"id\":\"…\",\"email\":\"alice\"}]}" } ] }
//! ```

use crate::error::PanelResult;
use crate::session::{PanelRequest, SessionManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Length of the uuid fragment used in a client's subscription prefix
const CLIENT_PREFIX_UUID_LEN: usize = 13;

/// One backend data-plane endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ListenerDescriptor {
    pub port: u16,
    pub path_prefix: String,
}

/// Listeners read by [`InventoryFetcher::fetch_listeners`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerInventory {
    pub listeners: Vec<ListenerDescriptor>,
    /// The panel could not be read or its response parsed; `listeners` is empty
    pub degraded: bool,
}

/// One provisioned end-client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientDescriptor {
    pub name: String,
    pub uuid: String,
    pub port: u16,
    pub path: String,
    /// Subscription path segment: `{name}-{first 13 chars of uuid}`
    pub prefix: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    obj: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    port: i64,
    stream_settings: String,
    #[serde(default)]
    settings: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamSettings {
    ws_settings: WsSettings,
}

#[derive(Debug, Deserialize)]
struct WsSettings {
    path: String,
}

#[derive(Debug, Deserialize)]
struct InboundSettings {
    #[serde(default)]
    clients: Vec<RawClient>,
}

#[derive(Debug, Deserialize)]
struct RawClient {
    id: String,
    email: String,
}

fn parse_envelope(body: &[u8]) -> PanelResult<Vec<serde_json::Value>> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    Ok(envelope.obj.unwrap_or_default())
}

fn parse_listener(value: serde_json::Value) -> Result<ListenerDescriptor, String> {
    let raw: RawInbound = serde_json::from_value(value).map_err(|e| e.to_string())?;
    listener_from_raw(&raw)
}

fn listener_from_raw(raw: &RawInbound) -> Result<ListenerDescriptor, String> {
    let port = u16::try_from(raw.port)
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| format!("port {} out of range", raw.port))?;

    let stream: StreamSettings =
        serde_json::from_str(&raw.stream_settings).map_err(|e| e.to_string())?;
    let path = stream.ws_settings.path;
    if !path.starts_with('/') {
        return Err(format!("path '{}' does not start with '/'", path));
    }

    Ok(ListenerDescriptor {
        port,
        path_prefix: path,
    })
}

/// Parse the inbound list into listener descriptors.
///
/// Malformed entries are skipped with a warning; only a response that is not
/// an envelope at all is an error.
pub fn parse_listeners(body: &[u8]) -> PanelResult<Vec<ListenerDescriptor>> {
    let entries = parse_envelope(body)?;
    let total = entries.len();

    let listeners: Vec<ListenerDescriptor> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match parse_listener(entry) {
            Ok(listener) => Some(listener),
            Err(reason) => {
                warn!(index, reason = %reason, "Failed to parse an inbound, skipping");
                None
            }
        })
        .collect();

    if listeners.len() < total {
        warn!(parsed = listeners.len(), total, "Some inbounds were skipped");
    }
    Ok(listeners)
}

/// Parse the inbound list into the clients provisioned on each inbound
pub fn parse_clients(body: &[u8]) -> PanelResult<Vec<ClientDescriptor>> {
    let entries = parse_envelope(body)?;
    let mut clients = Vec::new();

    for (index, entry) in entries.into_iter().enumerate() {
        let parsed = serde_json::from_value::<RawInbound>(entry)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                let listener = listener_from_raw(&raw)?;
                let settings: InboundSettings = match raw.settings.as_deref() {
                    Some(settings) => serde_json::from_str(settings).map_err(|e| e.to_string())?,
                    None => return Err("missing settings".to_string()),
                };
                Ok((listener, settings.clients))
            });

        let (listener, raw_clients) = match parsed {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(index, reason = %reason, "Failed to parse clients of an inbound, skipping");
                continue;
            }
        };

        clients.extend(raw_clients.into_iter().map(|client| {
            let fragment: String = client.id.chars().take(CLIENT_PREFIX_UUID_LEN).collect();
            ClientDescriptor {
                prefix: format!("{}-{}", client.email, fragment),
                name: client.email,
                uuid: client.id,
                port: listener.port,
                path: listener.path_prefix.clone(),
            }
        }));
    }

    Ok(clients)
}

/// Reads the current inventory through the session manager
pub struct InventoryFetcher {
    session: Arc<SessionManager>,
    list_path: String,
}

impl InventoryFetcher {
    pub fn new(session: Arc<SessionManager>, list_path: impl Into<String>) -> Self {
        Self {
            session,
            list_path: list_path.into(),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    async fn fetch_inbounds(&self) -> PanelResult<hyper::body::Bytes> {
        let response = self
            .session
            .call_authenticated(PanelRequest::post(&self.list_path))
            .await?;
        Ok(response.body)
    }

    /// Fetch listeners, surfacing every failure to the caller
    pub async fn try_fetch_listeners(&self) -> PanelResult<Vec<ListenerDescriptor>> {
        let body = self.fetch_inbounds().await?;
        let listeners = parse_listeners(&body)?;
        info!(count = listeners.len(), "Loaded inbounds");
        Ok(listeners)
    }

    /// Fetch listeners. An unreachable panel or an unparseable response
    /// yields an empty list; only a session that cannot be established is
    /// returned as an error.
    pub async fn fetch_listeners(&self) -> PanelResult<ListenerInventory> {
        match self.try_fetch_listeners().await {
            Ok(listeners) => Ok(ListenerInventory {
                listeners,
                degraded: false,
            }),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(critical = true, error = %e, "Failed to parse inbounds");
                Ok(ListenerInventory {
                    listeners: Vec::new(),
                    degraded: true,
                })
            }
        }
    }

    /// Fetch provisioned clients, degrading to an empty list like
    /// [`InventoryFetcher::fetch_listeners`]
    pub async fn fetch_clients(&self) -> PanelResult<Vec<ClientDescriptor>> {
        let result = self
            .fetch_inbounds()
            .await
            .and_then(|body| parse_clients(&body));
        match result {
            Ok(clients) => Ok(clients),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(error = %e, "Failed to parse clients");
                Ok(Vec::new())
            }
        }
    }
}
