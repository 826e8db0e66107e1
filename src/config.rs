use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Upstream panel (dashboard backend and administrative API)
    #[serde(default)]
    pub panel: PanelConfig,

    /// Route synchronization settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Local health/status server
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public HTTP port (default: 80)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Domain the dashboard must be reached through (matched against Host)
    pub public_domain: Option<String>,

    /// Max time to wait for the dashboard backend to respond
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Max time to open a listener backend connection
    #[serde(default = "default_relay_dial_timeout")]
    pub relay_dial_timeout_secs: u64,

    /// Max time spent delivering close frames when a relay ends
    #[serde(default = "default_relay_close_timeout")]
    pub relay_close_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_gateway_port(),
            public_domain: None,
            request_timeout_secs: default_request_timeout(),
            relay_dial_timeout_secs: default_relay_dial_timeout(),
            relay_close_timeout_secs: default_relay_close_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn relay_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_dial_timeout_secs)
    }

    pub fn relay_close_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_close_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PanelConfig {
    /// Host running the panel and all data-plane listeners
    pub host: Option<String>,

    /// Panel admin port
    pub port: Option<u16>,

    /// Dashboard path prefix (e.g. "/secret-panel").
    /// Anything not starting with '/' puts the gateway in setup mode.
    #[serde(default)]
    pub path: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Listener inventory endpoint, relative to the dashboard path
    #[serde(default = "default_inbound_list_path")]
    pub inbound_list_path: String,

    /// Login endpoint, relative to the dashboard path
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Minimum spacing between two login attempts
    #[serde(default = "default_login_interval")]
    pub login_interval_secs: u64,

    /// Give up after this many logins within one call (unbounded when unset)
    pub max_login_attempts: Option<u32>,

    /// Deadline for one authenticated call, logins included
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            path: String::new(),
            username: None,
            password: None,
            inbound_list_path: default_inbound_list_path(),
            login_path: default_login_path(),
            login_interval_secs: default_login_interval(),
            max_login_attempts: None,
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl PanelConfig {
    /// True when the dashboard path is not a mount point yet and every
    /// request goes to the panel root.
    pub fn setup_mode(&self) -> bool {
        !self.path.starts_with('/')
    }

    /// Dashboard prefix as mounted on the gateway ("" in setup mode)
    pub fn dashboard_prefix(&self) -> &str {
        if self.setup_mode() {
            ""
        } else {
            &self.path
        }
    }

    /// `host:port` of the panel's admin listener
    pub fn admin_target(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or_default(),
            self.port.unwrap_or_default()
        )
    }

    /// Base URL of the administrative API (`http://host:port/path`)
    pub fn base_url(&self) -> String {
        format!("http://{}{}", self.admin_target(), self.dashboard_prefix())
    }

    pub fn login_interval(&self) -> Duration {
        Duration::from_secs(self.login_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds between synchronization passes (0 disables the loop)
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// /health reports unhealthy once the last good pass is older than this
    #[serde(default = "default_health_max_staleness")]
    pub health_max_staleness_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            health_max_staleness_secs: default_health_max_staleness(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    pub fn health_max_staleness(&self) -> Duration {
        Duration::from_secs(self.health_max_staleness_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_status_bind")]
    pub bind: String,

    #[serde(default = "default_status_port")]
    pub port: u16,

    /// Bearer token guarding /routes and /clients
    pub token: Option<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_status_bind(),
            port: default_status_port(),
            token: None,
        }
    }
}

// Default value functions

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    80
}

fn default_request_timeout() -> u64 {
    30
}

fn default_relay_dial_timeout() -> u64 {
    10
}

fn default_relay_close_timeout() -> u64 {
    5
}

fn default_inbound_list_path() -> String {
    "/xui/inbound/list".to_string()
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_login_interval() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    60
}

fn default_sync_interval() -> u64 {
    300 // 5 minutes
}

fn default_health_max_staleness() -> u64 {
    900 // three missed passes at the default interval
}

fn default_true() -> bool {
    true
}

fn default_status_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    9090
}

/// Environment variables understood on top of the config file
pub const ENV_PROXY_HOST: &str = "PROXY_HOST";
pub const ENV_PROXY_PORT: &str = "PROXY_PORT";
pub const ENV_PROXY_PATH: &str = "PROXY_PATH";
pub const ENV_HOST_DOMAIN: &str = "HOST_DOMAIN";
pub const ENV_XUI_USERNAME: &str = "XUI_USERNAME";
pub const ENV_XUI_PASSWORD: &str = "XUI_PASSWORD";

impl Config {
    /// Load the config file (if present), apply environment overrides and
    /// validate the result.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_PROXY_HOST) {
            self.panel.host = Some(host);
        }
        if let Some(port) = lookup(ENV_PROXY_PORT) {
            let port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("{} is not a valid port: {}", ENV_PROXY_PORT, e))?;
            self.panel.port = Some(port);
        }
        if let Some(path) = lookup(ENV_PROXY_PATH) {
            self.panel.path = path;
        }
        if let Some(domain) = lookup(ENV_HOST_DOMAIN) {
            self.gateway.public_domain = Some(domain);
        }
        if let Some(username) = lookup(ENV_XUI_USERNAME) {
            self.panel.username = Some(username);
        }
        if let Some(password) = lookup(ENV_XUI_PASSWORD) {
            self.panel.password = Some(password);
        }
        Ok(())
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.panel.host.as_deref().map_or(true, str::is_empty) {
            errors.push("panel.host (PROXY_HOST) is required".to_string());
        }
        match self.panel.port {
            None => errors.push("panel.port (PROXY_PORT) is required".to_string()),
            Some(0) => errors.push("panel.port must be greater than 0".to_string()),
            Some(_) => {}
        }
        if self.gateway.port == 0 {
            errors.push("gateway.port must be greater than 0".to_string());
        }

        if !self.panel.setup_mode() {
            if self.panel.path == "/" {
                errors.push("panel.path '/' cannot be the dashboard prefix, use a sub-path such as '/panel'".to_string());
            } else if self.panel.path.ends_with('/') {
                errors.push(format!(
                    "panel.path '{}' must not end with '/'",
                    self.panel.path
                ));
            }
            if self.gateway.public_domain.as_deref().map_or(true, str::is_empty) {
                errors.push("gateway.public_domain (HOST_DOMAIN) is required".to_string());
            }
            if self.panel.username.is_none() || self.panel.password.is_none() {
                errors.push(
                    "panel.username and panel.password (XUI_USERNAME/XUI_PASSWORD) are required"
                        .to_string(),
                );
            }
        }

        if self.panel.max_login_attempts == Some(0) {
            errors.push("panel.max_login_attempts must be greater than 0 when set".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
