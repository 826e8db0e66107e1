//! Authenticated session against the panel's administrative API
//!
//! The panel hands out a cookie on login and answers every other call with a
//! non-success status once that cookie is missing or expired. The
//! [`SessionManager`] hides this: [`SessionManager::call_authenticated`] keeps
//! renewing the session and retrying until the call succeeds, with at most
//! one login in flight and at least `login_interval` between two logins.

use crate::config::PanelConfig;
use crate::error::{PanelError, PanelResult};
use hyper::body::Bytes;
use parking_lot::RwLock;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A call against the panel API, relative to the panel base URL
#[derive(Debug, Clone)]
pub struct PanelRequest {
    pub method: Method,
    pub path: String,
    pub form: Vec<(String, String)>,
}

impl PanelRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            form: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            form: Vec::new(),
        }
    }

    pub fn with_form(mut self, form: Vec<(String, String)>) -> Self {
        self.form = form;
        self
    }
}

/// A fully read panel response
#[derive(Debug, Clone)]
pub struct PanelResponse {
    pub status: u16,
    pub body: Bytes,
}

impl PanelResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> PanelResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session token as seen by callers. `generation` increases on every login.
#[derive(Debug, Default)]
struct SessionToken {
    cookie: Option<String>,
    generation: u64,
}

#[derive(Debug, Default)]
struct LoginState {
    last_attempt: Option<Instant>,
}

/// Settings for a [`SessionManager`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub login_path: String,
    pub credentials: Credentials,
    pub login_interval: Duration,
    pub max_login_attempts: Option<u32>,
    pub call_timeout: Duration,
}

impl SessionConfig {
    /// Build from the panel section. Fails when credentials are absent.
    pub fn from_panel(panel: &PanelConfig) -> anyhow::Result<Self> {
        let (Some(username), Some(password)) = (&panel.username, &panel.password) else {
            anyhow::bail!("panel credentials are not configured");
        };
        Ok(Self {
            base_url: panel.base_url(),
            login_path: panel.login_path.clone(),
            credentials: Credentials {
                username: username.clone(),
                password: password.clone(),
            },
            login_interval: panel.login_interval(),
            max_login_attempts: panel.max_login_attempts,
            call_timeout: panel.call_timeout(),
        })
    }
}

/// Owns the single session with the panel
pub struct SessionManager {
    client: reqwest::Client,
    config: SessionConfig,
    token: RwLock<SessionToken>,
    /// Serializes logins; held while waiting out the login interval
    login: Mutex<LoginState>,
    login_count: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create panel HTTP client: {}", e))?;

        debug!(
            base_url = %config.base_url,
            login_interval_ms = config.login_interval.as_millis() as u64,
            max_login_attempts = ?config.max_login_attempts,
            "Panel session manager initialized"
        );

        Ok(Self {
            client,
            config,
            token: RwLock::new(SessionToken::default()),
            login: Mutex::new(LoginState::default()),
            login_count: AtomicU64::new(0),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Number of login requests sent so far
    pub fn login_count(&self) -> u64 {
        self.login_count.load(Ordering::Relaxed)
    }

    pub fn has_session(&self) -> bool {
        self.token.read().cookie.is_some()
    }

    /// Issue `request`, renewing the session and retrying until the panel
    /// answers with a success status.
    ///
    /// Bounded by the configured call timeout and, if set, by
    /// `max_login_attempts` logins performed by this call.
    pub async fn call_authenticated(&self, request: PanelRequest) -> PanelResult<PanelResponse> {
        match tokio::time::timeout(self.config.call_timeout, self.call_until_success(&request)).await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    path = %request.path,
                    timeout_secs = self.config.call_timeout.as_secs(),
                    "Panel call did not succeed before its deadline"
                );
                Err(PanelError::DeadlineExceeded)
            }
        }
    }

    async fn call_until_success(&self, request: &PanelRequest) -> PanelResult<PanelResponse> {
        let mut logins: u32 = 0;

        loop {
            let (cookie, generation) = {
                let token = self.token.read();
                (token.cookie.clone(), token.generation)
            };

            let response = self.send(request, cookie.as_deref()).await?;
            if response.is_success() {
                return Ok(response);
            }

            debug!(
                path = %request.path,
                status = response.status,
                generation,
                "Panel rejected request, renewing session"
            );

            if let Some(max) = self.config.max_login_attempts {
                if logins >= max {
                    error!(
                        path = %request.path,
                        attempts = logins,
                        "Panel keeps rejecting requests after login, giving up"
                    );
                    return Err(PanelError::LoginExhausted { attempts: logins });
                }
            }

            if self.renew(generation).await {
                logins += 1;
            }
        }
    }

    async fn send(&self, request: &PanelRequest, cookie: Option<&str>) -> PanelResult<PanelResponse> {
        let url = format!("{}{}", self.config.base_url, request.path);
        let mut builder = self.client.request(request.method.clone(), &url);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(PanelResponse { status, body })
    }

    /// Log in again unless another caller already did so since `observed`
    /// was read. Returns whether this caller sent a login request.
    async fn renew(&self, observed: u64) -> bool {
        let mut state = self.login.lock().await;

        if self.token.read().generation != observed {
            debug!("Session already renewed by another caller");
            return false;
        }

        if let Some(last) = state.last_attempt {
            let elapsed = last.elapsed();
            if elapsed < self.config.login_interval {
                let wait = self.config.login_interval - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "Waiting out login interval");
                tokio::time::sleep(wait).await;
            }
        }

        state.last_attempt = Some(Instant::now());
        self.login_count.fetch_add(1, Ordering::Relaxed);

        let cookie = self.send_login().await;
        let mut token = self.token.write();
        if cookie.is_some() {
            token.cookie = cookie;
        }
        token.generation += 1;
        true
    }

    async fn send_login(&self) -> Option<String> {
        let url = format!("{}{}", self.config.base_url, self.config.login_path);
        let form = [
            ("username", self.config.credentials.username.as_str()),
            ("password", self.config.credentials.password.as_str()),
        ];

        let response = match self.client.post(&url).form(&form).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Panel login request failed");
                return None;
            }
        };

        let status = response.status();
        let cookie = session_cookie(response.headers().get_all(SET_COOKIE).iter());
        if !status.is_success() {
            warn!(status = status.as_u16(), "Panel login returned an error status");
        } else if cookie.is_none() {
            warn!("Panel login succeeded without setting a session cookie");
        } else {
            info!(username = %self.config.credentials.username, "Logged in to panel");
        }
        cookie
    }
}

/// Collapse `Set-Cookie` values into a single `Cookie` header value
fn session_cookie<'a, I>(values: I) -> Option<String>
where
    I: Iterator<Item = &'a reqwest::header::HeaderValue>,
{
    let pairs: Vec<&str> = values
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_session_cookie_pairs() {
        let values = [
            HeaderValue::from_static("session=abc123; Path=/; HttpOnly"),
            HeaderValue::from_static("lang=en-US; Max-Age=3600"),
        ];
        assert_eq!(
            session_cookie(values.iter()).as_deref(),
            Some("session=abc123; lang=en-US")
        );
    }

    #[test]
    fn test_session_cookie_none() {
        let values = [HeaderValue::from_static("garbage")];
        assert_eq!(session_cookie(values.iter()), None);
        assert_eq!(session_cookie(std::iter::empty()), None);
    }

    #[test]
    fn test_panel_request_builders() {
        let request = PanelRequest::post("/login").with_form(vec![(
            "username".to_string(),
            "admin".to_string(),
        )]);
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.form.len(), 1);
        assert_eq!(PanelRequest::get("/x").method, Method::GET);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("admin"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_session_config_requires_credentials() {
        let panel = PanelConfig::default();
        assert!(SessionConfig::from_panel(&panel).is_err());
    }

    #[test]
    fn test_response_success_range() {
        let ok = PanelResponse { status: 204, body: Bytes::new() };
        let rejected = PanelResponse { status: 401, body: Bytes::new() };
        assert!(ok.is_success());
        assert!(!rejected.is_success());
    }
}
