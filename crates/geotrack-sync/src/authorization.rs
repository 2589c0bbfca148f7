//! # Authorization
//!
//! Token authorization of sync requests, with refresh against a
//! configurable token endpoint.
//!
//! ## Refresh Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Token Refresh Flow                                 │
//! │                                                                         │
//! │  ┌────────────────┐                          ┌─────────────────┐       │
//! │  │ SyncDispatcher │                          │  refresh_url    │       │
//! │  └───────┬────────┘                          └────────┬────────┘       │
//! │          │                                            │                 │
//! │          │  token expired, or server said 401/403     │                 │
//! │          │                                            │                 │
//! │          │  POST form: refresh_payload                │                 │
//! │          │    ({refreshToken} substituted)            │                 │
//! │          │  headers: refresh_headers                  │                 │
//! │          │    ({accessToken} substituted)             │                 │
//! │          │───────────────────────────────────────────►│                 │
//! │          │                                            │                 │
//! │          │  JSON body, searched recursively:          │                 │
//! │          │    access* | auth* | id_token*  → access   │                 │
//! │          │    renew* | refresh*            → refresh  │                 │
//! │          │    expir*                       → expires  │                 │
//! │          │◄───────────────────────────────────────────│                 │
//! │          │                                            │                 │
//! │          ▼                                                              │
//! │  "authorization" event { success, response | error }                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use geotrack_core::events::AuthorizationEvent;
use geotrack_core::{EventBus, TrackerEvent};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Placeholder replaced by the current refresh token in the payload.
pub const REFRESH_TOKEN_PLACEHOLDER: &str = "{refreshToken}";

/// Placeholder replaced by the current access token in refresh headers.
pub const ACCESS_TOKEN_PLACEHOLDER: &str = "{accessToken}";

/// `expires` values below this are seconds from now, not a timestamp.
const RELATIVE_EXPIRY_LIMIT: i64 = 1_000_000_000;

// =============================================================================
// Configuration
// =============================================================================

/// How the access token is placed in the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthorizationStrategy {
    /// `Authorization: Bearer <token>`
    #[default]
    Jwt,
    /// `Authorization: <token>`
    Sas,
}

/// The `[authorization]` table.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub strategy: AuthorizationStrategy,

    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    #[serde(default)]
    pub refresh_url: String,

    /// Form fields posted to `refresh_url`.
    #[serde(default)]
    pub refresh_payload: BTreeMap<String, String>,

    #[serde(default = "default_refresh_headers")]
    pub refresh_headers: BTreeMap<String, String>,

    /// Access token expiry (unix seconds), -1 when unknown.
    #[serde(default = "default_expires")]
    pub expires: i64,
}

fn default_refresh_headers() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "Authorization".to_string(),
        format!("Bearer {ACCESS_TOKEN_PLACEHOLDER}"),
    )])
}

fn default_expires() -> i64 {
    -1
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        AuthorizationConfig {
            strategy: AuthorizationStrategy::default(),
            access_token: String::new(),
            refresh_token: String::new(),
            refresh_url: String::new(),
            refresh_payload: BTreeMap::new(),
            refresh_headers: default_refresh_headers(),
            expires: default_expires(),
        }
    }
}

/// First five characters then `<redacted>`.
pub fn redact(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    let prefix: String = token.chars().take(5).collect();
    format!("{prefix}<redacted>")
}

impl fmt::Debug for AuthorizationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationConfig")
            .field("strategy", &self.strategy)
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("refresh_url", &self.refresh_url)
            .field("refresh_payload", &self.refresh_payload.keys().collect::<Vec<_>>())
            .field("expires", &self.expires)
            .finish()
    }
}

impl AuthorizationConfig {
    pub fn validate(&self) -> SyncResult<()> {
        if !self.refresh_url.is_empty() {
            let parsed = url::Url::parse(&self.refresh_url)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "refresh_url must be http(s), got: {}",
                    self.refresh_url
                )));
            }
        }
        Ok(())
    }

    /// Refresh needs an endpoint, a refresh token and something to post.
    pub fn can_refresh(&self) -> bool {
        !self.refresh_url.is_empty()
            && !self.refresh_token.is_empty()
            && !self.refresh_payload.is_empty()
    }

    /// Known expiry that has passed.
    pub fn is_expired(&self, now_secs: i64) -> bool {
        self.expires > 0 && now_secs >= self.expires
    }

    /// Value of the `Authorization` header, if there is a token.
    pub fn header_value(&self) -> Option<String> {
        if self.access_token.is_empty() {
            return None;
        }
        Some(match self.strategy {
            AuthorizationStrategy::Jwt => format!("Bearer {}", self.access_token),
            AuthorizationStrategy::Sas => self.access_token.clone(),
        })
    }

    /// Form body for the refresh request.
    pub fn refresh_form(&self) -> BTreeMap<String, String> {
        self.refresh_payload
            .iter()
            .map(|(k, v)| (k.clone(), v.replace(REFRESH_TOKEN_PLACEHOLDER, &self.refresh_token)))
            .collect()
    }

    /// Headers for the refresh request.
    pub fn refresh_request_headers(&self) -> BTreeMap<String, String> {
        self.refresh_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.replace(ACCESS_TOKEN_PLACEHOLDER, &self.access_token)))
            .collect()
    }

    /// Takes the tokens found in a refresh response. Returns false when no
    /// access token was found; nothing is changed in that case.
    pub fn apply_refresh_response(&mut self, response: &Value, now_secs: i64) -> bool {
        let mut found = FoundTokens::default();
        search_tokens(response, &mut found);

        let Some(access) = found.access else {
            return false;
        };
        self.access_token = access;
        if let Some(refresh) = found.refresh {
            self.refresh_token = refresh;
        }
        self.expires = match found.expires {
            Some(e) if e < RELATIVE_EXPIRY_LIMIT => now_secs + e,
            Some(e) => e,
            None => -1,
        };
        true
    }

    /// JSON view with tokens redacted.
    pub fn to_redacted_json(&self) -> Value {
        json!({
            "strategy": self.strategy,
            "access_token": redact(&self.access_token),
            "refresh_token": redact(&self.refresh_token),
            "refresh_url": self.refresh_url,
            "expires": self.expires,
        })
    }
}

#[derive(Default)]
struct FoundTokens {
    access: Option<String>,
    refresh: Option<String>,
    expires: Option<i64>,
}

/// Depth-first search; the first match of each kind wins.
fn search_tokens(value: &Value, found: &mut FoundTokens) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                let key = key.to_lowercase();
                match v {
                    Value::String(s)
                        if found.access.is_none()
                            && (key.starts_with("access")
                                || key.starts_with("auth")
                                || key.starts_with("id_token")) =>
                    {
                        found.access = Some(s.clone());
                    }
                    Value::String(s)
                        if found.refresh.is_none()
                            && (key.starts_with("renew") || key.starts_with("refresh")) =>
                    {
                        found.refresh = Some(s.clone());
                    }
                    Value::Number(n) if found.expires.is_none() && key.starts_with("expir") => {
                        found.expires = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64));
                    }
                    Value::String(s) if found.expires.is_none() && key.starts_with("expir") => {
                        found.expires = s.parse().ok();
                    }
                    Value::Object(_) | Value::Array(_) => search_tokens(v, found),
                    _ => {}
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| search_tokens(item, found)),
        _ => {}
    }
}

// =============================================================================
// Provider Trait
// =============================================================================

/// Authorization collaborator of the sync dispatcher.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Adds authorization headers to an outgoing request.
    async fn apply_headers(&self, request: RequestBuilder) -> RequestBuilder;

    /// True when the token should be refreshed before sending.
    async fn needs_refresh(&self) -> bool {
        false
    }

    /// Obtains a new access token.
    async fn refresh(&self) -> SyncResult<()>;
}

// =============================================================================
// Token Authorization
// =============================================================================

/// Config-driven [`AuthorizationProvider`].
pub struct TokenAuthorization {
    config: RwLock<AuthorizationConfig>,
    client: Client,
    events: Arc<EventBus>,
}

impl TokenAuthorization {
    pub fn new(config: AuthorizationConfig, client: Client, events: Arc<EventBus>) -> Self {
        TokenAuthorization {
            config: RwLock::new(config),
            client,
            events,
        }
    }

    /// Current configuration, including refreshed tokens.
    pub async fn config(&self) -> AuthorizationConfig {
        self.config.read().await.clone()
    }

    /// Replaces the configuration (host pushed new tokens).
    pub async fn update(&self, config: AuthorizationConfig) {
        debug!(config = ?config, "Authorization updated");
        *self.config.write().await = config;
    }

    fn emit(&self, success: bool, response: Option<Value>, error: Option<String>) {
        self.events
            .emit(&TrackerEvent::Authorization(AuthorizationEvent {
                success,
                response,
                error,
            }));
    }

    fn fail(&self, message: String) -> SyncError {
        warn!(error = %message, "Authorization refresh failed");
        self.emit(false, None, Some(message.clone()));
        SyncError::Authorization(message)
    }
}

impl fmt::Debug for TokenAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthorization").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthorizationProvider for TokenAuthorization {
    async fn apply_headers(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.read().await.header_value() {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        }
    }

    async fn needs_refresh(&self) -> bool {
        let config = self.config.read().await;
        config.can_refresh() && config.is_expired(Utc::now().timestamp())
    }

    async fn refresh(&self) -> SyncResult<()> {
        let snapshot = self.config.read().await.clone();
        if !snapshot.can_refresh() {
            return Err(self.fail("refresh is not configured".into()));
        }

        info!(url = %snapshot.refresh_url, "Refreshing access token");

        let mut request = self
            .client
            .post(&snapshot.refresh_url)
            .form(&snapshot.refresh_form());
        for (name, value) in snapshot.refresh_request_headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.fail(format!("refresh request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(self.fail(format!("refresh returned HTTP {}: {}", status.as_u16(), body)));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| self.fail(format!("refresh response is not JSON: {e}")))?;

        {
            let mut config = self.config.write().await;
            if !config.apply_refresh_response(&parsed, Utc::now().timestamp()) {
                drop(config);
                return Err(self.fail("refresh response carries no access token".into()));
            }
            debug!(access_token = %redact(&config.access_token), expires = config.expires, "Access token refreshed");
        }

        self.emit(true, Some(parsed), None);
        Ok(())
    }
}
