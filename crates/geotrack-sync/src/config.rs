//! # Tracker Configuration
//!
//! Configuration for the whole tracker: motion tuning, HTTP delivery,
//! retention, geofencing and schedule.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     GEOTRACK_URL=https://example.com/locations                         │
//! │     GEOTRACK_DESIRED_ACCURACY=50                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tracker/tracker.toml (Linux)                             │
//! │     ~/Library/Application Support/com.geotrack.tracker/tracker.toml   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [geolocation]
//! desired_accuracy = 10.0
//! distance_filter = 50.0
//!
//! [http]
//! url = "https://example.com/locations"
//! auto_sync_threshold = 5
//!
//! [http.headers]
//! X-Device = "van-12"
//!
//! [app]
//! schedule = ["2-6 09:00-17:00", "7 10:00-14:00 geofence"]
//!
//! [authorization]
//! strategy = "JWT"
//! access_token = "eyJhbGciOi..."
//! refresh_url = "https://example.com/oauth/token"
//! ```
//!
//! ## Change Detection
//! A new configuration is compared with the running one field by field
//! ([`TrackerConfig::diff`]); the tracker reacts to each [`ConfigChange`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use geotrack_core::motion::MotionSettings;
use geotrack_core::schedule::Schedule;
use geotrack_core::Extras;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::authorization::AuthorizationConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// HTTP Method
// =============================================================================

/// HTTP verb used to deliver locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
        }
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown HTTP method: '{}'. Valid options: POST, PUT",
                other
            ))),
        }
    }
}

// =============================================================================
// Geolocation
// =============================================================================

/// Position filtering and motion detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeolocationConfig {
    /// Fixes less accurate than this (meters, elasticity-scaled) are rejected.
    #[serde(default = "default_desired_accuracy")]
    pub desired_accuracy: f64,

    /// Minimum distance (meters) between recorded locations while moving.
    #[serde(default = "default_distance_filter")]
    pub distance_filter: f64,

    /// Radius (meters) the entity must leave to be considered moving.
    /// Never less than 25.
    #[serde(default = "default_stationary_radius")]
    pub stationary_radius: f64,

    /// Time without displacement before MOVING turns STATIONARY.
    /// Clamped to 60-300 seconds.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default)]
    pub disable_elasticity: bool,

    #[serde(default = "default_elasticity_multiplier")]
    pub elasticity_multiplier: f64,

    #[serde(default)]
    pub allow_identical_locations: bool,

    /// Consecutive inaccurate fixes dropped before one is let through.
    #[serde(default = "default_max_rejected_fixes")]
    pub max_rejected_fixes: u32,
}

fn default_desired_accuracy() -> f64 {
    100.0
}
fn default_distance_filter() -> f64 {
    10.0
}
fn default_stationary_radius() -> f64 {
    25.0
}
fn default_stop_timeout() -> u64 {
    300
}
fn default_elasticity_multiplier() -> f64 {
    1.0
}
fn default_max_rejected_fixes() -> u32 {
    3
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        GeolocationConfig {
            desired_accuracy: default_desired_accuracy(),
            distance_filter: default_distance_filter(),
            stationary_radius: default_stationary_radius(),
            stop_timeout_secs: default_stop_timeout(),
            disable_elasticity: false,
            elasticity_multiplier: default_elasticity_multiplier(),
            allow_identical_locations: false,
            max_rejected_fixes: default_max_rejected_fixes(),
        }
    }
}

// =============================================================================
// Activity Recognition
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Activity samples below this confidence (0-100) are ignored.
    #[serde(default = "default_min_activity_confidence")]
    pub min_activity_confidence: u8,
}

fn default_min_activity_confidence() -> u8 {
    75
}

impl Default for ActivityConfig {
    fn default() -> Self {
        ActivityConfig {
            min_activity_confidence: default_min_activity_confidence(),
        }
    }
}

// =============================================================================
// HTTP Delivery
// =============================================================================

/// Delivery of stored records to the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Endpoint receiving locations. Empty disables sync.
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub method: HttpMethod,

    /// Sync automatically after each persisted record.
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Minimum number of unlocked records before an automatic sync
    /// (0 = any record).
    #[serde(default)]
    pub auto_sync_threshold: u32,

    /// Send records together as `{"locations": [...]}`; otherwise one
    /// request per record.
    #[serde(default = "default_true")]
    pub batch_sync: bool,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,

    /// Per-request timeout (seconds).
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Merged into the root of every request body.
    #[serde(default)]
    pub params: Extras,

    /// Merged into every persisted record.
    #[serde(default)]
    pub extras: Extras,

    /// First retry delay after a retryable failure (seconds).
    #[serde(default = "default_retry_initial")]
    pub retry_initial_secs: u64,

    /// Upper bound of the retry delay (seconds).
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_batch_size() -> u32 {
    250
}
fn default_http_timeout() -> u64 {
    60
}
fn default_retry_initial() -> u64 {
    5
}
fn default_retry_max() -> u64 {
    600
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            url: String::new(),
            method: HttpMethod::default(),
            auto_sync: true,
            auto_sync_threshold: 0,
            batch_sync: true,
            max_batch_size: default_max_batch_size(),
            http_timeout_secs: default_http_timeout(),
            headers: BTreeMap::new(),
            params: Extras::new(),
            extras: Extras::new(),
            retry_initial_secs: default_retry_initial(),
            retry_max_secs: default_retry_max(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Sync is possible at all.
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

// =============================================================================
// Persistence
// =============================================================================

/// Retention of the Event Store. Values ≤ 0 disable the limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_max_days")]
    pub max_days_to_persist: i64,

    #[serde(default = "default_max_records")]
    pub max_records_to_persist: i64,
}

fn default_max_days() -> i64 {
    1
}
fn default_max_records() -> i64 {
    10_000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            max_days_to_persist: default_max_days(),
            max_records_to_persist: default_max_records(),
        }
    }
}

// =============================================================================
// Geofencing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceConfig {
    /// Radius (meters) of the implicit proximity region used when more
    /// regions are registered than the platform can monitor.
    #[serde(default = "default_proximity_radius")]
    pub proximity_radius: f64,

    /// Emit ENTER when the first evaluation of a region finds the
    /// location already inside.
    #[serde(default = "default_true")]
    pub initial_trigger_entry: bool,

    /// Platform cap on concurrently monitored regions (0 = no cap).
    #[serde(default = "default_max_monitored_regions")]
    pub max_monitored_regions: usize,
}

fn default_proximity_radius() -> f64 {
    1_000.0
}
fn default_max_monitored_regions() -> usize {
    20
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        GeofenceConfig {
            proximity_radius: default_proximity_radius(),
            initial_trigger_entry: true,
            max_monitored_regions: default_max_monitored_regions(),
        }
    }
}

// =============================================================================
// Application
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Schedule entries, e.g. `"2-6 09:00-17:00"` or
    /// `"2026-03-01-08:00 2026-03-01-18:00 geofence"`.
    #[serde(default)]
    pub schedule: Vec<String>,

    /// Heartbeat period while tracking (seconds, 0 disables).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            schedule: Vec::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl AppConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

// =============================================================================
// Config Diff
// =============================================================================

/// One field that differs between two configurations.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    /// `section.field`, e.g. `http.url`.
    pub field: String,
    pub old: Value,
    pub new: Value,
}

impl ConfigChange {
    /// True when the change touches the given section.
    pub fn in_section(&self, section: &str) -> bool {
        self.field == section || self.field.starts_with(&format!("{section}."))
    }
}

// =============================================================================
// Main Tracker Configuration
// =============================================================================

/// Complete tracker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub geolocation: GeolocationConfig,

    #[serde(default)]
    pub activity: ActivityConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub geofence: GeofenceConfig,

    #[serde(default)]
    pub app: AppConfig,

    /// Token-based authorization of sync requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationConfig>,
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tracker.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading tracker config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::config_file(&path, e))?;
                config = toml::from_str(&contents).map_err(|e| SyncError::config_file(&path, e))?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load tracker config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::InvalidConfig("no config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::config_file(parent, e))?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| SyncError::config_file(&path, e))?;
        std::fs::write(&path, contents).map_err(|e| SyncError::config_file(&path, e))?;

        info!(?path, "Tracker config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.http.is_enabled() {
            let parsed = url::Url::parse(self.http.url.trim())?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "URL must start with http:// or https://, got: {}",
                    self.http.url
                )));
            }
        }

        if self.http.max_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "max_batch_size must be greater than 0".into(),
            ));
        }

        if self.geolocation.desired_accuracy <= 0.0 {
            return Err(SyncError::InvalidConfig(
                "desired_accuracy must be greater than 0".into(),
            ));
        }

        if self.geolocation.elasticity_multiplier < 0.0 {
            return Err(SyncError::InvalidConfig(
                "elasticity_multiplier must not be negative".into(),
            ));
        }

        if self.geofence.proximity_radius <= 0.0 {
            return Err(SyncError::InvalidConfig(
                "proximity_radius must be greater than 0".into(),
            ));
        }

        Schedule::parse(&self.app.schedule)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        if let Some(auth) = &self.authorization {
            auth.validate()?;
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("GEOTRACK_URL") {
            debug!(url = %url, "Overriding sync URL from environment");
            self.http.url = url;
        }

        if let Ok(method) = std::env::var("GEOTRACK_HTTP_METHOD") {
            match method.parse() {
                Ok(parsed) => self.http.method = parsed,
                Err(_) => warn!(method = %method, "Unknown HTTP method in environment"),
            }
        }

        if let Ok(value) = std::env::var("GEOTRACK_AUTO_SYNC") {
            self.http.auto_sync = value != "false" && value != "0";
        }

        if let Ok(value) = std::env::var("GEOTRACK_BATCH_SYNC") {
            self.http.batch_sync = value != "false" && value != "0";
        }

        if let Ok(value) = std::env::var("GEOTRACK_MAX_BATCH_SIZE") {
            if let Ok(size) = value.parse::<u32>() {
                self.http.max_batch_size = size;
            }
        }

        if let Ok(value) = std::env::var("GEOTRACK_DESIRED_ACCURACY") {
            if let Ok(accuracy) = value.parse::<f64>() {
                debug!(accuracy, "Overriding desired accuracy from environment");
                self.geolocation.desired_accuracy = accuracy;
            }
        }

        if let Ok(value) = std::env::var("GEOTRACK_DISTANCE_FILTER") {
            if let Ok(filter) = value.parse::<f64>() {
                self.geolocation.distance_filter = filter;
            }
        }

        if let Ok(token) = std::env::var("GEOTRACK_ACCESS_TOKEN") {
            debug!("Overriding access token from environment");
            self.authorization
                .get_or_insert_with(AuthorizationConfig::default)
                .access_token = token;
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "geotrack", "tracker")
            .map(|dirs| dirs.config_dir().join("tracker.toml"))
    }

    // =========================================================================
    // Change Detection
    // =========================================================================

    /// Fields of `other` that differ from `self`, as `section.field`
    /// paths in declaration order.
    pub fn diff(&self, other: &TrackerConfig) -> Vec<ConfigChange> {
        let old = flatten(serde_json::to_value(self).unwrap_or(Value::Null));
        let new = flatten(serde_json::to_value(other).unwrap_or(Value::Null));

        let mut fields: Vec<&String> = old.keys().chain(new.keys()).collect();
        fields.sort();
        fields.dedup();

        fields
            .into_iter()
            .filter_map(|field| {
                let before = old.get(field).cloned().unwrap_or(Value::Null);
                let after = new.get(field).cloned().unwrap_or(Value::Null);
                (before != after).then(|| ConfigChange {
                    field: field.clone(),
                    old: before,
                    new: after,
                })
            })
            .collect()
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Settings for the motion tracker.
    pub fn motion_settings(&self) -> MotionSettings {
        let geo = &self.geolocation;
        MotionSettings {
            desired_accuracy: geo.desired_accuracy,
            distance_filter: geo.distance_filter,
            stationary_radius: geo.stationary_radius,
            stop_timeout: Duration::from_secs(geo.stop_timeout_secs),
            disable_elasticity: geo.disable_elasticity,
            elasticity_multiplier: geo.elasticity_multiplier,
            allow_identical_locations: geo.allow_identical_locations,
            max_rejected_fixes: geo.max_rejected_fixes,
            min_activity_confidence: self.activity.min_activity_confidence,
        }
    }

    /// Parsed schedule (entries were checked by `validate`).
    pub fn schedule(&self) -> SyncResult<Schedule> {
        Schedule::parse(&self.app.schedule).map_err(|e| SyncError::InvalidConfig(e.to_string()))
    }
}

/// `{section: {field: v}}` → `{"section.field": v}`. The optional
/// authorization table is compared as a single value.
fn flatten(value: Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Value::Object(sections) = value {
        for (section, body) in sections {
            match body {
                Value::Object(fields) if section != "authorization" => {
                    for (field, v) in fields {
                        out.insert(format!("{section}.{field}"), v);
                    }
                }
                other => {
                    out.insert(section, other);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.geolocation.desired_accuracy, 100.0);
        assert_eq!(config.geolocation.stop_timeout_secs, 300);
        assert_eq!(config.http.max_batch_size, 250);
        assert_eq!(config.http.http_timeout_secs, 60);
        assert!(config.http.auto_sync);
        assert!(config.http.batch_sync);
        assert_eq!(config.persistence.max_records_to_persist, 10_000);
        assert_eq!(config.geofence.max_monitored_regions, 20);
        assert!(!config.http.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!("PUT".parse::<HttpMethod>().unwrap(), HttpMethod::Put);
        assert!("PATCH".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrackerConfig::default();

        config.http.url = "ftp://example.com".into();
        assert!(config.validate().unwrap_err().is_config_error());

        config.http.url = "not a url".into();
        assert!(config.validate().is_err());

        config.http.url = "https://example.com/locations".into();
        assert!(config.validate().is_ok());

        config.http.max_batch_size = 0;
        assert!(config.validate().is_err());
        config.http.max_batch_size = 100;

        config.geolocation.desired_accuracy = 0.0;
        assert!(config.validate().is_err());
        config.geolocation.desired_accuracy = 10.0;

        config.geolocation.elasticity_multiplier = -1.0;
        assert!(config.validate().is_err());
        config.geolocation.elasticity_multiplier = 2.0;

        config.app.schedule = vec!["9 25:00-26:00".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_method_in_toml_is_rejected() {
        let parsed: Result<TrackerConfig, _> = toml::from_str("[http]\nmethod = \"DELETE\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TrackerConfig = toml::from_str(
            r#"
            [geolocation]
            distance_filter = 50.0

            [http]
            url = "https://example.com/locations"

            [http.headers]
            X-Device = "van-12"
            "#,
        )
        .unwrap();

        assert_eq!(config.geolocation.distance_filter, 50.0);
        assert_eq!(config.geolocation.desired_accuracy, 100.0);
        assert_eq!(config.http.headers["X-Device"], "van-12");
        assert!(config.authorization.is_none());
    }

    #[test]
    fn test_diff_reports_each_changed_field() {
        let old = TrackerConfig::default();
        let mut new = old.clone();
        new.http.url = "https://example.com".into();
        new.geolocation.distance_filter = 30.0;

        let changes = old.diff(&new);
        let fields: Vec<_> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["geolocation.distance_filter", "http.url"]);
        assert_eq!(changes[1].old, json!(""));
        assert_eq!(changes[1].new, json!("https://example.com"));
        assert!(changes[1].in_section("http"));
        assert!(old.diff(&old.clone()).is_empty());
    }

    #[test]
    fn test_diff_sees_authorization_added() {
        let old = TrackerConfig::default();
        let mut new = old.clone();
        new.authorization = Some(AuthorizationConfig::default());

        let changes = old.diff(&new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "authorization");
    }

    #[test]
    fn test_motion_settings_mapping() {
        let mut config = TrackerConfig::default();
        config.geolocation.stop_timeout_secs = 120;
        config.activity.min_activity_confidence = 50;

        let settings = config.motion_settings();
        assert_eq!(settings.stop_timeout, Duration::from_secs(120));
        assert_eq!(settings.min_activity_confidence, 50);
    }

    #[test]
    #[serial]
    fn test_save_and_load_with_env_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tracker.toml");

        let mut config = TrackerConfig::default();
        config.http.url = "https://example.com/a".into();
        config.app.schedule = vec!["1-7 08:00-18:00".into()];
        config.save(Some(path.clone())).unwrap();

        std::env::set_var("GEOTRACK_DESIRED_ACCURACY", "25");
        let loaded = TrackerConfig::load(Some(path));
        std::env::remove_var("GEOTRACK_DESIRED_ACCURACY");

        let loaded = loaded.unwrap();
        assert_eq!(loaded.http.url, "https://example.com/a");
        assert_eq!(loaded.app.schedule, vec!["1-7 08:00-18:00".to_string()]);
        assert_eq!(loaded.geolocation.desired_accuracy, 25.0);
    }

    #[test]
    #[serial]
    fn test_load_or_default_on_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tracker.toml");
        std::fs::write(&path, "[http]\nmax_batch_size = 0\n").unwrap();

        let config = TrackerConfig::load_or_default(Some(path));
        assert_eq!(config, TrackerConfig::default());
    }
}
