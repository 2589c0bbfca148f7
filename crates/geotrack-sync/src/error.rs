//! # Sync Errors
//!
//! ```text
//!   config ──────── InvalidConfig  InvalidUrl  ConfigFile{path}
//!   transport ───── NoConnection  Network
//!   server ──────── HttpResponse{status}  Authorization
//!   event store ─── Storage(DbError)  SerializationFailed
//!   lifecycle ───── ShuttingDown
//! ```
//!
//! Every failure path of a flush leaves the batch unlocked before the
//! error is returned, so the caller only decides *when* to retry.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use geotrack_db::DbError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A value `TrackerConfig::validate` refused.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Reading, parsing or writing `tracker.toml`.
    #[error("Config file {}: {reason}", path.display())]
    ConfigFile { path: PathBuf, reason: String },

    /// The connectivity probe reports no network. Records are untouched.
    #[error("No network connection")]
    NoConnection,

    /// Timeout, DNS failure, connection reset.
    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response other than an authorization failure.
    #[error("HTTP {status}: {body}")]
    HttpResponse { status: u16, body: String },

    /// Token refresh failed or the server rejected the refreshed token.
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// The Event Store could not lock, unlock or delete the batch.
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    /// Request body could not be built or a refresh response decoded.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The agent task is gone; the request was never processed.
    #[error("Sync agent is shutting down")]
    ShuttingDown,
}

impl SyncError {
    pub fn config_file(path: &Path, reason: impl Display) -> Self {
        SyncError::ConfigFile {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// A later attempt with the same configuration may succeed: transport
    /// failures, 5xx, 408, 429 and a busy Event Store.
    ///
    /// Offline is deliberately absent, the agent waits for connectivity
    /// instead. So is `Authorization`, which pauses sync until the host
    /// sets a new token.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Storage(e) => e.is_transient(),
            SyncError::HttpResponse { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_) | SyncError::InvalidUrl(_) | SyncError::ConfigFile { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::HttpResponse { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

/// Builder failures are configuration mistakes (bad header value, bad
/// URL); everything else happened on the wire.
impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            SyncError::InvalidConfig(err.to_string())
        } else if err.is_decode() {
            SyncError::SerializationFailed(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> SyncError {
        SyncError::HttpResponse {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn test_what_is_retried() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(http(503).is_retryable());
        assert!(http(429).is_retryable());
        assert!(SyncError::Storage(DbError::Busy).is_retryable());

        assert!(!http(400).is_retryable());
        assert!(!SyncError::Authorization("expired".into()).is_retryable());
        assert!(!SyncError::NoConnection.is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::Storage(DbError::Closed).is_retryable());
    }

    #[test]
    fn test_config_file_error_names_the_file() {
        let err = SyncError::config_file(Path::new("/etc/tracker.toml"), "expected `=`");
        assert!(err.is_config_error());
        assert_eq!(err.to_string(), "Config file /etc/tracker.toml: expected `=`");
        assert!(!SyncError::Network("dns".into()).is_config_error());
    }

    #[test]
    fn test_http_display() {
        let err = SyncError::HttpResponse {
            status: 422,
            body: "bad payload".into(),
        };
        assert_eq!(err.to_string(), "HTTP 422: bad payload");
        assert_eq!(err.status(), Some(422));
    }
}
