//! # Engine Errors
//!
//! What the host sees when a tracker operation fails.
//!
//! ## Error Codes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  code   meaning              raised by                                 │
//! │  ────   ───────────────────  ──────────────────────────────────────    │
//! │    0    unknown / misuse     storage, validation, geofence CRUD        │
//! │    1    location denied      start(), requests without permission      │
//! │    2    network              sync without connectivity / transport     │
//! │  408    timeout              current / watch position requests         │
//! │  499    cancelled            request aborted by stop()                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A best-effort fix that misses the desired accuracy is NOT an error: the
//! request resolves with `accuracy_met = false`.

use geotrack_core::{AuthorizationStatus, CoreError, ValidationError};
use geotrack_db::DbError;
use geotrack_sync::SyncError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// Positioning permission is missing.
    #[error("Location authorization not granted ({0:?})")]
    NotAuthorized(AuthorizationStatus),

    /// `start()` while tracking is already running in the same mode.
    #[error("Tracking already started")]
    AlreadyStarted,

    /// The tracker was shut down.
    #[error("Tracker is shutting down")]
    ShuttingDown,

    // =========================================================================
    // Position Requests
    // =========================================================================
    /// No usable fix before the request timeout.
    #[error("Location request timed out")]
    Timeout,

    /// The request was aborted.
    #[error("Location request cancelled")]
    Cancelled,

    /// The position provider failed.
    #[error("Position provider error: {0}")]
    Provider(String),

    // =========================================================================
    // Geofences
    // =========================================================================
    #[error("Geofence '{0}' already exists")]
    DuplicateIdentifier(String),

    #[error("Geofence '{0}' not found")]
    GeofenceNotFound(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Lower Layers
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(#[source] DbError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl EngineError {
    /// Numeric location error code for the host bridge.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::NotAuthorized(_) => 1,
            EngineError::Timeout => 408,
            EngineError::Cancelled => 499,
            EngineError::Sync(SyncError::NoConnection | SyncError::Network(_)) => 2,
            _ => 0,
        }
    }
}

/// A duplicate primary key in the geofence table is a caller mistake, not
/// a storage failure.
impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UniqueViolation { value, .. } => EngineError::DuplicateIdentifier(value),
            other => EngineError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(EngineError::Timeout.code(), 408);
        assert_eq!(EngineError::Cancelled.code(), 499);
        assert_eq!(EngineError::NotAuthorized(AuthorizationStatus::Denied).code(), 1);
        assert_eq!(EngineError::Sync(SyncError::NoConnection).code(), 2);
        assert_eq!(EngineError::AlreadyStarted.code(), 0);
    }

    #[test]
    fn test_unique_violation_becomes_duplicate() {
        let err: EngineError = DbError::duplicate("identifier", "home").into();
        assert!(matches!(err, EngineError::DuplicateIdentifier(id) if id == "home"));

        let err: EngineError = DbError::Query("disk full".into()).into();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
