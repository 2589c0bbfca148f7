//! # Domain Errors
//!
//! Raised by pure logic: schedule parsing and geofence validation. Both
//! fire before any state changes, so a caller that gets one can retry with
//! corrected input and nothing to undo.
//!
//! ```text
//! ValidationError ──► CoreError ──► EngineError ──► host
//!                                       ▲
//!                 DbError, SyncError ───┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

#[derive(Debug, Error)]
pub enum CoreError {
    /// A schedule entry could not be parsed.
    ///
    /// ## When This Occurs
    /// - Day mask outside 1..=7 (`"0-8 09:00-17:00"`)
    /// - Malformed time of day (`"1-5 9am-5pm"`)
    /// - Literal window whose end precedes its start
    #[error("Invalid schedule '{entry}': {reason}")]
    InvalidSchedule { entry: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl CoreError {
    pub fn invalid_schedule(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidSchedule {
            entry: entry.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// A geofence or config value that cannot be accepted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: String },

    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Latitude, longitude or a ratio outside its domain.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: f64, max: f64 },

    /// Invalid format (e.g. polygon with fewer than 3 vertices).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Duplicate value (e.g. duplicate geofence identifier in one request).
    #[error("{field} '{value}' already exists")]
    Duplicate { field: String, value: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
