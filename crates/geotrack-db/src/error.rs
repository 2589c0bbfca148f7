//! # Storage Errors
//!
//! ```text
//! sqlx::Error ──► DbError ──┬──► SyncError::Storage    lock / delete failed
//!                           └──► EngineError::Storage  persist / geofence CRUD
//!                                EngineError::DuplicateIdentifier
//! ```
//!
//! Callers mostly care about three cases: the row clashed with an existing
//! key, another writer held the database for longer than the busy timeout,
//! or the handle was already closed. Everything else is a plain query
//! failure carrying SQLite's message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("cannot open event store: {0}")]
    Open(String),

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),

    /// `value` is the clashing key when the caller knows it; SQLite only
    /// reports the column.
    #[error("{field} '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// A stored row whose JSON payload no longer decodes.
    #[error("row {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("event store is busy")]
    Busy,

    #[error("event store is closed")]
    Closed,

    #[error("cannot encode row: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Worth retrying later with the same input.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Busy)
    }
}

const UNIQUE_PREFIX: &str = "UNIQUE constraint failed: ";

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message();
                if let Some(column) = message.strip_prefix(UNIQUE_PREFIX) {
                    DbError::duplicate(column, "")
                } else if message.contains("database is locked") {
                    DbError::Busy
                } else {
                    DbError::Query(message.to_string())
                }
            }
            sqlx::Error::PoolTimedOut => DbError::Busy,
            sqlx::Error::PoolClosed => DbError::Closed,
            other => DbError::Query(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Migration(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors() {
        assert!(matches!(DbError::from(sqlx::Error::PoolClosed), DbError::Closed));
        assert!(DbError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!DbError::from(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            DbError::duplicate("identifier", "home").to_string(),
            "identifier 'home' already exists"
        );
    }
}
