//! # geotrack-db: Event Store for geotrack
//!
//! SQLite persistence for location records awaiting delivery and for the
//! registered geofence set.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        geotrack Data Flow                               │
//! │                                                                         │
//! │  LocationEngine (accepted fix)        GeofenceRegistry (transition)    │
//! │       │                                     │                           │
//! │       ▼                                     ▼                           │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  geotrack-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │◄───│  locations     │    │  (embedded)  │  │   │
//! │  │   │  SqlitePool   │    │  geofences     │    │ 001_init.sql │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncDispatcher: select_for_sync → POST → delete_all | unlock          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use geotrack_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("geotrack.db")).await?;
//! db.locations().unlock_all().await?;
//!
//! let uuid = db.locations().persist(&record).await?;
//! let batch = db.locations().select_for_sync(250).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use migrations::MigrationStatus;
pub use pool::{Database, DbConfig, Storage};

pub use repository::geofence::GeofenceRepository;
pub use repository::location::LocationRepository;
pub use repository::motion::{MotionSnapshot, MotionStateRepository};
