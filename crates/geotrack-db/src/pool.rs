//! # Database Handle
//!
//! Opens the SQLite file that backs the Event Store and the geofence
//! table, and hands out repositories bound to the shared pool.
//!
//! ## Storage Modes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  DbConfig::new(path)            DbConfig::in_memory()                   │
//! │    file, created if missing       one private connection, never         │
//! │    WAL + synchronous=NORMAL       recycled (the data lives in it)       │
//! │    several connections                                                  │
//! │          │                               │                              │
//! │          └──────────────┬────────────────┘                              │
//! │                         ▼                                               │
//! │            Database::new(config) ── migrations                          │
//! │                         │                                               │
//! │          ┌──────────────┼──────────────────┐                            │
//! │          ▼              ▼                  ▼                            │
//! │    engine persist   dispatcher lock    registry geofences               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! WAL keeps a persist from waiting on a sync batch being read; the busy
//! timeout queues competing writers instead of failing them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations::{self, MigrationStatus};
use crate::repository::geofence::GeofenceRepository;
use crate::repository::location::LocationRepository;
use crate::repository::motion::MotionStateRepository;

const DEFAULT_FILE_CONNECTIONS: u32 = 4;

// =============================================================================
// Configuration
// =============================================================================

/// Where the records live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    File(PathBuf),
    /// Lost when the pool closes. Tests and dry runs only.
    Memory,
}

/// How to open the [`Database`].
///
/// ```rust,ignore
/// let config = DbConfig::new(data_dir.join("geotrack.db")).max_connections(8);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub storage: Storage,
    pub max_connections: u32,
    /// Wait for a competing write lock before failing with `Busy`.
    pub busy_timeout: Duration,
    /// Wait for a free pooled connection.
    pub acquire_timeout: Duration,
    pub run_migrations: bool,
}

impl DbConfig {
    /// File-backed store; the file is created on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            storage: Storage::File(path.into()),
            max_connections: DEFAULT_FILE_CONNECTIONS,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
            run_migrations: true,
        }
    }

    /// Private in-memory store on a single connection.
    pub fn in_memory() -> Self {
        DbConfig {
            storage: Storage::Memory,
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
            run_migrations: true,
        }
    }

    /// Ignored for in-memory storage, which needs exactly one connection.
    pub fn max_connections(mut self, max: u32) -> Self {
        if self.storage != Storage::Memory {
            self.max_connections = max.max(1);
        }
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Opens the database without touching its schema.
    pub fn without_migrations(mut self) -> Self {
        self.run_migrations = false;
        self
    }

    /// Path of the backing file, `None` in memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::File(path) => Some(path),
            Storage::Memory => None,
        }
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        let options = match &self.storage {
            Storage::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
            Storage::Memory => SqliteConnectOptions::new()
                .in_memory(true)
                .journal_mode(SqliteJournalMode::Memory),
        };
        options.busy_timeout(self.busy_timeout)
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        let options = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout);
        match self.storage {
            // Recycling the only connection would drop every table.
            Storage::Memory => options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            Storage::File(_) => options.idle_timeout(Some(Duration::from_secs(300))),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Shared handle to the store. Clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the pool and brings the schema up to date.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        match config.path() {
            Some(path) => info!(path = %path.display(), "Opening event store"),
            None => info!("Opening in-memory event store"),
        }

        let pool = config
            .pool_options()
            .connect_with(config.connect_options())
            .await
            .map_err(|e| DbError::Open(e.to_string()))?;
        debug!(max_connections = config.max_connections, "Pool ready");

        let db = Database { pool };
        if config.run_migrations {
            migrations::run_migrations(&db.pool).await?;
        }
        Ok(db)
    }

    pub async fn migration_status(&self) -> DbResult<MigrationStatus> {
        migrations::migration_status(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The Event Store.
    pub fn locations(&self) -> LocationRepository {
        LocationRepository::new(self.pool.clone())
    }

    pub fn geofences(&self) -> GeofenceRepository {
        GeofenceRepository::new(self.pool.clone())
    }

    pub fn motion_state(&self) -> MotionStateRepository {
        MotionStateRepository::new(self.pool.clone())
    }

    /// Waits for checked-out connections, then closes the pool. Every
    /// later repository call fails with `Closed`.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Event store closed");
    }

    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
