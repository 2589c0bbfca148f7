//! # geotrack-sync: Configuration and Delivery for geotrack
//!
//! Delivers persisted location records to the remote endpoint despite
//! intermittent connectivity, and owns the tracker configuration.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Event Store (geotrack-db)                                            │
//! │        │ select_for_sync / delete_all / unlock                         │
//! │        ▼                                                                │
//! │   ┌──────────────────┐  headers, refresh  ┌──────────────────────┐     │
//! │   │  SyncDispatcher  │◄───────────────────│ AuthorizationProvider│     │
//! │   │  (one in flight) │                    │ (TokenAuthorization) │     │
//! │   └────────┬─────────┘                    └──────────────────────┘     │
//! │            │ POST / PUT (reqwest)                                       │
//! │            ▼                                                            │
//! │      remote endpoint                                                   │
//! │                                                                         │
//! │   SyncAgent: persisted / connectivity / explicit / retry triggers      │
//! │   TrackerConfig: TOML + GEOTRACK_* env, validated, diffable            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent` trigger loop with exponential backoff
//! - [`authorization`] - JWT / SAS tokens and refresh
//! - [`config`] - `TrackerConfig` (all sections) and change detection
//! - [`dispatcher`] - `SyncDispatcher` (lock, send, delete or unlock)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use geotrack_sync::{FlushTrigger, SyncDispatcher, TrackerConfig};
//!
//! let config = TrackerConfig::load_or_default(None);
//! let dispatcher = SyncDispatcher::new(db, client, config.http, connectivity, lease, events);
//!
//! match dispatcher.flush(FlushTrigger::Explicit).await {
//!     Ok(outcome) => println!("{outcome:?}"),
//!     Err(e) if e.is_retryable() => println!("will retry: {e}"),
//!     Err(e) => println!("sync failed: {e}"),
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod authorization;
pub mod config;
pub mod dispatcher;
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{RetryPolicy, SyncAgent, SyncAgentHandle, SyncStatus};
pub use authorization::{
    AuthorizationConfig, AuthorizationProvider, AuthorizationStrategy, TokenAuthorization,
};
pub use config::{ConfigChange, HttpConfig, HttpMethod, TrackerConfig};
pub use dispatcher::{FlushOutcome, FlushTrigger, SyncDispatcher};
pub use error::{SyncError, SyncResult};
