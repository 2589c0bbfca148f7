//! # geotrack-engine: Tracking Orchestration
//!
//! Puts the pure decisions of `geotrack-core` on a clock: provider streams,
//! request timeouts, dwell timers, schedule windows. The [`Tracker`] owns
//! every component and is what a host application drives.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        geotrack Architecture                            │
//! │                                                                         │
//! │  Host bridge ──► ┌─────────────────────────────────────────────────┐   │
//! │                  │        ★ geotrack-engine (THIS CRATE) ★         │   │
//! │                  │                                                 │   │
//! │  PositionProvider│  LocationEngine ──► GeofenceRegistry            │   │
//! │  ───────────────►│        │                  │                     │   │
//! │                  │        └──► RecordSink ◄──┘   ScheduleController│   │
//! │                  │                 │                               │   │
//! │                  │              Tracker (owns all of the above)    │   │
//! │                  └─────────────────┼───────────────────────────────┘   │
//! │                                    │                                    │
//! │          ┌─────────────────────────┼─────────────────────────┐         │
//! │          ▼                         ▼                         ▼         │
//! │   geotrack-core             geotrack-db                geotrack-sync   │
//! │   (decisions)               (Event Store)              (delivery)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! ```text
//! geotrack_engine/
//! ├── lib.rs        ◄─── You are here
//! ├── tracker.rs    ◄─── Tracker orchestrator and TrackerDeps
//! ├── location.rs   ◄─── LocationEngine: run loop, pace, requests, watches
//! ├── request.rs    ◄─── Current/watch request options, sample selection
//! ├── geofence.rs   ◄─── GeofenceRegistry: persisted regions, dwell timer
//! ├── scheduler.rs  ◄─── ScheduleController and wall clocks
//! ├── provider.rs   ◄─── PositionProvider contract, ScriptedProvider
//! ├── sink.rs       ◄─── RecordSink: Event Store + retention + sync wake-up
//! └── error.rs      ◄─── EngineError and location error codes
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use geotrack_core::EventKind;
//! use geotrack_db::{Database, DbConfig};
//! use geotrack_engine::{ScriptedProvider, Tracker, TrackerDeps};
//! use geotrack_sync::TrackerConfig;
//!
//! let db = Database::new(DbConfig::new("tracker.db")).await?;
//! let provider = Arc::new(ScriptedProvider::default());
//! let tracker = Tracker::ready(TrackerConfig::load_or_default(None), TrackerDeps::new(db, provider)).await?;
//!
//! tracker.subscribe(EventKind::MotionChange, |event| println!("{:?}", event.to_map()));
//! tracker.start().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod geofence;
pub mod location;
pub mod provider;
pub mod request;
pub mod scheduler;
pub mod sink;
pub mod tracker;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{EngineError, EngineResult};
pub use geofence::GeofenceRegistry;
pub use location::LocationEngine;
pub use provider::{PositionProvider, ProviderSettings, ScriptedProvider};
pub use request::{
    acquire_fix, CurrentPosition, CurrentPositionRequest, WatchCallback, WatchId, WatchRequest,
};
pub use scheduler::{LocalClock, ScheduleController, ScheduleTarget, SimulatedClock, WallClock};
pub use sink::{DiscardSink, RecordSink, StoreSink};
pub use tracker::{Tracker, TrackerDeps};

// =============================================================================
// Shared Helpers
// =============================================================================

/// Monotonic "now" handed to the core state machines.
///
/// Read from the tokio clock so that a paused test runtime also freezes
/// dwell and stop deadlines.
pub(crate) fn monotonic_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Locks a std mutex, recovering the data from a poisoned lock.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
