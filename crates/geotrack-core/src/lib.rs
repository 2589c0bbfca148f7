//! # geotrack-core: Pure Tracking Logic
//!
//! This crate holds every tracking decision as plain, synchronous code:
//! motion state, region containment, schedule windows and the event
//! registry. It performs no I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        geotrack Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Host application bridge                      │   │
//! │  │    subscribe(kind) ◄── TrackerEvent::to_map ── Tracker API      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  geotrack-engine (orchestration)                │   │
//! │  │   LocationEngine, GeofenceRegistry, ScheduleController, Tracker │   │
//! │  └───────────────┬───────────────────────────────┬─────────────────┘   │
//! │                  │                               │                      │
//! │  ┌───────────────▼───────────────┐ ┌─────────────▼─────────────────┐   │
//! │  │   geotrack-db (Event Store)   │ │ geotrack-sync (HTTP delivery) │   │
//! │  └───────────────┬───────────────┘ └─────────────┬─────────────────┘   │
//! │                  │                               │                      │
//! │  ┌───────────────▼───────────────────────────────▼─────────────────┐   │
//! │  │               ★ geotrack-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │  ┌────────┐ ┌─────────┐ ┌─────────┐ ┌──────────┐ ┌──────────┐  │   │
//! │  │  │ types  │ │ motion  │ │ monitor │ │ schedule │ │  events  │  │   │
//! │  │  │  geo   │ │ tracker │ │ regions │ │ windows  │ │   bus    │  │   │
//! │  │  └────────┘ └─────────┘ └─────────┘ └──────────┘ └──────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • TIME IS A PARAMETER      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Fix, LocationRecord, GeofenceRegion and friends
//! - [`geo`] - Haversine distance, point-in-polygon
//! - [`motion`] - Accuracy gating, distance filter, odometer, stop detection
//! - [`monitor`] - Region containment, dwell deadlines, infinite monitoring
//! - [`schedule`] - Schedule string parsing and window evaluation
//! - [`events`] - Event kinds, payloads and the subscription registry
//! - [`platform`] - Background lease and connectivity contracts
//! - [`validation`] - Geofence input rules
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use geotrack_core::geo::haversine_distance;
//! use geotrack_core::types::{Coordinate, GeofenceRegion};
//!
//! let office = GeofenceRegion::circle("office", 45.5017, -73.5673, 200.0);
//! let here = Coordinate::new(45.5020, -73.5670);
//!
//! assert!(office.contains(here));
//! assert!(haversine_distance(office.center(), here) < 200.0);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod events;
pub mod geo;
pub mod monitor;
pub mod motion;
pub mod platform;
pub mod schedule;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use events::{EventBus, EventKind, ListenerId, TrackerEvent};
pub use types::*;
