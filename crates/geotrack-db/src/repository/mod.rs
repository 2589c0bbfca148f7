//! One repository per table, each a cheap clone around the shared pool.
//!
//! ```text
//! locations  ── LocationRepository   persist, select_for_sync (atomic lock),
//!                                    unlock, delete/destroy, prune, shrink
//! geofences  ── GeofenceRepository   insert_all (one transaction), all, find,
//!                                    exists, delete, delete_all
//! motion_state ── MotionStateRepository  load, save (single row)
//! ```

pub mod geofence;
pub mod location;
pub mod motion;
