//! # Domain Types
//!
//! Core domain types used throughout geotrack.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Fix        │   │ LocationRecord  │   │ GeofenceRegion  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  lat / lng      │──►│  uuid           │   │  identifier(PK) │       │
//! │  │  accuracy       │   │  event          │   │  center+radius  │       │
//! │  │  speed/heading  │   │  is_moving      │   │  or polygon     │       │
//! │  │  timestamp      │   │  odometer       │   │  notify flags   │       │
//! │  │  (immutable)    │   │  locked/synced  │   │  loitering      │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ LocationEvent   │   │  ActivityType   │   │ GeofenceAction  │       │
//! │  │  motionchange   │   │  still/walking  │   │  ENTER          │       │
//! │  │  tracking ...   │   │  in_vehicle ... │   │  EXIT / DWELL   │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Fix`] is produced by the position provider and never mutated. The
//! engine wraps accepted fixes into [`LocationRecord`]s, which the Event
//! Store owns from then on.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;
use uuid::Uuid;

/// Arbitrary JSON key/value payload attached to records and regions.
pub type Extras = Map<String, Value>;

// =============================================================================
// Coordinates & Fixes
// =============================================================================

/// A plain latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Coordinate {
            latitude,
            longitude,
        }
    }
}

/// One raw position sample from the position provider.
///
/// Negative `speed`, `heading` and `altitude_accuracy` mean "unknown",
/// which is how most platform providers report missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    /// Speed in m/s.
    pub speed: f64,
    /// Course in degrees from true north.
    pub heading: f64,
    pub altitude: f64,
    pub altitude_accuracy: f64,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
    /// Produced by a simulator / mock provider.
    #[serde(default)]
    pub mock: bool,
    /// Produced by an external accessory rather than the device itself.
    #[serde(default)]
    pub accessory: bool,
}

impl Fix {
    /// Creates a fix with unknown speed, heading and altitude.
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp: DateTime<Utc>) -> Self {
        Fix {
            latitude,
            longitude,
            accuracy,
            speed: -1.0,
            heading: -1.0,
            altitude: 0.0,
            altitude_accuracy: -1.0,
            timestamp,
            mock: false,
            accessory: false,
        }
    }

    /// Sets the speed (m/s).
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Sets the heading (degrees).
    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = heading;
        self
    }

    /// Sets the altitude and its accuracy.
    pub fn with_altitude(mut self, altitude: f64, accuracy: f64) -> Self {
        self.altitude = altitude;
        self.altitude_accuracy = accuracy;
        self
    }

    /// Returns the position as a [`Coordinate`].
    #[inline]
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Known, non-negative speed.
    pub fn known_speed(&self) -> Option<f64> {
        (self.speed >= 0.0).then_some(self.speed)
    }
}

// =============================================================================
// Location Event Classification
// =============================================================================

/// Why a location record was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum LocationEvent {
    /// Transition between STATIONARY and MOVING.
    MotionChange,
    /// Regular continuous tracking sample.
    #[default]
    Tracking,
    /// Result of a single-shot current-position request.
    Current,
    /// Intermediate sample of a single-shot request (never persisted).
    Sample,
    /// Result delivered by a watch-position stream.
    Watch,
    /// Geofence transition.
    Geofence,
    /// Periodic heartbeat.
    Heartbeat,
}

impl LocationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationEvent::MotionChange => "motionchange",
            LocationEvent::Tracking => "tracking",
            LocationEvent::Current => "current",
            LocationEvent::Sample => "sample",
            LocationEvent::Watch => "watch",
            LocationEvent::Geofence => "geofence",
            LocationEvent::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for LocationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Motion Activity
// =============================================================================

/// Activity classification reported by the motion-activity sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Still,
    Walking,
    Running,
    OnFoot,
    InVehicle,
    OnBicycle,
    #[default]
    Unknown,
}

impl ActivityType {
    /// Derives an activity from speed alone (m/s).
    ///
    /// Used when no motion-activity sample is available for a record.
    pub fn from_speed(speed: f64) -> Self {
        if speed > 15.0 {
            ActivityType::InVehicle
        } else if speed > 5.0 {
            ActivityType::OnBicycle
        } else if speed > 2.0 {
            ActivityType::Running
        } else if speed > 0.5 {
            ActivityType::Walking
        } else {
            ActivityType::Still
        }
    }

    /// True for activities that imply the entity is moving.
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            ActivityType::Walking
                | ActivityType::Running
                | ActivityType::OnFoot
                | ActivityType::InVehicle
                | ActivityType::OnBicycle
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Still => "still",
            ActivityType::Walking => "walking",
            ActivityType::Running => "running",
            ActivityType::OnFoot => "on_foot",
            ActivityType::InVehicle => "in_vehicle",
            ActivityType::OnBicycle => "on_bicycle",
            ActivityType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A motion-activity sample: classification plus confidence (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MotionActivity {
    #[serde(rename = "type")]
    pub activity: ActivityType,
    pub confidence: u8,
}

impl MotionActivity {
    pub const fn new(activity: ActivityType, confidence: u8) -> Self {
        MotionActivity {
            activity,
            confidence,
        }
    }
}

// =============================================================================
// Tracking Mode
// =============================================================================

/// What the engine tracks while enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// Full location tracking (records persisted, geofences evaluated).
    #[default]
    Location,
    /// Geofences only: fixes drive region evaluation but are not persisted.
    Geofence,
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingMode::Location => write!(f, "location"),
            TrackingMode::Geofence => write!(f, "geofence"),
        }
    }
}

// =============================================================================
// Location Record
// =============================================================================

/// Coordinates block of a persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Coords {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub heading: f64,
    pub altitude: f64,
    pub altitude_accuracy: f64,
}

impl From<&Fix> for Coords {
    fn from(fix: &Fix) -> Self {
        Coords {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
            speed: fix.speed,
            heading: fix.heading,
            altitude: fix.altitude,
            altitude_accuracy: fix.altitude_accuracy,
        }
    }
}

/// Geofence block attached to records with `event = geofence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct GeofenceInfo {
    pub identifier: String,
    pub action: GeofenceAction,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[ts(type = "Record<string, unknown>")]
    pub extras: Extras,
}

/// Persisted form of a [`Fix`].
///
/// `locked` and `synced` are storage flags: they are maintained by the
/// Event Store and never serialized into the payload sent upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LocationRecord {
    pub uuid: String,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
    pub event: LocationEvent,
    pub is_moving: bool,
    pub odometer: f64,
    pub coords: Coords,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<MotionActivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence: Option<GeofenceInfo>,
    #[serde(default)]
    pub is_sample: bool,
    #[serde(default)]
    pub mock: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[ts(type = "Record<string, unknown>")]
    pub extras: Extras,
    #[serde(default, skip_serializing)]
    #[ts(skip)]
    pub locked: bool,
    #[serde(default, skip_serializing)]
    #[ts(skip)]
    pub synced: bool,
}

impl LocationRecord {
    /// Wraps a fix into a new record with a fresh UUID.
    pub fn from_fix(fix: &Fix, event: LocationEvent, is_moving: bool, odometer: f64) -> Self {
        LocationRecord {
            uuid: Uuid::new_v4().to_string(),
            timestamp: fix.timestamp,
            event,
            is_moving,
            odometer,
            coords: Coords::from(fix),
            activity: None,
            geofence: None,
            is_sample: false,
            mock: fix.mock,
            extras: Extras::new(),
            locked: false,
            synced: false,
        }
    }

    /// Attaches an activity sample.
    pub fn with_activity(mut self, activity: Option<MotionActivity>) -> Self {
        self.activity = activity;
        self
    }

    /// Merges extras into the record (later keys win).
    pub fn with_extras(mut self, extras: &Extras) -> Self {
        for (key, value) in extras {
            self.extras.insert(key.clone(), value.clone());
        }
        self
    }

    /// Marks the record as an intermediate sample.
    pub fn as_sample(mut self) -> Self {
        self.is_sample = true;
        self.event = LocationEvent::Sample;
        self
    }

    #[inline]
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.coords.latitude, self.coords.longitude)
    }

    /// JSON payload of the record (what the sync dispatcher sends).
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Geofences
// =============================================================================

/// Geofence transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "UPPERCASE")]
pub enum GeofenceAction {
    Enter,
    Exit,
    Dwell,
}

impl fmt::Display for GeofenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeofenceAction::Enter => write!(f, "ENTER"),
            GeofenceAction::Exit => write!(f, "EXIT"),
            GeofenceAction::Dwell => write!(f, "DWELL"),
        }
    }
}

/// A monitored region: a circle, or a polygon with a bounding circle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct GeofenceRegion {
    /// Unique identifier (primary key).
    pub identifier: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in meters. For polygons: radius of the bounding circle.
    pub radius: f64,
    #[serde(default = "default_true")]
    pub notify_on_entry: bool,
    #[serde(default = "default_true")]
    pub notify_on_exit: bool,
    #[serde(default)]
    pub notify_on_dwell: bool,
    /// Dwell delay in milliseconds.
    #[serde(default)]
    pub loitering_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[ts(type = "Record<string, unknown>")]
    pub extras: Extras,
    /// Polygon vertices; `None` for circular regions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertices: Option<Vec<Coordinate>>,
}

fn default_true() -> bool {
    true
}

impl GeofenceRegion {
    /// Creates a circular region notifying on entry and exit.
    pub fn circle(identifier: impl Into<String>, latitude: f64, longitude: f64, radius: f64) -> Self {
        GeofenceRegion {
            identifier: identifier.into(),
            latitude,
            longitude,
            radius,
            notify_on_entry: true,
            notify_on_exit: true,
            notify_on_dwell: false,
            loitering_delay_ms: 0,
            extras: Extras::new(),
            vertices: None,
        }
    }

    /// Creates a polygon region. Center and radius describe the bounding
    /// circle (vertex centroid, farthest vertex).
    pub fn polygon(identifier: impl Into<String>, vertices: Vec<Coordinate>) -> Self {
        let (center, radius) = crate::geo::bounding_circle(&vertices);
        GeofenceRegion {
            vertices: Some(vertices),
            ..GeofenceRegion::circle(identifier, center.latitude, center.longitude, radius)
        }
    }

    /// Sets which transitions are reported.
    pub fn notify(mut self, entry: bool, exit: bool, dwell: bool) -> Self {
        self.notify_on_entry = entry;
        self.notify_on_exit = exit;
        self.notify_on_dwell = dwell;
        self
    }

    /// Enables DWELL with the given loitering delay.
    pub fn with_dwell(mut self, delay: Duration) -> Self {
        self.notify_on_dwell = true;
        self.loitering_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_extras(mut self, extras: Extras) -> Self {
        self.extras = extras;
        self
    }

    #[inline]
    pub fn center(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    #[inline]
    pub fn loitering_delay(&self) -> Duration {
        Duration::from_millis(self.loitering_delay_ms)
    }

    pub fn is_polygon(&self) -> bool {
        self.vertices.is_some()
    }

    /// Containment test: haversine distance for circles, ray casting for
    /// polygons.
    pub fn contains(&self, point: Coordinate) -> bool {
        match &self.vertices {
            Some(vertices) => crate::geo::point_in_polygon(vertices, point),
            None => crate::geo::haversine_distance(self.center(), point) <= self.radius,
        }
    }
}

/// Loitering status carried by a transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum LoiteringState {
    /// No dwell timer involved.
    None,
    /// A dwell timer was armed by this ENTER.
    Active,
    /// The dwell timer fired (DWELL event).
    Finished,
}

/// A geofence transition, built at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct GeofenceTransition {
    pub identifier: String,
    pub action: GeofenceAction,
    pub location: LocationRecord,
    pub loitering: LoiteringState,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[ts(type = "Record<string, unknown>")]
    pub extras: Extras,
}

impl GeofenceTransition {
    /// The record to persist for this transition (`event = geofence`).
    pub fn to_record(&self) -> LocationRecord {
        let mut record = self.location.clone();
        record.uuid = Uuid::new_v4().to_string();
        record.event = LocationEvent::Geofence;
        record.is_sample = false;
        record.geofence = Some(GeofenceInfo {
            identifier: self.identifier.clone(),
            action: self.action,
            extras: self.extras.clone(),
        });
        record
    }
}

// =============================================================================
// Provider State
// =============================================================================

/// Positioning authorization reported by the position provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    #[default]
    NotDetermined,
    Restricted,
    Denied,
    WhenInUse,
    Always,
}

impl AuthorizationStatus {
    /// True when positioning is allowed at all.
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthorizationStatus::WhenInUse | AuthorizationStatus::Always)
    }
}

/// Snapshot of the position provider's state (provider-change payload).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ProviderState {
    pub enabled: bool,
    pub status: AuthorizationStatus,
    pub gps: bool,
    pub network: bool,
    /// Full (true) or reduced (false) accuracy authorization.
    pub precise: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix() -> Fix {
        Fix::new(45.5, -73.6, 12.0, Utc::now()).with_speed(3.0)
    }

    #[test]
    fn test_activity_from_speed() {
        assert_eq!(ActivityType::from_speed(20.0), ActivityType::InVehicle);
        assert_eq!(ActivityType::from_speed(6.0), ActivityType::OnBicycle);
        assert_eq!(ActivityType::from_speed(3.0), ActivityType::Running);
        assert_eq!(ActivityType::from_speed(1.0), ActivityType::Walking);
        assert_eq!(ActivityType::from_speed(0.1), ActivityType::Still);
    }

    #[test]
    fn test_record_json_hides_storage_flags() {
        let mut record = LocationRecord::from_fix(&fix(), LocationEvent::Tracking, true, 12.5);
        record.locked = true;
        let json = record.to_json();

        assert_eq!(json["event"], "tracking");
        assert_eq!(json["coords"]["latitude"], 45.5);
        assert!(json.get("locked").is_none());
        assert!(json.get("synced").is_none());
    }

    #[test]
    fn test_record_json_roundtrip_keeps_fields() {
        let record = LocationRecord::from_fix(&fix(), LocationEvent::MotionChange, true, 3.0)
            .with_activity(Some(MotionActivity::new(ActivityType::Walking, 80)));
        let json = serde_json::to_string(&record).unwrap();
        let back: LocationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_transition_record_is_geofence_event() {
        let location = LocationRecord::from_fix(&fix(), LocationEvent::Tracking, true, 0.0);
        let transition = GeofenceTransition {
            identifier: "home".into(),
            action: GeofenceAction::Enter,
            location: location.clone(),
            loitering: LoiteringState::None,
            timestamp: Utc::now(),
            extras: Extras::new(),
        };
        let record = transition.to_record();

        assert_eq!(record.event, LocationEvent::Geofence);
        assert_ne!(record.uuid, location.uuid);
        assert_eq!(record.geofence.unwrap().identifier, "home");
    }

    #[test]
    fn test_circle_contains() {
        let region = GeofenceRegion::circle("office", 45.5, -73.6, 100.0);
        assert!(region.contains(Coordinate::new(45.5, -73.6)));
        assert!(!region.contains(Coordinate::new(45.51, -73.6)));
    }

    #[test]
    fn test_geofence_action_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&GeofenceAction::Dwell).unwrap(), "\"DWELL\"");
    }
}
