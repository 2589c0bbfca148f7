//! # Event Subscriptions
//!
//! Typed events exposed to the host application and the registry that
//! delivers them.
//!
//! ## Delivery Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   emit(event) ──► lock ──► snapshot listeners[kind] ──► unlock          │
//! │                                        │                                │
//! │                                        ▼                                │
//! │                  call each listener in registration order              │
//! │                  (listeners may subscribe/unsubscribe freely)           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Listeners run synchronously on the emitting task and must not block.
//! Every event converts to a plain JSON object with [`TrackerEvent::to_map`]
//! for transport across the host bridge.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use ts_rs::TS;

use crate::types::{
    GeofenceTransition, LocationRecord, MotionActivity, ProviderState, TrackingMode,
};

// =============================================================================
// Event Kinds
// =============================================================================

/// The thirteen subscribable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Location,
    MotionChange,
    ActivityChange,
    Geofence,
    GeofencesChange,
    Heartbeat,
    Http,
    ProviderChange,
    Schedule,
    PowerSaveChange,
    ConnectivityChange,
    EnabledChange,
    Authorization,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::Location,
        EventKind::MotionChange,
        EventKind::ActivityChange,
        EventKind::Geofence,
        EventKind::GeofencesChange,
        EventKind::Heartbeat,
        EventKind::Http,
        EventKind::ProviderChange,
        EventKind::Schedule,
        EventKind::PowerSaveChange,
        EventKind::ConnectivityChange,
        EventKind::EnabledChange,
        EventKind::Authorization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Location => "location",
            EventKind::MotionChange => "motionchange",
            EventKind::ActivityChange => "activitychange",
            EventKind::Geofence => "geofence",
            EventKind::GeofencesChange => "geofenceschange",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Http => "http",
            EventKind::ProviderChange => "providerchange",
            EventKind::Schedule => "schedule",
            EventKind::PowerSaveChange => "powersavechange",
            EventKind::ConnectivityChange => "connectivitychange",
            EventKind::EnabledChange => "enabledchange",
            EventKind::Authorization => "authorization",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Outcome of one sync HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HttpEvent {
    /// HTTP status, 0 when no response was received.
    pub status: u16,
    pub success: bool,
    pub response_text: String,
    /// Records carried by the request.
    pub count: usize,
}

/// Outcome of an authorization refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AuthorizationEvent {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every event the tracker can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Location(LocationRecord),
    MotionChange {
        is_moving: bool,
        location: LocationRecord,
    },
    ActivityChange(MotionActivity),
    Geofence(GeofenceTransition),
    GeofencesChange {
        on: Vec<String>,
        off: Vec<String>,
    },
    Heartbeat {
        location: Option<LocationRecord>,
    },
    Http(HttpEvent),
    ProviderChange(ProviderState),
    Schedule {
        enabled: bool,
        mode: TrackingMode,
    },
    PowerSaveChange(bool),
    ConnectivityChange {
        connected: bool,
    },
    EnabledChange(bool),
    Authorization(AuthorizationEvent),
}

impl TrackerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TrackerEvent::Location(_) => EventKind::Location,
            TrackerEvent::MotionChange { .. } => EventKind::MotionChange,
            TrackerEvent::ActivityChange(_) => EventKind::ActivityChange,
            TrackerEvent::Geofence(_) => EventKind::Geofence,
            TrackerEvent::GeofencesChange { .. } => EventKind::GeofencesChange,
            TrackerEvent::Heartbeat { .. } => EventKind::Heartbeat,
            TrackerEvent::Http(_) => EventKind::Http,
            TrackerEvent::ProviderChange(_) => EventKind::ProviderChange,
            TrackerEvent::Schedule { .. } => EventKind::Schedule,
            TrackerEvent::PowerSaveChange(_) => EventKind::PowerSaveChange,
            TrackerEvent::ConnectivityChange { .. } => EventKind::ConnectivityChange,
            TrackerEvent::EnabledChange(_) => EventKind::EnabledChange,
            TrackerEvent::Authorization(_) => EventKind::Authorization,
        }
    }

    /// Plain key/value form for the host bridge.
    pub fn to_map(&self) -> Map<String, Value> {
        let value = match self {
            TrackerEvent::Location(record) => to_value(record),
            TrackerEvent::MotionChange {
                is_moving,
                location,
            } => json!({ "isMoving": is_moving, "location": to_value(location) }),
            TrackerEvent::ActivityChange(activity) => {
                json!({ "activity": activity.activity, "confidence": activity.confidence })
            }
            TrackerEvent::Geofence(transition) => to_value(transition),
            TrackerEvent::GeofencesChange { on, off } => json!({ "on": on, "off": off }),
            TrackerEvent::Heartbeat { location } => json!({ "location": location }),
            TrackerEvent::Http(http) => to_value(http),
            TrackerEvent::ProviderChange(state) => to_value(state),
            TrackerEvent::Schedule { enabled, mode } => {
                json!({ "enabled": enabled, "trackingMode": mode })
            }
            TrackerEvent::PowerSaveChange(on) => json!({ "isPowerSaveMode": on }),
            TrackerEvent::ConnectivityChange { connected } => json!({ "connected": connected }),
            TrackerEvent::EnabledChange(enabled) => json!({ "enabled": enabled }),
            TrackerEvent::Authorization(auth) => to_value(auth),
        };

        match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// =============================================================================
// Event Bus
// =============================================================================

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A registered callback.
pub type Listener = Arc<dyn Fn(&TrackerEvent) + Send + Sync>;

/// Subscription registry: one ordered listener list per event kind.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<EventKind, usize> = self
            .lock()
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for one kind.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes one listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        for list in listeners.values_mut() {
            if let Some(pos) = list.iter().position(|(lid, _)| *lid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn remove_all_listeners(&self) {
        self.lock().clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Delivers an event to every listener of its kind.
    pub fn emit(&self, event: &TrackerEvent) {
        let snapshot: Vec<Listener> = self
            .lock()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in snapshot {
            listener(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(ListenerId, Listener)>>> {
        // A panicking listener runs outside the lock, so poisoning only
        // happens on a bug inside this module; the map is still valid.
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::EnabledChange, move |_| seen.lock().unwrap().push(n));
        }
        bus.emit(&TrackerEvent::EnabledChange(true));

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_only_matching_kind_fires() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(EventKind::Heartbeat, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&TrackerEvent::EnabledChange(true));
        bus.emit(&TrackerEvent::Heartbeat { location: None });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_during_emit_is_safe() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let id_slot = Arc::new(Mutex::new(None));
        let (b, slot, h) = (Arc::clone(&bus), Arc::clone(&id_slot), Arc::clone(&hits));
        let id = bus.subscribe(EventKind::PowerSaveChange, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot.lock().unwrap().take() {
                b.unsubscribe(id);
            }
        });
        *id_slot.lock().unwrap() = Some(id);

        bus.emit(&TrackerEvent::PowerSaveChange(true));
        bus.emit(&TrackerEvent::PowerSaveChange(false));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::PowerSaveChange), 0);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus = EventBus::new();
        for kind in EventKind::ALL {
            bus.subscribe(kind, |_| {});
        }
        assert_eq!(bus.listener_count(EventKind::Authorization), 1);
        bus.remove_all_listeners();
        assert!(EventKind::ALL.iter().all(|k| bus.listener_count(*k) == 0));
    }

    #[test]
    fn test_to_map_shapes() {
        let map = TrackerEvent::GeofencesChange {
            on: vec!["a".into()],
            off: vec![],
        }
        .to_map();
        assert_eq!(map["on"], json!(["a"]));

        let map = TrackerEvent::Http(HttpEvent {
            status: 200,
            success: true,
            response_text: "ok".into(),
            count: 3,
        })
        .to_map();
        assert_eq!(map["count"], 3);
        assert_eq!(map["status"], 200);

        let map = TrackerEvent::Schedule {
            enabled: true,
            mode: TrackingMode::Geofence,
        }
        .to_map();
        assert_eq!(map["trackingMode"], "geofence");
    }
}
