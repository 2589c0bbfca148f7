//! Geofence registry on a paused clock: dwell timing, repeated crossings
//! and proximity re-ranking over the platform cap.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use geotrack_core::{
    EventBus, EventKind, Fix, GeofenceAction, GeofenceRegion, LocationEvent, LocationRecord,
    TrackerEvent,
};
use geotrack_engine::{DiscardSink, GeofenceRegistry};
use geotrack_sync::config::GeofenceConfig;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

const INSIDE: (f64, f64) = (45.0, -73.0);
const OUTSIDE: (f64, f64) = (45.01, -73.0);

type Seen = Arc<Mutex<Vec<(GeofenceAction, Duration)>>>;

fn record(lat: f64, lon: f64) -> LocationRecord {
    let fix = Fix::new(lat, lon, 5.0, Utc::now());
    LocationRecord::from_fix(&fix, LocationEvent::Tracking, true, 0.0)
}

/// Registry with in-memory regions; transitions are recorded with the
/// elapsed paused time at which they were emitted.
fn registry(cap: usize) -> (GeofenceRegistry, Arc<EventBus>, Seen) {
    let events = Arc::new(EventBus::new());
    let config = GeofenceConfig {
        max_monitored_regions: cap,
        ..GeofenceConfig::default()
    };
    let registry = GeofenceRegistry::new(&config, None, Arc::new(DiscardSink), Arc::clone(&events));

    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();
    let sink = Arc::clone(&seen);
    events.subscribe(EventKind::Geofence, move |event| {
        if let TrackerEvent::Geofence(t) = event {
            sink.lock().unwrap().push((t.action, started.elapsed()));
        }
    });
    (registry, events, seen)
}

fn actions(seen: &Seen) -> Vec<GeofenceAction> {
    seen.lock().unwrap().iter().map(|(a, _)| *a).collect()
}

async fn add_home(registry: &GeofenceRegistry, dwell: Option<Duration>) {
    let mut home = GeofenceRegion::circle("home", INSIDE.0, INSIDE.1, 200.0);
    if let Some(delay) = dwell {
        home = home.with_dwell(delay);
    }
    registry.create(vec![home]).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dwell_fires_once_after_loitering_delay() {
    let (registry, _events, seen) = registry(0);
    add_home(&registry, Some(Duration::from_secs(60))).await;
    registry.start();

    // Fixes every 10 s for 90 s, all inside.
    for _ in 0..9 {
        registry.evaluate(&record(INSIDE.0, INSIDE.1)).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    assert_eq!(actions(&seen), vec![GeofenceAction::Enter, GeofenceAction::Dwell]);
    let dwell_at = seen.lock().unwrap()[1].1;
    assert!(dwell_at >= Duration::from_secs(60), "dwell fired at {dwell_at:?}");
    assert!(dwell_at < Duration::from_secs(70), "dwell fired at {dwell_at:?}");
}

#[tokio::test(start_paused = true)]
async fn test_dwell_fires_without_a_fix_at_the_deadline() {
    let (registry, _events, seen) = registry(0);
    add_home(&registry, Some(Duration::from_secs(60))).await;
    registry.start();

    registry.evaluate(&record(INSIDE.0, INSIDE.1)).await;
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(actions(&seen), vec![GeofenceAction::Enter, GeofenceAction::Dwell]);
    let dwell_at = seen.lock().unwrap()[1].1;
    assert!(dwell_at >= Duration::from_secs(60) && dwell_at < Duration::from_secs(61));
}

#[tokio::test(start_paused = true)]
async fn test_exit_before_deadline_cancels_dwell() {
    let (registry, _events, seen) = registry(0);
    add_home(&registry, Some(Duration::from_secs(60))).await;
    registry.start();

    registry.evaluate(&record(INSIDE.0, INSIDE.1)).await;
    tokio::time::sleep(Duration::from_secs(45)).await;
    registry.evaluate(&record(OUTSIDE.0, OUTSIDE.1)).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(actions(&seen), vec![GeofenceAction::Enter, GeofenceAction::Exit]);
}

#[tokio::test(start_paused = true)]
async fn test_every_crossing_is_reported() {
    let (registry, _events, seen) = registry(0);
    add_home(&registry, None).await;
    registry.start();

    // Starts outside: no initial transition.
    registry.evaluate(&record(OUTSIDE.0, OUTSIDE.1)).await;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        registry.evaluate(&record(INSIDE.0, INSIDE.1)).await;
        // Repeated fixes on the same side change nothing.
        registry.evaluate(&record(INSIDE.0, INSIDE.1)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        registry.evaluate(&record(OUTSIDE.0, OUTSIDE.1)).await;
    }

    let expected = [GeofenceAction::Enter, GeofenceAction::Exit].repeat(3);
    assert_eq!(actions(&seen), expected);
}

#[tokio::test(start_paused = true)]
async fn test_proximity_reranking_over_platform_cap() {
    let (registry, events, _seen) = registry(20);

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    events.subscribe(EventKind::GeofencesChange, move |event| {
        if let TrackerEvent::GeofencesChange { on, off } = event {
            sink.lock().unwrap().push((on.clone(), off.clone()));
        }
    });

    // 25 regions about 1.1 km apart along a meridian.
    let regions: Vec<GeofenceRegion> = (0..25)
        .map(|i| GeofenceRegion::circle(format!("r{i}"), 45.0 + i as f64 * 0.01, -73.0, 100.0))
        .collect();
    registry.create(regions).await.unwrap();

    // Before any location: cap - 1 regions, no proximity region.
    let monitored = registry.monitored().await;
    assert_eq!(monitored.identifiers.len(), 19);
    assert!(monitored.proximity.is_none());

    registry.evaluate(&record(45.0, -73.0)).await;
    let monitored = registry.monitored().await;
    assert_eq!(monitored.len(), 20);
    assert!(monitored.proximity.is_some());
    assert!(monitored.contains("r0"));
    assert!(!monitored.contains("r24"));

    changes.lock().unwrap().clear();
    registry.evaluate(&record(45.24, -73.0)).await;

    let monitored = registry.monitored().await;
    assert_eq!(monitored.len(), 20);
    assert!(monitored.contains("r24"));
    assert!(!monitored.contains("r0"));
    assert!(registry.is_monitoring_region("r24").await);
    // Every registered region stays registered.
    assert_eq!(registry.all().await.len(), 25);

    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 1);
    let (on, off) = &changes[0];
    assert!(on.contains(&"r24".to_string()));
    assert!(off.contains(&"r0".to_string()));
}
