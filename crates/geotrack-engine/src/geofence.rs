//! # Geofence Registry
//!
//! Async owner of the core [`RegionMonitor`]: persistence of the region
//! set, transition delivery and the dwell timer.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  create(regions) ── validate ── duplicate check ── geofences table ──┐  │
//! │  destroy(ids)    ── not-found check ───────────── geofences table ──┤  │
//! │                                                                      ▼  │
//! │                                          RegionMonitor (Mutex)         │
//! │  evaluate(record) ──────────────────────────►│                          │
//! │                                              │ transitions, re-rank     │
//! │  dwell task: sleep_until(next deadline) ────►│                          │
//! │                                              ▼                          │
//! │                 emit geofence / geofenceschange, persist geofence record│
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dwell task sleeps until the earliest armed deadline, so DWELL fires
//! on time even when no fix arrives around it.

use std::sync::Arc;

use chrono::Utc;
use geotrack_core::monitor::{
    strategy_for_cap, Evaluation, MonitorChange, MonitoredSet, RegionMonitor,
};
use geotrack_core::validation::validate_geofences;
use geotrack_core::{Coordinate, EventBus, GeofenceRegion, GeofenceTransition, LocationRecord, TrackerEvent};
use geotrack_db::GeofenceRepository;
use geotrack_sync::config::GeofenceConfig;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::{lock, monotonic_now};
use crate::sink::RecordSink;

/// Cheap-to-clone handle; every clone shares the same region set.
#[derive(Clone)]
pub struct GeofenceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    monitor: Mutex<RegionMonitor>,
    store: Option<GeofenceRepository>,
    sink: Arc<dyn RecordSink>,
    events: Arc<EventBus>,
    rearm: Notify,
    dwell_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GeofenceRegistry {
    /// `store = None` keeps the region set in memory only.
    pub fn new(
        config: &GeofenceConfig,
        store: Option<GeofenceRepository>,
        sink: Arc<dyn RecordSink>,
        events: Arc<EventBus>,
    ) -> Self {
        let monitor = RegionMonitor::new(
            strategy_for_cap(config.max_monitored_regions),
            config.proximity_radius,
            config.initial_trigger_entry,
        );
        GeofenceRegistry {
            inner: Arc::new(RegistryInner {
                monitor: Mutex::new(monitor),
                store,
                sink,
                events,
                rearm: Notify::new(),
                dwell_task: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Reloads the persisted region set (start-up).
    pub async fn load(&self) -> EngineResult<usize> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let regions = store.all().await?;
        let count = regions.len();

        let change = {
            let mut monitor = self.inner.monitor.lock().await;
            monitor.clear();
            monitor.add(regions)
        };
        info!(count, "Geofences loaded");
        self.emit_change(change);
        Ok(count)
    }

    // =========================================================================
    // Region Set
    // =========================================================================

    /// Adds regions, all or nothing.
    ///
    /// ## Errors
    /// - `Validation` for an empty identifier, non-positive radius, a bad
    ///   coordinate or a duplicate inside the request
    /// - `DuplicateIdentifier` when an identifier is already registered
    pub async fn create(&self, regions: Vec<GeofenceRegion>) -> EngineResult<()> {
        if regions.is_empty() {
            return Ok(());
        }
        validate_geofences(&regions)?;

        let mut monitor = self.inner.monitor.lock().await;
        if let Some(existing) = regions
            .iter()
            .find(|r| monitor.contains_identifier(&r.identifier))
        {
            return Err(EngineError::DuplicateIdentifier(existing.identifier.clone()));
        }

        if let Some(store) = &self.inner.store {
            store.insert_all(&regions).await?;
        }

        let count = regions.len();
        let change = monitor.add(regions);
        drop(monitor);

        info!(count, "Geofences added");
        self.emit_change(change);
        self.inner.rearm.notify_one();
        Ok(())
    }

    /// Removes regions by identifier; an empty list removes every region.
    ///
    /// Fails with `GeofenceNotFound` (and removes nothing) when any
    /// identifier is unknown.
    pub async fn destroy(&self, identifiers: &[String]) -> EngineResult<()> {
        let mut monitor = self.inner.monitor.lock().await;

        let change = if identifiers.is_empty() {
            if let Some(store) = &self.inner.store {
                store.delete_all().await?;
            }
            info!("All geofences removed");
            monitor.clear()
        } else {
            if let Some(unknown) = identifiers
                .iter()
                .find(|id| !monitor.contains_identifier(id))
            {
                return Err(EngineError::GeofenceNotFound(unknown.clone()));
            }
            if let Some(store) = &self.inner.store {
                store.delete(identifiers).await?;
            }
            let (removed, change) = monitor.remove(identifiers);
            info!(count = removed.len(), "Geofences removed");
            change
        };
        drop(monitor);

        self.emit_change(change);
        self.inner.rearm.notify_one();
        Ok(())
    }

    pub async fn all(&self) -> Vec<GeofenceRegion> {
        self.inner.monitor.lock().await.regions().to_vec()
    }

    pub async fn get(&self, identifier: &str) -> Option<GeofenceRegion> {
        self.inner.monitor.lock().await.get(identifier).cloned()
    }

    pub async fn exists(&self, identifier: &str) -> bool {
        self.inner.monitor.lock().await.contains_identifier(identifier)
    }

    pub async fn is_monitoring_region(&self, identifier: &str) -> bool {
        self.inner.monitor.lock().await.is_monitoring(identifier)
    }

    /// Identifier of the monitored region with this center and radius.
    pub async fn identifier_for(&self, center: Coordinate, radius: f64) -> Option<String> {
        self.inner
            .monitor
            .lock()
            .await
            .identifier_for(center, radius)
            .map(str::to_string)
    }

    /// Regions (and proximity region) currently handed to the platform.
    pub async fn monitored(&self) -> MonitoredSet {
        self.inner.monitor.lock().await.monitored().clone()
    }

    /// Applies a new `[geofence]` section (proximity radius, platform cap,
    /// initial trigger).
    pub async fn set_config(&self, config: &GeofenceConfig) {
        let change = {
            let mut monitor = self.inner.monitor.lock().await;
            monitor.set_initial_trigger_entry(config.initial_trigger_entry);
            let by_strategy = monitor.set_strategy(strategy_for_cap(config.max_monitored_regions));
            let by_radius = monitor.set_proximity_radius(config.proximity_radius);
            merge(by_strategy, by_radius)
        };
        self.emit_change(change);
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluates one location; delivers and persists any transition.
    pub async fn evaluate(&self, record: &LocationRecord) -> Vec<GeofenceTransition> {
        let Evaluation {
            transitions,
            change,
        } = self
            .inner
            .monitor
            .lock()
            .await
            .evaluate(record, monotonic_now());

        if let Some(change) = change {
            self.emit_change(change);
        }
        self.deliver(&transitions).await;
        self.inner.rearm.notify_one();
        transitions
    }

    /// Starts the dwell timer task. Idempotent.
    pub fn start(&self) {
        let mut slot = lock(&self.inner.dwell_task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let registry = self.clone();
        *slot = Some(tokio::spawn(async move { registry.run_dwell_timer().await }));
        debug!("Dwell timer started");
    }

    /// Cancels the dwell timer task. Armed deadlines stay in the monitor
    /// and are honored on the next evaluation.
    pub fn stop(&self) {
        let task = lock(&self.inner.dwell_task).take();
        if let Some(task) = task {
            task.abort();
            debug!("Dwell timer stopped");
        }
    }

    async fn run_dwell_timer(&self) {
        loop {
            let deadline = self.inner.monitor.lock().await.next_dwell_deadline();
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                            let fired = self
                                .inner
                                .monitor
                                .lock()
                                .await
                                .fire_due_dwells(monotonic_now(), Utc::now());
                            self.deliver(&fired).await;
                        }
                        _ = self.inner.rearm.notified() => {}
                    }
                }
                None => self.inner.rearm.notified().await,
            }
        }
    }

    async fn deliver(&self, transitions: &[GeofenceTransition]) {
        for transition in transitions {
            info!(
                identifier = %transition.identifier,
                action = %transition.action,
                "Geofence transition"
            );
            if let Err(e) = self.inner.sink.persist(&transition.to_record()).await {
                warn!(error = %e, identifier = %transition.identifier, "Failed to persist geofence event");
            }
            self.inner
                .events
                .emit(&TrackerEvent::Geofence(transition.clone()));
        }
    }

    fn emit_change(&self, change: MonitorChange) {
        if change.is_empty() {
            return;
        }
        self.inner.events.emit(&TrackerEvent::GeofencesChange {
            on: change.on,
            off: change.off,
        });
    }
}

/// Combines two successive changes, cancelling ids that flipped back.
fn merge(first: MonitorChange, second: MonitorChange) -> MonitorChange {
    let on = first
        .on
        .iter()
        .filter(|id| !second.off.contains(id))
        .chain(second.on.iter().filter(|id| !first.off.contains(id)))
        .cloned()
        .collect();
    let off = first
        .off
        .iter()
        .filter(|id| !second.on.contains(id))
        .chain(second.off.iter().filter(|id| !first.on.contains(id)))
        .cloned()
        .collect();
    MonitorChange { on, off }
}
