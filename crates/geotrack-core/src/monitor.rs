//! # Region Monitor
//!
//! Pure geofence evaluation: containment tracking, loitering (dwell)
//! deadlines, and selection of the monitored subset.
//!
//! ## Infinite Monitoring
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              NearestWithProximity { cap: 20 }, 25 regions               │
//! │                                                                         │
//! │        ·  ·         ┌──────── proximity region ────────┐               │
//! │     ·               │   ●  ●     ●                      │   ·          │
//! │                     │ ●    ●  ★  ●  ●   ← 19 nearest    │              │
//! │   ·        ·        │   ●  ●  ●   ●  ●    regions       │       ·      │
//! │                     │ ●   ●   ●  ●                      │              │
//! │                     └───────────────────────────────────┘              │
//! │                                                                         │
//! │  ★ = last known location      · = registered but not monitored        │
//! │                                                                         │
//! │  Leaving the proximity region re-ranks around the new location.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Selection is a [`MonitoringStrategy`]; an environment without a region
//! cap uses [`MonitorAll`].
//!
//! ## Time
//! Dwell deadlines are monotonic [`Instant`]s supplied by the caller, so a
//! deadline is honored even when no fix arrives around it:
//! [`RegionMonitor::fire_due_dwells`] only needs the last known
//! containment.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::geo::{haversine_distance, is_identical};
use crate::types::{
    Coordinate, GeofenceAction, GeofenceRegion, GeofenceTransition, LocationRecord, LoiteringState,
};

/// Identifier reported for the implicit proximity region.
pub const PROXIMITY_REGION_ID: &str = "geotrack::proximity";

// =============================================================================
// Monitored Set & Strategies
// =============================================================================

/// The large region centered on the last ranking location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityRegion {
    pub center: Coordinate,
    pub radius: f64,
}

impl ProximityRegion {
    pub fn contains(&self, point: Coordinate) -> bool {
        haversine_distance(self.center, point) <= self.radius
    }
}

/// Regions currently handed to the platform for monitoring.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MonitoredSet {
    /// Identifiers of monitored regions, nearest first when ranked.
    pub identifiers: Vec<String>,
    pub proximity: Option<ProximityRegion>,
}

impl MonitoredSet {
    /// Number of platform slots in use (regions + proximity).
    pub fn len(&self) -> usize {
        self.identifiers.len() + usize::from(self.proximity.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.identifiers.iter().any(|id| id == identifier)
    }
}

/// Chooses which registered regions are actively monitored.
pub trait MonitoringStrategy: Send + Sync + fmt::Debug {
    fn select(
        &self,
        regions: &[GeofenceRegion],
        location: Option<Coordinate>,
        proximity_radius: f64,
    ) -> MonitoredSet;
}

/// Monitors every registered region (no platform cap).
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorAll;

impl MonitoringStrategy for MonitorAll {
    fn select(&self, regions: &[GeofenceRegion], _: Option<Coordinate>, _: f64) -> MonitoredSet {
        MonitoredSet {
            identifiers: regions.iter().map(|r| r.identifier.clone()).collect(),
            proximity: None,
        }
    }
}

/// Monitors the `cap - 1` nearest regions plus one proximity region when
/// more than `cap` regions are registered.
#[derive(Debug, Clone, Copy)]
pub struct NearestWithProximity {
    pub cap: usize,
}

impl MonitoringStrategy for NearestWithProximity {
    fn select(
        &self,
        regions: &[GeofenceRegion],
        location: Option<Coordinate>,
        proximity_radius: f64,
    ) -> MonitoredSet {
        if regions.len() <= self.cap {
            return MonitorAll.select(regions, location, proximity_radius);
        }

        let slots = self.cap.saturating_sub(1);

        let Some(center) = location else {
            // Nothing to rank against yet: registration order.
            return MonitoredSet {
                identifiers: regions
                    .iter()
                    .take(slots)
                    .map(|r| r.identifier.clone())
                    .collect(),
                proximity: None,
            };
        };

        let mut ranked: Vec<(f64, &GeofenceRegion)> = regions
            .iter()
            .map(|r| (haversine_distance(center, r.center()) - r.radius, r))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        MonitoredSet {
            identifiers: ranked
                .into_iter()
                .take(slots)
                .map(|(_, r)| r.identifier.clone())
                .collect(),
            proximity: Some(ProximityRegion {
                center,
                radius: proximity_radius,
            }),
        }
    }
}

/// Strategy for a platform cap; 0 means "no cap".
pub fn strategy_for_cap(cap: usize) -> Box<dyn MonitoringStrategy> {
    if cap == 0 {
        Box::new(MonitorAll)
    } else {
        Box::new(NearestWithProximity { cap })
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Identifiers that started / stopped being monitored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MonitorChange {
    pub on: Vec<String>,
    pub off: Vec<String>,
}

impl MonitorChange {
    pub fn is_empty(&self) -> bool {
        self.on.is_empty() && self.off.is_empty()
    }

    fn between(before: &MonitoredSet, after: &MonitoredSet) -> Self {
        let old: HashSet<&str> = before.identifiers.iter().map(String::as_str).collect();
        let new: HashSet<&str> = after.identifiers.iter().map(String::as_str).collect();
        MonitorChange {
            on: after
                .identifiers
                .iter()
                .filter(|id| !old.contains(id.as_str()))
                .cloned()
                .collect(),
            off: before
                .identifiers
                .iter()
                .filter(|id| !new.contains(id.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Result of evaluating one location.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub transitions: Vec<GeofenceTransition>,
    /// Set when the monitored subset was re-ranked.
    pub change: Option<MonitorChange>,
}

#[derive(Debug, Clone, Default)]
struct RegionState {
    /// `None` until the region has been evaluated once.
    inside: Option<bool>,
    dwell_deadline: Option<Instant>,
}

/// Authoritative region set plus per-region containment state.
#[derive(Debug)]
pub struct RegionMonitor {
    regions: Vec<GeofenceRegion>,
    strategy: Box<dyn MonitoringStrategy>,
    proximity_radius: f64,
    initial_trigger_entry: bool,
    monitored: MonitoredSet,
    states: HashMap<String, RegionState>,
    last_record: Option<LocationRecord>,
}

impl RegionMonitor {
    pub fn new(
        strategy: Box<dyn MonitoringStrategy>,
        proximity_radius: f64,
        initial_trigger_entry: bool,
    ) -> Self {
        RegionMonitor {
            regions: Vec::new(),
            strategy,
            proximity_radius,
            initial_trigger_entry,
            monitored: MonitoredSet::default(),
            states: HashMap::new(),
            last_record: None,
        }
    }

    // -------------------------------------------------------------------------
    // Region set
    // -------------------------------------------------------------------------

    /// All registered regions in registration order.
    pub fn regions(&self) -> &[GeofenceRegion] {
        &self.regions
    }

    pub fn get(&self, identifier: &str) -> Option<&GeofenceRegion> {
        self.regions.iter().find(|r| r.identifier == identifier)
    }

    pub fn contains_identifier(&self, identifier: &str) -> bool {
        self.get(identifier).is_some()
    }

    /// Adds already-validated regions and re-ranks.
    pub fn add(&mut self, regions: Vec<GeofenceRegion>) -> MonitorChange {
        self.regions.extend(regions);
        self.rerank()
    }

    /// Removes regions by identifier; returns the removed ones and the
    /// resulting monitored-set change.
    pub fn remove(&mut self, identifiers: &[String]) -> (Vec<GeofenceRegion>, MonitorChange) {
        let doomed: HashSet<&str> = identifiers.iter().map(String::as_str).collect();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.regions)
            .into_iter()
            .partition(|r| doomed.contains(r.identifier.as_str()));
        self.regions = kept;
        for region in &removed {
            self.states.remove(&region.identifier);
        }
        (removed, self.rerank())
    }

    /// Removes every region.
    pub fn clear(&mut self) -> MonitorChange {
        self.regions.clear();
        self.states.clear();
        self.rerank()
    }

    // -------------------------------------------------------------------------
    // Monitoring
    // -------------------------------------------------------------------------

    pub fn monitored(&self) -> &MonitoredSet {
        &self.monitored
    }

    /// True when the region is in the actively monitored subset.
    pub fn is_monitoring(&self, identifier: &str) -> bool {
        if identifier == PROXIMITY_REGION_ID {
            return self.monitored.proximity.is_some();
        }
        self.monitored.contains(identifier)
    }

    /// Reverse lookup from a platform region (center + radius) to its
    /// identifier.
    pub fn identifier_for(&self, center: Coordinate, radius: f64) -> Option<&str> {
        if let Some(proximity) = &self.monitored.proximity {
            if is_identical(proximity.center, center) && (proximity.radius - radius).abs() < 1e-3 {
                return Some(PROXIMITY_REGION_ID);
            }
        }
        self.monitored
            .identifiers
            .iter()
            .filter_map(|id| self.get(id))
            .find(|r| is_identical(r.center(), center) && (r.radius - radius).abs() < 1e-3)
            .map(|r| r.identifier.as_str())
    }

    pub fn set_proximity_radius(&mut self, radius: f64) -> MonitorChange {
        self.proximity_radius = radius;
        self.rerank()
    }

    pub fn set_strategy(&mut self, strategy: Box<dyn MonitoringStrategy>) -> MonitorChange {
        self.strategy = strategy;
        self.rerank()
    }

    pub fn set_initial_trigger_entry(&mut self, enabled: bool) {
        self.initial_trigger_entry = enabled;
    }

    /// Last location handed to [`evaluate`](Self::evaluate).
    pub fn last_location(&self) -> Option<Coordinate> {
        self.last_record.as_ref().map(LocationRecord::coordinate)
    }

    fn rerank(&mut self) -> MonitorChange {
        let location = self.last_location();
        let next = self
            .strategy
            .select(&self.regions, location, self.proximity_radius);
        let change = MonitorChange::between(&self.monitored, &next);

        for id in &change.off {
            self.states.remove(id);
        }
        if !change.is_empty() {
            debug!(
                on = change.on.len(),
                off = change.off.len(),
                monitored = next.identifiers.len(),
                proximity = next.proximity.is_some(),
                "Monitored regions re-ranked"
            );
        }
        self.monitored = next;
        change
    }

    fn needs_rerank(&self, location: Coordinate) -> bool {
        match &self.monitored.proximity {
            Some(proximity) => !proximity.contains(location),
            // Ranked before any location was known while over the cap.
            None => self.monitored.identifiers.len() < self.regions.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluates a location against every monitored region.
    ///
    /// Due dwell deadlines are resolved first against the previous
    /// containment, then containment transitions are computed.
    pub fn evaluate(&mut self, record: &LocationRecord, now: Instant) -> Evaluation {
        let mut evaluation = Evaluation {
            transitions: self.fire_due_dwells(now, record.timestamp),
            change: None,
        };

        self.last_record = Some(record.clone());

        let location = record.coordinate();
        if self.needs_rerank(location) {
            let change = self.rerank();
            if !change.is_empty() {
                evaluation.change = Some(change);
            }
        }

        let monitored = self.monitored.identifiers.clone();
        for identifier in monitored {
            let Some(region) = self.get(&identifier).cloned() else {
                continue;
            };
            let inside = region.contains(location);
            let state = self.states.entry(identifier.clone()).or_default();

            match (state.inside, inside) {
                (Some(true), true) | (Some(false), false) => {}
                (None, false) => state.inside = Some(false),
                (None, true) if !self.initial_trigger_entry => state.inside = Some(true),
                (None, true) | (Some(false), true) => {
                    state.inside = Some(true);
                    let loitering = if region.notify_on_dwell {
                        state.dwell_deadline = Some(now + region.loitering_delay());
                        LoiteringState::Active
                    } else {
                        LoiteringState::None
                    };
                    if region.notify_on_entry {
                        evaluation.transitions.push(transition(
                            &region,
                            GeofenceAction::Enter,
                            record,
                            loitering,
                            record.timestamp,
                        ));
                    }
                }
                (Some(true), false) => {
                    state.inside = Some(false);
                    state.dwell_deadline = None;
                    if region.notify_on_exit {
                        evaluation.transitions.push(transition(
                            &region,
                            GeofenceAction::Exit,
                            record,
                            LoiteringState::None,
                            record.timestamp,
                        ));
                    }
                }
            }
        }

        evaluation
    }

    /// Emits DWELL for every region whose deadline is due and whose last
    /// known containment is still "inside".
    pub fn fire_due_dwells(&mut self, now: Instant, at: DateTime<Utc>) -> Vec<GeofenceTransition> {
        let Some(record) = self.last_record.clone() else {
            return Vec::new();
        };

        let mut fired = Vec::new();
        for identifier in &self.monitored.identifiers {
            let Some(state) = self.states.get_mut(identifier) else {
                continue;
            };
            let due = matches!(state.dwell_deadline, Some(deadline) if deadline <= now);
            if !due {
                continue;
            }
            state.dwell_deadline = None;
            if state.inside != Some(true) {
                continue;
            }
            if let Some(region) = self.regions.iter().find(|r| &r.identifier == identifier) {
                fired.push(transition(
                    region,
                    GeofenceAction::Dwell,
                    &record,
                    LoiteringState::Finished,
                    at,
                ));
            }
        }
        fired
    }

    /// Earliest armed dwell deadline.
    pub fn next_dwell_deadline(&self) -> Option<Instant> {
        self.states.values().filter_map(|s| s.dwell_deadline).min()
    }
}

fn transition(
    region: &GeofenceRegion,
    action: GeofenceAction,
    record: &LocationRecord,
    loitering: LoiteringState,
    at: DateTime<Utc>,
) -> GeofenceTransition {
    GeofenceTransition {
        identifier: region.identifier.clone(),
        action,
        location: record.clone(),
        loitering,
        timestamp: at,
        extras: region.extras.clone(),
    }
}
