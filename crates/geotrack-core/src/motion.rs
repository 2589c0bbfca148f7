//! # Motion Tracker
//!
//! The decision core of the location state engine: accuracy gating,
//! elastic distance filtering, odometer accumulation, stationary-exit
//! detection and stop detection.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │                 moving activity (confidence ≥ min)                     │
//! │   ┌────────────┐ ─────────────────────────────► ┌────────────┐         │
//! │   │ STATIONARY │                                 │ ACQUIRING  │         │
//! │   │            │ ◄──────────┐                    └─────┬──────┘         │
//! │   └─────┬──────┘            │                          │ first usable   │
//! │         │ fix outside       │ stop timeout             │ fix            │
//! │         │ stationary radius │ (geometry or "still")    ▼                │
//! │         │                   │                    ┌────────────┐         │
//! │         └───────────────────┼──────────────────► │   MOVING   │         │
//! │                             └─────────────────── └────────────┘         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The tracker performs no I/O: the engine feeds it fixes, activity
//! samples and the current monotonic time, and acts on the returned
//! decisions (persist, emit motion-change, arm timers).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::{haversine_distance, is_identical};
use crate::types::{Fix, MotionActivity};

/// Stationary radius never goes below this (meters).
pub const MIN_STATIONARY_RADIUS: f64 = 25.0;

/// Odometer ignores jumps of this size or more (meters).
pub const MAX_ODOMETER_STEP: f64 = 1_000.0;

/// Elasticity only applies to fixes at least this accurate (meters).
pub const ELASTICITY_ACCURACY_LIMIT: f64 = 100.0;

/// Allowed stop-timeout range.
pub const MIN_STOP_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_STOP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Settings
// =============================================================================

/// Tuning knobs of the motion tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSettings {
    pub desired_accuracy: f64,
    pub distance_filter: f64,
    pub stationary_radius: f64,
    pub stop_timeout: Duration,
    pub disable_elasticity: bool,
    pub elasticity_multiplier: f64,
    pub allow_identical_locations: bool,
    /// Consecutive inaccurate fixes rejected before one is let through.
    pub max_rejected_fixes: u32,
    /// Activity samples below this confidence are ignored.
    pub min_activity_confidence: u8,
}

impl Default for MotionSettings {
    fn default() -> Self {
        MotionSettings {
            desired_accuracy: 100.0,
            distance_filter: 10.0,
            stationary_radius: MIN_STATIONARY_RADIUS,
            stop_timeout: MAX_STOP_TIMEOUT,
            disable_elasticity: false,
            elasticity_multiplier: 1.0,
            allow_identical_locations: false,
            max_rejected_fixes: 3,
            min_activity_confidence: 75,
        }
    }
}

impl MotionSettings {
    pub fn effective_stationary_radius(&self) -> f64 {
        self.stationary_radius.max(MIN_STATIONARY_RADIUS)
    }

    pub fn effective_stop_timeout(&self) -> Duration {
        self.stop_timeout.clamp(MIN_STOP_TIMEOUT, MAX_STOP_TIMEOUT)
    }

    /// Fixes less accurate than this are rejected.
    pub fn accuracy_limit(&self) -> f64 {
        if self.disable_elasticity {
            self.desired_accuracy
        } else {
            self.desired_accuracy * self.elasticity_multiplier.max(1.0)
        }
    }

    /// Distance filter scaled by speed.
    ///
    /// `df + df × multiplier × round(speed / 5)`, applied only when
    /// elasticity is on and the fix is accurate enough to trust its speed.
    pub fn distance_filter_for(&self, fix: &Fix) -> f64 {
        let base = self.distance_filter;
        match fix.known_speed() {
            Some(speed) if !self.disable_elasticity && fix.accuracy <= ELASTICITY_ACCURACY_LIMIT => {
                let steps = (speed / 5.0 + 0.5).floor();
                base + base * self.elasticity_multiplier * steps
            }
            _ => base,
        }
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Engine-level motion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MotionState {
    Stationary,
    Moving,
    /// A moving activity was reported; waiting for a fix to confirm.
    Acquiring,
}

impl MotionState {
    pub fn is_moving(&self) -> bool {
        !matches!(self, MotionState::Stationary)
    }
}

/// Why a fix was dropped before any state logic ran.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    Inaccurate { accuracy: f64, limit: f64 },
    Identical,
}

/// What the engine should do with a fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixDecision {
    /// Discarded entirely.
    Rejected(RejectReason),
    /// Usable, but no record is due (inside the distance filter, or
    /// stationary within the radius).
    Filtered,
    /// Moving: persist as a tracking record.
    Accepted { distance: f64 },
    /// STATIONARY/ACQUIRING → MOVING, this fix triggered it.
    StartedMoving { distance: f64 },
    /// MOVING → STATIONARY, this fix is the stop location.
    Stopped,
}

/// Result of feeding an activity sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivityDecision {
    /// Below the confidence threshold.
    Ignored,
    /// Recorded; `changed` tells whether the activity type changed.
    Recorded { changed: bool },
    /// Recorded and the engine left STATIONARY (now ACQUIRING).
    BeganMoving,
}

// =============================================================================
// Tracker
// =============================================================================

/// Motion state machine plus odometer.
#[derive(Debug, Clone)]
pub struct MotionTracker {
    settings: MotionSettings,
    state: MotionState,
    odometer: f64,
    last_accepted: Option<Fix>,
    stationary_ref: Option<Fix>,
    stop_ref: Option<(Fix, Instant)>,
    still_since: Option<Instant>,
    rejected_in_a_row: u32,
    activity: Option<MotionActivity>,
}

impl MotionTracker {
    pub fn new(settings: MotionSettings, is_moving: bool, odometer: f64) -> Self {
        MotionTracker {
            settings,
            state: if is_moving {
                MotionState::Moving
            } else {
                MotionState::Stationary
            },
            odometer,
            last_accepted: None,
            stationary_ref: None,
            stop_ref: None,
            still_since: None,
            rejected_in_a_row: 0,
            activity: None,
        }
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: MotionSettings) {
        self.settings = settings;
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn is_moving(&self) -> bool {
        self.state.is_moving()
    }

    pub fn odometer(&self) -> f64 {
        self.odometer
    }

    pub fn set_odometer(&mut self, value: f64) {
        self.odometer = value.max(0.0);
    }

    pub fn activity(&self) -> Option<MotionActivity> {
        self.activity
    }

    pub fn last_accepted(&self) -> Option<&Fix> {
        self.last_accepted.as_ref()
    }

    /// Forces a motion state (host `change_pace`), resetting references.
    pub fn set_moving(&mut self, moving: bool, now: Instant) {
        self.still_since = None;
        if moving {
            self.state = MotionState::Moving;
            self.stop_ref = self.last_accepted.clone().map(|fix| (fix, now));
        } else {
            self.state = MotionState::Stationary;
            self.stationary_ref = self.last_accepted.clone();
            self.stop_ref = None;
        }
    }

    /// Feeds one fix.
    pub fn on_fix(&mut self, fix: &Fix, now: Instant) -> FixDecision {
        if let Some(reason) = self.gate(fix) {
            debug!(?reason, accuracy = fix.accuracy, "Fix rejected");
            return FixDecision::Rejected(reason);
        }

        match self.state {
            MotionState::Stationary => self.on_stationary_fix(fix, now),
            MotionState::Acquiring => {
                let distance = self.advance(fix);
                self.enter_moving(fix, now);
                FixDecision::StartedMoving { distance }
            }
            MotionState::Moving => self.on_moving_fix(fix, now),
        }
    }

    /// Accuracy gate alone, for fixes that only feed geofence evaluation.
    /// Shares the rejection budget with [`on_fix`](Self::on_fix) and leaves
    /// motion state and odometer untouched.
    pub fn screen(&mut self, fix: &Fix) -> Result<(), RejectReason> {
        match self.accuracy_gate(fix) {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Feeds one motion-activity sample.
    pub fn on_activity(&mut self, sample: MotionActivity, now: Instant) -> ActivityDecision {
        if sample.confidence < self.settings.min_activity_confidence {
            return ActivityDecision::Ignored;
        }

        let changed = self.activity.map(|a| a.activity) != Some(sample.activity);
        self.activity = Some(sample);

        match self.state {
            MotionState::Stationary if sample.activity.is_moving() => {
                debug!(activity = %sample.activity, "Moving activity while stationary");
                self.state = MotionState::Acquiring;
                ActivityDecision::BeganMoving
            }
            MotionState::Moving if !sample.activity.is_moving() => {
                self.still_since.get_or_insert(now);
                ActivityDecision::Recorded { changed }
            }
            MotionState::Moving => {
                self.still_since = None;
                ActivityDecision::Recorded { changed }
            }
            _ => ActivityDecision::Recorded { changed },
        }
    }

    /// Earliest instant at which a stop could be declared without new fixes.
    pub fn next_stop_deadline(&self) -> Option<Instant> {
        if self.state != MotionState::Moving {
            return None;
        }
        let timeout = self.settings.effective_stop_timeout();
        let geometric = self.stop_ref.as_ref().map(|(_, since)| *since + timeout);
        let still = self.still_since.map(|since| since + timeout);
        match (geometric, still) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Declares STATIONARY when the stop timeout elapsed with no fix
    /// leaving the stop radius. Returns true on transition.
    pub fn check_stop_timeout(&mut self, now: Instant) -> bool {
        match self.next_stop_deadline() {
            Some(deadline) if deadline <= now => {
                self.enter_stationary(self.last_accepted.clone());
                true
            }
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn gate(&mut self, fix: &Fix) -> Option<RejectReason> {
        if !self.settings.allow_identical_locations {
            if let Some(last) = &self.last_accepted {
                if is_identical(last.coordinate(), fix.coordinate()) {
                    return Some(RejectReason::Identical);
                }
            }
        }

        self.accuracy_gate(fix)
    }

    fn accuracy_gate(&mut self, fix: &Fix) -> Option<RejectReason> {
        let limit = self.settings.accuracy_limit();
        if fix.accuracy > limit {
            if self.rejected_in_a_row < self.settings.max_rejected_fixes {
                self.rejected_in_a_row += 1;
                return Some(RejectReason::Inaccurate {
                    accuracy: fix.accuracy,
                    limit,
                });
            }
            debug!(
                rejected = self.rejected_in_a_row,
                "Rejection budget exhausted, accepting inaccurate fix"
            );
        }
        self.rejected_in_a_row = 0;
        None
    }

    fn on_stationary_fix(&mut self, fix: &Fix, now: Instant) -> FixDecision {
        let Some(reference) = self.stationary_ref.clone() else {
            self.stationary_ref = Some(fix.clone());
            self.last_accepted.get_or_insert_with(|| fix.clone());
            return FixDecision::Filtered;
        };

        let raw = haversine_distance(reference.coordinate(), fix.coordinate());
        let margin_distance = raw - reference.accuracy - fix.accuracy;

        if margin_distance > self.settings.effective_stationary_radius() {
            debug!(
                distance = raw,
                radius = self.settings.effective_stationary_radius(),
                "Exited stationary radius"
            );
            let distance = self.advance(fix);
            self.enter_moving(fix, now);
            FixDecision::StartedMoving { distance }
        } else {
            FixDecision::Filtered
        }
    }

    fn on_moving_fix(&mut self, fix: &Fix, now: Instant) -> FixDecision {
        // Stop detection: a fix leaving the stop radius restarts the clock.
        match &self.stop_ref {
            Some((reference, _)) => {
                let distance = haversine_distance(reference.coordinate(), fix.coordinate())
                    - reference.accuracy
                    - fix.accuracy;
                if distance > self.settings.effective_stationary_radius() {
                    self.stop_ref = Some((fix.clone(), now));
                    self.still_since = None;
                }
            }
            None => self.stop_ref = Some((fix.clone(), now)),
        }

        let distance = self
            .last_accepted
            .as_ref()
            .map(|last| haversine_distance(last.coordinate(), fix.coordinate()));

        let stop_due = matches!(self.next_stop_deadline(), Some(deadline) if deadline <= now);
        if stop_due {
            self.advance(fix);
            self.enter_stationary(Some(fix.clone()));
            return FixDecision::Stopped;
        }

        match distance {
            Some(d) if d < self.settings.distance_filter_for(fix) => FixDecision::Filtered,
            _ => {
                let distance = self.advance(fix);
                FixDecision::Accepted { distance }
            }
        }
    }

    /// Accepts the fix as the new odometer anchor; returns the distance
    /// from the previous anchor.
    fn advance(&mut self, fix: &Fix) -> f64 {
        let distance = match &self.last_accepted {
            Some(last) => {
                let d = haversine_distance(last.coordinate(), fix.coordinate());
                let noise_floor = (last.accuracy + fix.accuracy) / 2.0;
                if d >= noise_floor && d < MAX_ODOMETER_STEP {
                    self.odometer += d;
                }
                d
            }
            None => 0.0,
        };
        self.last_accepted = Some(fix.clone());
        distance
    }

    fn enter_moving(&mut self, fix: &Fix, now: Instant) {
        self.state = MotionState::Moving;
        self.stationary_ref = None;
        self.stop_ref = Some((fix.clone(), now));
        self.still_since = None;
    }

    fn enter_stationary(&mut self, reference: Option<Fix>) {
        debug!(odometer = self.odometer, "Entering stationary state");
        self.state = MotionState::Stationary;
        self.stationary_ref = reference;
        self.stop_ref = None;
        self.still_since = None;
    }
}
