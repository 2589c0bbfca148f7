//! # Location State Engine
//!
//! Drives the core [`MotionTracker`] from the provider streams and turns
//! its decisions into records, events and geofence evaluations.
//!
//! ## Session Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  start(mode) ── permission ── provider streams ── spawn run loop        │
//! │                                                                         │
//! │  run loop (holds a background lease for its whole life)                 │
//! │    select! {                                                            │
//! │      fix       ──► MotionTracker::on_fix ──► record / motionchange      │
//! │      activity  ──► MotionTracker::on_activity ──► activitychange        │
//! │      stop timer──► MotionTracker::check_stop_timeout ──► motionchange   │
//! │      rearm     ──► recompute the stop deadline                          │
//! │    }                                                                    │
//! │                                                                         │
//! │  every usable fix ──► GeofenceRegistry::evaluate                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! In `geofence` mode fixes only feed the registry: no tracking records are
//! persisted and no motion state is computed. They still pass the accuracy
//! gate first.
//!
//! One-shot requests and watches run beside the session and are cancelled
//! by [`LocationEngine::stop`]. A request remembers the stop generation it
//! began in, so a stop landing before the request first waits still
//! cancels it.
//!
//! The motion flag and odometer are written through
//! [`RecordSink::save_motion`] whenever they change, and handed back with
//! [`LocationEngine::restore_motion`] on the next launch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use geotrack_core::motion::{ActivityDecision, FixDecision, MotionSettings, MotionTracker};
use geotrack_core::platform::{BackgroundLease, LeaseGuard};
use geotrack_core::{
    ActivityType, EventBus, Extras, Fix, LocationEvent, LocationRecord, MotionActivity,
    TrackerEvent, TrackingMode,
};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::geofence::GeofenceRegistry;
use crate::provider::{PositionProvider, ProviderSettings};
use crate::request::{
    acquire_fix, CurrentPosition, CurrentPositionRequest, WatchCallback, WatchId, WatchRequest,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_SAMPLES,
};
use crate::sink::RecordSink;
use crate::{lock, monotonic_now};

/// Confidence attached to an activity derived from speed.
const DERIVED_ACTIVITY_CONFIDENCE: u8 = 100;

/// Cheap-to-clone handle to the engine.
#[derive(Clone)]
pub struct LocationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    provider: Arc<dyn PositionProvider>,
    motion: Mutex<MotionTracker>,
    events: Arc<EventBus>,
    sink: Arc<dyn RecordSink>,
    geofences: GeofenceRegistry,
    lease: Arc<dyn BackgroundLease>,
    /// Merged into every record.
    extras: StdMutex<Extras>,
    last_location: StdMutex<Option<LocationRecord>>,
    session: StdMutex<Option<Session>>,
    watches: StdMutex<HashMap<WatchId, JoinHandle<()>>>,
    next_watch: AtomicU64,
    rearm: Notify,
    /// Stop generation, bumped by every `stop`.
    cancel: watch::Sender<u64>,
}

struct Session {
    mode: TrackingMode,
    task: JoinHandle<()>,
}

impl LocationEngine {
    pub fn new(
        provider: Arc<dyn PositionProvider>,
        settings: MotionSettings,
        events: Arc<EventBus>,
        sink: Arc<dyn RecordSink>,
        geofences: GeofenceRegistry,
        lease: Arc<dyn BackgroundLease>,
    ) -> Self {
        LocationEngine {
            inner: Arc::new(EngineInner {
                provider,
                motion: Mutex::new(MotionTracker::new(settings, false, 0.0)),
                events,
                sink,
                geofences,
                lease,
                extras: StdMutex::new(Extras::new()),
                last_location: StdMutex::new(None),
                session: StdMutex::new(None),
                watches: StdMutex::new(HashMap::new()),
                next_watch: AtomicU64::new(0),
                rearm: Notify::new(),
                cancel: watch::channel(0).0,
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts a tracking session.
    ///
    /// Starting in the mode already running fails with `AlreadyStarted`;
    /// starting in the other mode switches sessions.
    pub async fn start(&self, mode: TrackingMode) -> EngineResult<()> {
        self.ensure_authorized().await?;
        if self.mode() == Some(mode) {
            return Err(EngineError::AlreadyStarted);
        }
        if self.halt_session() {
            debug!(%mode, "Switching tracking mode");
        }

        let (settings, is_moving) = {
            let motion = self.inner.motion.lock().await;
            let settings = ProviderSettings {
                desired_accuracy: motion.settings().desired_accuracy,
                distance_filter: motion.settings().distance_filter,
            };
            (settings, motion.is_moving())
        };
        let fixes = self.inner.provider.start_continuous_fixes(&settings).await?;
        let activity = self.inner.provider.motion_activity_stream().await?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(mode, fixes, activity).await });
        *lock(&self.inner.session) = Some(Session { mode, task });

        info!(%mode, is_moving, "Tracking started");
        Ok(())
    }

    /// Ends the session, releases the provider and cancels every pending
    /// request and watch. Returns whether a session was running.
    pub async fn stop(&self) -> bool {
        self.inner.cancel.send_modify(|generation| *generation += 1);
        let was_running = self.halt_session();
        self.inner.provider.stop_continuous_fixes().await;
        self.stop_all_watches();
        if was_running {
            info!("Tracking stopped");
        }
        was_running
    }

    /// Mode of the running session.
    pub fn mode(&self) -> Option<TrackingMode> {
        lock(&self.inner.session)
            .as_ref()
            .filter(|session| !session.task.is_finished())
            .map(|session| session.mode)
    }

    pub fn is_enabled(&self) -> bool {
        self.mode().is_some()
    }

    fn halt_session(&self) -> bool {
        match lock(&self.inner.session).take() {
            Some(session) => {
                session.task.abort();
                true
            }
            None => false,
        }
    }

    async fn ensure_authorized(&self) -> EngineResult<()> {
        let status = self.inner.provider.authorization_status().await;
        if status.is_granted() {
            Ok(())
        } else {
            warn!(?status, "Location authorization missing");
            Err(EngineError::NotAuthorized(status))
        }
    }

    // =========================================================================
    // Motion State
    // =========================================================================

    /// Forces MOVING or STATIONARY.
    ///
    /// While a location session runs, a fix is acquired for the
    /// motion-change record (falling back to the last accepted fix).
    /// Returns that record, or `None` when the pace did not change or no
    /// location is known.
    pub async fn change_pace(&self, is_moving: bool) -> EngineResult<Option<LocationRecord>> {
        let cancel = self.inner.cancel.subscribe();
        let desired_accuracy = {
            let mut motion = self.inner.motion.lock().await;
            if motion.is_moving() == is_moving {
                debug!(is_moving, "Pace unchanged");
                return Ok(None);
            }
            motion.set_moving(is_moving, monotonic_now());
            motion.settings().desired_accuracy
        };
        self.inner.rearm.notify_one();
        self.inner.checkpoint().await;
        info!(is_moving, "Pace changed");

        if self.mode() != Some(TrackingMode::Location) {
            return Ok(None);
        }

        let acquired = cancellable(
            cancel,
            acquire_fix(
                &*self.inner.provider,
                desired_accuracy,
                DEFAULT_REQUEST_TIMEOUT,
                DEFAULT_SAMPLES,
                |_| {},
            ),
        )
        .await;
        let fix = match acquired {
            Ok(acquired) => acquired.fix,
            Err(EngineError::Timeout) => {
                let last = self.inner.motion.lock().await.last_accepted().cloned();
                match last {
                    Some(fix) => fix,
                    None => {
                        warn!("No location for motion change");
                        return Ok(None);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let (odometer, activity) = {
            let motion = self.inner.motion.lock().await;
            (motion.odometer(), motion.activity())
        };
        let record = self.inner.build(
            &fix,
            LocationEvent::MotionChange,
            is_moving,
            odometer,
            activity.or_else(|| derive_activity(&fix)),
        );
        self.inner.publish_motion_change(&record).await;
        self.inner.remember(&record);
        self.inner.geofences.evaluate(&record).await;
        Ok(Some(record))
    }

    pub async fn is_moving(&self) -> bool {
        self.inner.motion.lock().await.is_moving()
    }

    pub async fn odometer(&self) -> f64 {
        self.inner.motion.lock().await.odometer()
    }

    pub async fn set_odometer(&self, value: f64) {
        self.inner.motion.lock().await.set_odometer(value);
        self.inner.checkpoint().await;
        info!(odometer = value, "Odometer set");
    }

    /// Resumes the motion flag and odometer of a previous run. Meant for
    /// start-up, before any session.
    pub async fn restore_motion(&self, is_moving: bool, odometer: f64) {
        let mut motion = self.inner.motion.lock().await;
        let settings = motion.settings().clone();
        *motion = MotionTracker::new(settings, is_moving, odometer);
        info!(is_moving, odometer, "Motion state restored");
    }

    pub async fn set_settings(&self, settings: MotionSettings) {
        self.inner.motion.lock().await.set_settings(settings);
        self.inner.rearm.notify_one();
    }

    pub fn set_extras(&self, extras: Extras) {
        *lock(&self.inner.extras) = extras;
    }

    /// Most recent location produced by any path.
    pub fn last_location(&self) -> Option<LocationRecord> {
        lock(&self.inner.last_location).clone()
    }

    // =========================================================================
    // Client Requests
    // =========================================================================

    /// Single-shot position request.
    ///
    /// Intermediate samples are emitted as `location` events with
    /// `is_sample = true`; the final record has event `current`.
    pub async fn get_current_position(
        &self,
        request: CurrentPositionRequest,
    ) -> EngineResult<CurrentPosition> {
        let cancel = self.inner.cancel.subscribe();
        self.ensure_authorized().await?;

        let inner = &self.inner;
        let (desired_accuracy, is_moving, odometer, activity) = {
            let motion = inner.motion.lock().await;
            (
                request
                    .desired_accuracy
                    .unwrap_or(motion.settings().desired_accuracy),
                motion.is_moving(),
                motion.odometer(),
                motion.activity(),
            )
        };

        let on_sample = |fix: &Fix| {
            let sample = inner
                .build(fix, LocationEvent::Current, is_moving, odometer, None)
                .with_extras(&request.extras)
                .as_sample();
            inner.events.emit(&TrackerEvent::Location(sample));
        };
        let acquired = cancellable(
            cancel,
            acquire_fix(
                &*inner.provider,
                desired_accuracy,
                request.timeout,
                request.samples,
                on_sample,
            ),
        )
        .await?;

        let record = inner
            .build(
                &acquired.fix,
                LocationEvent::Current,
                is_moving,
                odometer,
                activity.or_else(|| derive_activity(&acquired.fix)),
            )
            .with_extras(&request.extras);

        if request.persist {
            inner.sink.persist(&record).await?;
        }
        inner.events.emit(&TrackerEvent::Location(record.clone()));
        inner.remember(&record);
        inner.geofences.evaluate(&record).await;

        info!(
            accuracy = acquired.fix.accuracy,
            accuracy_met = acquired.accuracy_met,
            "Current position resolved"
        );
        Ok(CurrentPosition {
            location: record,
            accuracy_met: acquired.accuracy_met,
        })
    }

    /// Starts a recurring position stream delivered to `callback`.
    pub async fn watch_position(
        &self,
        request: WatchRequest,
        callback: WatchCallback,
    ) -> EngineResult<WatchId> {
        self.ensure_authorized().await?;

        let id = WatchId(self.inner.next_watch.fetch_add(1, Ordering::Relaxed) + 1);
        let inner = Arc::clone(&self.inner);

        // Held across spawn so a short watch cannot unregister before it
        // is registered.
        let mut watches = lock(&self.inner.watches);
        let task = tokio::spawn(async move {
            let watch = inner.run_watch(id, &request, &callback);
            match request.timeout {
                Some(timeout) => {
                    if tokio::time::timeout(timeout, watch).await.is_err() {
                        debug!(%id, "Watch expired");
                    }
                }
                None => watch.await,
            }
            lock(&inner.watches).remove(&id);
        });
        watches.insert(id, task);

        info!(%id, "Watch started");
        Ok(id)
    }

    /// Returns false when the watch is unknown or already finished.
    pub fn stop_watch_position(&self, id: WatchId) -> bool {
        match lock(&self.inner.watches).remove(&id) {
            Some(task) => {
                task.abort();
                info!(%id, "Watch stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all_watches(&self) -> usize {
        let drained: Vec<_> = lock(&self.inner.watches).drain().collect();
        for (_, task) in &drained {
            task.abort();
        }
        drained.len()
    }

    pub fn watch_count(&self) -> usize {
        lock(&self.inner.watches).len()
    }
}

/// Resolves with `Cancelled` once a `stop` happened after `cancel` was
/// subscribed, even if that stop came before this future was first polled.
async fn cancellable<T>(
    mut cancel: watch::Receiver<u64>,
    request: impl Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    tokio::select! {
        result = request => result,
        Ok(()) = cancel.changed() => {
            debug!("Position request cancelled");
            Err(EngineError::Cancelled)
        }
    }
}

// =============================================================================
// Session Internals
// =============================================================================

impl EngineInner {
    async fn run(
        self: Arc<Self>,
        mode: TrackingMode,
        mut fixes: mpsc::Receiver<Fix>,
        mut activity: mpsc::Receiver<MotionActivity>,
    ) {
        let _lease = LeaseGuard::acquire(&self.lease);
        let mut fixes_open = true;
        let mut activity_open = true;

        loop {
            let stop_deadline = match mode {
                TrackingMode::Location => self.motion.lock().await.next_stop_deadline(),
                TrackingMode::Geofence => None,
            };

            tokio::select! {
                fix = fixes.recv(), if fixes_open => match fix {
                    Some(fix) => self.on_fix(mode, fix).await,
                    None => {
                        debug!("Fix stream closed");
                        fixes_open = false;
                    }
                },
                sample = activity.recv(), if activity_open => match sample {
                    Some(sample) => self.on_activity(sample).await,
                    None => {
                        debug!("Activity stream closed");
                        activity_open = false;
                    }
                },
                _ = sleep_until(stop_deadline) => self.on_stop_timeout().await,
                _ = self.rearm.notified() => {}
            }
        }
    }

    async fn on_fix(&self, mode: TrackingMode, fix: Fix) {
        if mode == TrackingMode::Geofence {
            let (is_moving, odometer) = {
                let mut motion = self.motion.lock().await;
                if let Err(reason) = motion.screen(&fix) {
                    debug!(?reason, "Fix dropped before geofence evaluation");
                    return;
                }
                (motion.is_moving(), motion.odometer())
            };
            let record = self.build(&fix, LocationEvent::Tracking, is_moving, odometer, None);
            self.remember(&record);
            self.geofences.evaluate(&record).await;
            return;
        }

        let (decision, is_moving, odometer, activity) = {
            let mut motion = self.motion.lock().await;
            let decision = motion.on_fix(&fix, monotonic_now());
            (decision, motion.is_moving(), motion.odometer(), motion.activity())
        };
        let activity = activity.or_else(|| derive_activity(&fix));

        let record = match decision {
            FixDecision::Rejected(reason) => {
                debug!(?reason, "Fix dropped");
                return;
            }
            FixDecision::Filtered => {
                self.build(&fix, LocationEvent::Tracking, is_moving, odometer, activity)
            }
            FixDecision::Accepted { distance } => {
                debug!(distance, odometer, "Tracking fix accepted");
                let record = self.build(&fix, LocationEvent::Tracking, is_moving, odometer, activity);
                self.persist(&record).await;
                self.checkpoint().await;
                self.events.emit(&TrackerEvent::Location(record.clone()));
                record
            }
            FixDecision::StartedMoving { .. } | FixDecision::Stopped => {
                let record =
                    self.build(&fix, LocationEvent::MotionChange, is_moving, odometer, activity);
                self.publish_motion_change(&record).await;
                record
            }
        };

        self.remember(&record);
        self.geofences.evaluate(&record).await;
    }

    async fn on_activity(&self, sample: MotionActivity) {
        let decision = self.motion.lock().await.on_activity(sample, monotonic_now());
        match decision {
            ActivityDecision::Ignored => {
                debug!(
                    activity = %sample.activity,
                    confidence = sample.confidence,
                    "Activity below confidence threshold"
                );
            }
            ActivityDecision::Recorded { changed: false } => {}
            ActivityDecision::Recorded { changed: true } | ActivityDecision::BeganMoving => {
                info!(
                    activity = %sample.activity,
                    confidence = sample.confidence,
                    "Activity changed"
                );
                self.events.emit(&TrackerEvent::ActivityChange(sample));
            }
        }
    }

    async fn on_stop_timeout(&self) {
        let (fix, odometer, activity) = {
            let mut motion = self.motion.lock().await;
            if !motion.check_stop_timeout(monotonic_now()) {
                return;
            }
            (
                motion.last_accepted().cloned(),
                motion.odometer(),
                motion.activity(),
            )
        };
        info!("Stop timeout elapsed");

        if let Some(fix) = fix {
            let record = self.build(&fix, LocationEvent::MotionChange, false, odometer, activity);
            self.publish_motion_change(&record).await;
            self.remember(&record);
        }
    }

    async fn publish_motion_change(&self, record: &LocationRecord) {
        info!(
            is_moving = record.is_moving,
            odometer = record.odometer,
            "Motion change"
        );
        self.persist(record).await;
        self.checkpoint().await;
        self.events.emit(&TrackerEvent::MotionChange {
            is_moving: record.is_moving,
            location: record.clone(),
        });
        self.events.emit(&TrackerEvent::Location(record.clone()));
    }

    async fn run_watch(&self, id: WatchId, request: &WatchRequest, callback: &WatchCallback) {
        let desired_accuracy = match request.desired_accuracy {
            Some(accuracy) => accuracy,
            None => self.motion.lock().await.settings().desired_accuracy,
        };

        loop {
            match self
                .provider
                .request_one_fix(desired_accuracy, DEFAULT_REQUEST_TIMEOUT)
                .await
            {
                Ok(fix) => self.on_watch_fix(fix, desired_accuracy, request, callback).await,
                Err(EngineError::Timeout) => debug!(%id, "Watch fix timed out"),
                Err(e) => {
                    warn!(%id, error = %e, "Watch ended by provider error");
                    return;
                }
            }
            if let Some(interval) = request.interval {
                tokio::time::sleep(interval).await;
            }
        }
    }

    async fn on_watch_fix(
        &self,
        fix: Fix,
        desired_accuracy: f64,
        request: &WatchRequest,
        callback: &WatchCallback,
    ) {
        let (is_moving, odometer) = {
            let motion = self.motion.lock().await;
            (motion.is_moving(), motion.odometer())
        };
        let record = self
            .build(&fix, LocationEvent::Watch, is_moving, odometer, derive_activity(&fix))
            .with_extras(&request.extras);

        if fix.accuracy > desired_accuracy {
            callback(&record.as_sample());
            return;
        }

        if request.persist {
            self.persist(&record).await;
        }
        callback(&record);
        self.events.emit(&TrackerEvent::Location(record.clone()));
        self.remember(&record);
        self.geofences.evaluate(&record).await;
    }

    fn build(
        &self,
        fix: &Fix,
        event: LocationEvent,
        is_moving: bool,
        odometer: f64,
        activity: Option<MotionActivity>,
    ) -> LocationRecord {
        LocationRecord::from_fix(fix, event, is_moving, odometer)
            .with_activity(activity)
            .with_extras(&lock(&self.extras))
    }

    async fn persist(&self, record: &LocationRecord) {
        if let Err(e) = self.sink.persist(record).await {
            warn!(error = %e, uuid = %record.uuid, event = %record.event, "Failed to persist location");
        }
    }

    async fn checkpoint(&self) {
        let (is_moving, odometer) = {
            let motion = self.motion.lock().await;
            (motion.is_moving(), motion.odometer())
        };
        if let Err(e) = self.sink.save_motion(is_moving, odometer).await {
            warn!(error = %e, "Failed to save motion state");
        }
    }

    fn remember(&self, record: &LocationRecord) {
        *lock(&self.last_location) = Some(record.clone());
    }
}

fn derive_activity(fix: &Fix) -> Option<MotionActivity> {
    fix.known_speed()
        .map(|speed| MotionActivity::new(ActivityType::from_speed(speed), DERIVED_ACTIVITY_CONFIDENCE))
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use async_trait::async_trait;
    use chrono::Utc;
    use geotrack_core::platform::NoopLease;
    use geotrack_core::{AuthorizationStatus, EventKind, GeofenceAction, GeofenceRegion};
    use geotrack_sync::config::GeofenceConfig;
    use std::time::Duration;

    /// Keeps what it is handed.
    #[derive(Default)]
    struct MemorySink {
        persisted: StdMutex<Vec<LocationRecord>>,
        motion: StdMutex<Option<(bool, f64)>>,
    }

    impl MemorySink {
        fn persisted(&self) -> Vec<LocationRecord> {
            self.persisted.lock().unwrap().clone()
        }

        fn motion(&self) -> Option<(bool, f64)> {
            *self.motion.lock().unwrap()
        }
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn persist(&self, record: &LocationRecord) -> EngineResult<String> {
            self.persisted.lock().unwrap().push(record.clone());
            Ok(record.uuid.clone())
        }

        async fn save_motion(&self, is_moving: bool, odometer: f64) -> EngineResult<()> {
            *self.motion.lock().unwrap() = Some((is_moving, odometer));
            Ok(())
        }
    }

    struct Harness {
        engine: LocationEngine,
        provider: Arc<ScriptedProvider>,
        registry: GeofenceRegistry,
        lease: Arc<NoopLease>,
        sink: Arc<MemorySink>,
        events: Arc<StdMutex<Vec<TrackerEvent>>>,
    }

    fn harness() -> Harness {
        let provider = Arc::new(ScriptedProvider::default());
        let bus = Arc::new(EventBus::new());
        let events = Arc::new(StdMutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let events = Arc::clone(&events);
            bus.subscribe(kind, move |event| events.lock().unwrap().push(event.clone()));
        }
        let sink = Arc::new(MemorySink::default());
        let registry =
            GeofenceRegistry::new(&GeofenceConfig::default(), None, sink.clone(), Arc::clone(&bus));
        let lease = Arc::new(NoopLease::new());
        let engine = LocationEngine::new(
            provider.clone(),
            MotionSettings::default(),
            bus,
            sink.clone(),
            registry.clone(),
            lease.clone(),
        );
        Harness {
            engine,
            provider,
            registry,
            lease,
            sink,
            events,
        }
    }

    impl Harness {
        fn motion_changes(&self) -> Vec<bool> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    TrackerEvent::MotionChange { is_moving, .. } => Some(*is_moving),
                    _ => None,
                })
                .collect()
        }

        fn geofence_actions(&self) -> Vec<GeofenceAction> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    TrackerEvent::Geofence(t) => Some(t.action),
                    _ => None,
                })
                .collect()
        }

        fn locations(&self) -> Vec<LocationRecord> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    TrackerEvent::Location(record) => Some(record.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    fn fix(latitude: f64, accuracy: f64) -> Fix {
        Fix::new(latitude, -73.0, accuracy, Utc::now())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_requires_authorization() {
        let h = harness();
        h.provider.set_status(AuthorizationStatus::Denied);
        let err = h.engine.start(TrackingMode::Location).await.unwrap_err();
        assert!(matches!(err, EngineError::NotAuthorized(AuthorizationStatus::Denied)));
        assert_eq!(err.code(), 1);
        assert!(!h.engine.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_same_mode() {
        let h = harness();
        h.engine.start(TrackingMode::Location).await.unwrap();
        let err = h.engine.start(TrackingMode::Location).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyStarted));

        // other mode switches
        h.engine.start(TrackingMode::Geofence).await.unwrap();
        assert_eq!(h.engine.mode(), Some(TrackingMode::Geofence));

        assert!(h.engine.stop().await);
        assert!(!h.engine.stop().await);
        assert!(!h.provider.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_holds_lease_until_stop() {
        let h = harness();
        h.engine.start(TrackingMode::Location).await.unwrap();
        settle().await;
        assert_eq!(h.lease.outstanding(), 1);

        h.engine.stop().await;
        settle().await;
        assert_eq!(h.lease.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_stationary_radius_then_stop_timeout() {
        let h = harness();
        h.engine.start(TrackingMode::Location).await.unwrap();

        // Reference fix, then ~222 m north.
        assert!(h.provider.emit_fix(fix(45.0, 5.0)).await);
        settle().await;
        assert!(h.motion_changes().is_empty());

        h.provider.emit_fix(fix(45.002, 5.0)).await;
        settle().await;
        assert_eq!(h.motion_changes(), vec![true]);
        assert!(h.engine.is_moving().await);
        assert!(h.engine.odometer().await > 200.0);

        // No further fixes: the stop timer declares STATIONARY.
        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        assert_eq!(h.motion_changes(), vec![true, false]);
        assert!(!h.engine.is_moving().await);

        let locations = h.locations();
        assert!(locations
            .iter()
            .all(|record| record.event == LocationEvent::MotionChange));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_activity_is_ignored() {
        let h = harness();
        h.engine.start(TrackingMode::Location).await.unwrap();

        h.provider
            .emit_activity(MotionActivity::new(ActivityType::Walking, 40))
            .await;
        settle().await;
        assert!(!h.engine.is_moving().await);

        h.provider
            .emit_activity(MotionActivity::new(ActivityType::Walking, 90))
            .await;
        settle().await;
        let changes: Vec<_> = h
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, TrackerEvent::ActivityChange(_)))
            .cloned()
            .collect();
        assert_eq!(
            changes,
            vec![TrackerEvent::ActivityChange(MotionActivity::new(ActivityType::Walking, 90))]
        );
        assert!(h.engine.is_moving().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_geofence_mode_only_evaluates() {
        let h = harness();
        h.registry
            .create(vec![GeofenceRegion::circle("home", 45.0, -73.0, 200.0)])
            .await
            .unwrap();
        h.engine.start(TrackingMode::Geofence).await.unwrap();

        h.provider.emit_fix(fix(45.0, 5.0)).await;
        settle().await;

        let events = h.events.lock().unwrap().clone();
        assert!(events.iter().any(|e| matches!(
            e,
            TrackerEvent::Geofence(t) if t.identifier == "home" && t.action == GeofenceAction::Enter
        )));
        assert!(!events.iter().any(|e| matches!(e, TrackerEvent::Location(_))));
        assert!(h.engine.last_location().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_position_emits_samples() {
        let h = harness();
        h.provider.push_one_shot(Duration::from_secs(1), fix(45.0, 200.0));
        h.provider.push_one_shot(Duration::from_secs(1), fix(45.0001, 20.0));

        let request = CurrentPositionRequest {
            desired_accuracy: Some(50.0),
            ..CurrentPositionRequest::default()
        };
        let position = h.engine.get_current_position(request).await.unwrap();
        assert!(position.accuracy_met);
        assert_eq!(position.location.event, LocationEvent::Current);

        let locations = h.locations();
        assert_eq!(locations.len(), 2);
        assert!(locations[0].is_sample);
        assert!(!locations[1].is_sample);
        assert_eq!(h.engine.last_location(), Some(position.location));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_request() {
        let h = harness();
        let engine = h.engine.clone();
        let pending = tokio::spawn(async move {
            engine
                .get_current_position(CurrentPositionRequest::default())
                .await
        });

        settle().await;
        h.engine.stop().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(err.code(), 499);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_delivers_until_timeout() {
        let h = harness();
        for accuracy in [300.0, 10.0, 12.0] {
            h.provider.push_one_shot(Duration::ZERO, fix(45.0, accuracy));
        }

        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let request = WatchRequest {
            interval: Some(Duration::from_secs(1)),
            timeout: Some(Duration::from_secs(10)),
            desired_accuracy: Some(50.0),
            ..WatchRequest::default()
        };
        let id = h
            .engine
            .watch_position(
                request,
                Arc::new(move |record: &LocationRecord| {
                    sink.lock().unwrap().push(record.is_sample)
                }),
            )
            .await
            .unwrap();
        assert_eq!(h.engine.watch_count(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(*delivered.lock().unwrap(), vec![true, false, false]);
        assert_eq!(h.engine.watch_count(), 0);
        assert!(!h.engine.stop_watch_position(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_geofence_mode_drops_inaccurate_fix() {
        let h = harness();
        h.registry
            .create(vec![GeofenceRegion::circle("home", 45.0, -73.0, 200.0)])
            .await
            .unwrap();
        h.engine.start(TrackingMode::Geofence).await.unwrap();

        h.provider.emit_fix(fix(45.0, 2000.0)).await;
        settle().await;
        assert!(h.geofence_actions().is_empty());
        assert!(h.engine.last_location().is_none());

        h.provider.emit_fix(fix(45.0, 5.0)).await;
        settle().await;
        assert_eq!(h.geofence_actions(), vec![GeofenceAction::Enter]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pace_change_acquisition() {
        let h = harness();
        h.engine.start(TrackingMode::Location).await.unwrap();

        // No one-shot fix is queued: the motion-change fix is still pending.
        let engine = h.engine.clone();
        let pending = tokio::spawn(async move { engine.change_pace(true).await });
        settle().await;
        assert!(h.engine.is_moving().await);

        h.engine.stop().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));

        h.provider.push_one_shot(Duration::ZERO, fix(45.0, 5.0));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.sink.persisted().is_empty());
        assert!(h.motion_changes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_watch_and_its_records() {
        let h = harness();
        h.provider.push_one_shot(Duration::ZERO, fix(45.0, 10.0));

        let delivered = Arc::new(StdMutex::new(0usize));
        let counter = Arc::clone(&delivered);
        let request = WatchRequest {
            interval: Some(Duration::from_secs(5)),
            desired_accuracy: Some(50.0),
            persist: true,
            ..WatchRequest::default()
        };
        h.engine
            .watch_position(
                request,
                Arc::new(move |_: &LocationRecord| *counter.lock().unwrap() += 1),
            )
            .await
            .unwrap();
        settle().await;
        assert_eq!(*delivered.lock().unwrap(), 1);
        assert_eq!(h.sink.persisted().len(), 1);

        h.engine.stop().await;
        assert_eq!(h.engine.watch_count(), 0);

        for _ in 0..3 {
            h.provider.push_one_shot(Duration::ZERO, fix(45.001, 10.0));
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*delivered.lock().unwrap(), 1);
        assert_eq!(h.sink.persisted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_request_waits_still_cancels() {
        let h = harness();
        let token = h.engine.inner.cancel.subscribe();
        h.engine.stop().await;

        let result = cancellable(token, std::future::pending::<EngineResult<()>>()).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));

        // Requests that begin after the stop are unaffected.
        h.provider.push_one_shot(Duration::from_millis(5), fix(45.0, 5.0));
        assert!(h
            .engine
            .get_current_position(CurrentPositionRequest::default())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_state_is_saved_on_change() {
        let h = harness();
        h.engine.restore_motion(true, 500.0).await;
        assert!(h.engine.is_moving().await);
        assert_eq!(h.engine.odometer().await, 500.0);

        h.engine.set_odometer(750.0).await;
        assert_eq!(h.sink.motion(), Some((true, 750.0)));

        // No session: the pace still changes and is saved.
        assert!(h.engine.change_pace(false).await.unwrap().is_none());
        assert_eq!(h.sink.motion(), Some((false, 750.0)));
    }
}
