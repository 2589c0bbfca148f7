//! # Schedule Controller
//!
//! Turns tracking on and off according to the configured windows.
//!
//! ```text
//!   loop {
//!     evaluation = schedule.evaluate_at(clock.now())
//!     wanted     = active window mode (None = outside every window)
//!     wanted.is_some() != target.is_tracking()
//!                 ──► target.schedule_transition(wanted)
//!     sleep until next boundary, or until set_schedule() reloads
//!   }
//! ```
//!
//! The controller only decides; the [`ScheduleTarget`] (the tracker) does
//! the starting and stopping. Each evaluation compares against the
//! target's live state, so a manual `stop()` inside an open window is
//! undone at the next evaluation (a boundary or a reload).

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use geotrack_core::schedule::{Schedule, ScheduleEvaluation};
use geotrack_core::TrackingMode;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::lock;

/// Floor for the wake timer; boundaries are always in the future, this
/// only guards against clock skew.
const MIN_WAKE: Duration = Duration::from_secs(1);

// =============================================================================
// Clocks
// =============================================================================

/// Local wall-clock time, the reference frame of schedule strings.
pub trait WallClock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The device's local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl WallClock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Wall clock that starts at `origin` and advances with the tokio clock,
/// so a paused runtime drives it.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    origin: NaiveDateTime,
    started: tokio::time::Instant,
}

impl SimulatedClock {
    pub fn new(origin: NaiveDateTime) -> Self {
        SimulatedClock {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl WallClock for SimulatedClock {
    fn now(&self) -> NaiveDateTime {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Receives the schedule's decisions.
#[async_trait]
pub trait ScheduleTarget: Send + Sync {
    /// `Some(mode)` when a window opens, `None` when tracking should stop.
    async fn schedule_transition(&self, mode: Option<TrackingMode>);

    /// Whether tracking is on right now, whoever turned it on.
    fn is_tracking(&self) -> bool;
}

pub struct ScheduleController {
    schedule: Arc<Mutex<Schedule>>,
    clock: Arc<dyn WallClock>,
    reload: Arc<Notify>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ScheduleController {
    pub fn new(schedule: Schedule, clock: Arc<dyn WallClock>) -> Self {
        ScheduleController {
            schedule: Arc::new(Mutex::new(schedule)),
            clock,
            reload: Arc::new(Notify::new()),
            task: StdMutex::new(None),
        }
    }

    /// Starts evaluating. The first evaluation applies immediately.
    /// Returns false when already running.
    pub fn start(&self, target: Weak<dyn ScheduleTarget>) -> bool {
        let mut slot = lock(&self.task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        let schedule = Arc::clone(&self.schedule);
        let clock = Arc::clone(&self.clock);
        let reload = Arc::clone(&self.reload);
        *slot = Some(tokio::spawn(run(schedule, clock, reload, target)));
        info!("Schedule started");
        true
    }

    /// Stops evaluating; tracking stays as it is.
    pub fn stop(&self) -> bool {
        match lock(&self.task).take() {
            Some(task) => {
                task.abort();
                info!("Schedule stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Replaces the windows and re-evaluates right away.
    pub async fn set_schedule(&self, schedule: Schedule) {
        *self.schedule.lock().await = schedule;
        self.reload.notify_one();
        debug!("Schedule reloaded");
    }

    /// Current evaluation, without applying it.
    pub async fn evaluate(&self) -> ScheduleEvaluation {
        self.schedule.lock().await.evaluate_at(self.clock.now())
    }
}

impl Drop for ScheduleController {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

async fn run(
    schedule: Arc<Mutex<Schedule>>,
    clock: Arc<dyn WallClock>,
    reload: Arc<Notify>,
    target: Weak<dyn ScheduleTarget>,
) {
    loop {
        let now = clock.now();
        let evaluation = schedule.lock().await.evaluate_at(now);
        let wanted = evaluation.active.as_ref().map(|window| window.mode);

        let Some(target) = target.upgrade() else {
            debug!("Schedule target dropped");
            return;
        };
        if wanted.is_some() != target.is_tracking() {
            info!(%now, mode = ?wanted, "Schedule transition");
            target.schedule_transition(wanted).await;
        }
        drop(target);

        match evaluation.next_boundary {
            Some(boundary) => {
                let delay = (boundary - clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .max(MIN_WAKE);
                debug!(%boundary, ?delay, "Schedule wake armed");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = reload.notified() => {}
                }
            }
            None => {
                debug!("No upcoming schedule window");
                reload.notified().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingTarget {
        transitions: StdMutex<Vec<Option<TrackingMode>>>,
        tracking: AtomicBool,
    }

    #[async_trait]
    impl ScheduleTarget for RecordingTarget {
        async fn schedule_transition(&self, mode: Option<TrackingMode>) {
            self.transitions.lock().unwrap().push(mode);
            self.tracking.store(mode.is_some(), Ordering::SeqCst);
        }

        fn is_tracking(&self) -> bool {
            self.tracking.load(Ordering::SeqCst)
        }
    }

    /// Monday 2024-01-01 08:00.
    fn monday_morning() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn controller(entries: &[&str]) -> ScheduleController {
        ScheduleController::new(
            Schedule::parse(entries).unwrap(),
            Arc::new(SimulatedClock::new(monday_morning())),
        )
    }

    fn start(controller: &ScheduleController, target: &Arc<RecordingTarget>) {
        let target: Arc<dyn ScheduleTarget> = target.clone();
        assert!(controller.start(Arc::downgrade(&target)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_office_hours_on_and_off() {
        let controller = controller(&["2-6 09:00-17:00"]);
        let target = Arc::new(RecordingTarget::default());
        start(&controller, &target);

        // Already stopped before 09:00, nothing to do.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(target.transitions.lock().unwrap().is_empty());

        // 09:00 opens the window.
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        assert_eq!(
            *target.transitions.lock().unwrap(),
            vec![Some(TrackingMode::Location)]
        );

        // 17:00 closes it.
        tokio::time::sleep(Duration::from_secs(8 * 60 * 60)).await;
        assert_eq!(
            *target.transitions.lock().unwrap(),
            vec![Some(TrackingMode::Location), None]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_literal_geofence_window() {
        let controller = controller(&["2024-01-01-08:30 2024-01-01-09:00 geofence"]);
        let target = Arc::new(RecordingTarget::default());
        start(&controller, &target);

        tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
        assert_eq!(
            *target.transitions.lock().unwrap(),
            vec![Some(TrackingMode::Geofence), None]
        );
        assert!(controller.evaluate().await.next_boundary.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_applies_immediately() {
        let controller = controller(&[]);
        let target = Arc::new(RecordingTarget::default());
        start(&controller, &target);
        assert!(!controller.start(Weak::<RecordingTarget>::new()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        controller
            .set_schedule(Schedule::parse(&["1-7 07:00-23:00"]).unwrap())
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            *target.transitions.lock().unwrap(),
            vec![Some(TrackingMode::Location)]
        );

        assert!(controller.stop());
        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_inside_window_is_reverted_on_next_evaluation() {
        let controller = controller(&["1-7 07:00-23:00"]);
        let target = Arc::new(RecordingTarget::default());
        start(&controller, &target);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(target.is_tracking());

        // Stopped behind the schedule's back, window still open.
        target.tracking.store(false, Ordering::SeqCst);

        controller
            .set_schedule(Schedule::parse(&["1-7 07:00-23:00"]).unwrap())
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(target.is_tracking());
        assert_eq!(
            *target.transitions.lock().unwrap(),
            vec![Some(TrackingMode::Location), Some(TrackingMode::Location)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_start_outside_window_is_stopped() {
        let controller = controller(&["1-7 18:00-23:00"]);
        let target = Arc::new(RecordingTarget::default());
        target.tracking.store(true, Ordering::SeqCst);
        start(&controller, &target);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*target.transitions.lock().unwrap(), vec![None]);
        assert!(!target.is_tracking());
    }
}
