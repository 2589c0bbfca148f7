//! # Position Provider
//!
//! The contract the engine consumes from the platform sensor layer, plus
//! [`ScriptedProvider`], a provider driven entirely by the caller.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      PositionProvider        │
//! │  authorization_status()      │──► start() permission check
//! │  start_continuous_fixes()    │──► mpsc::Receiver<Fix>      ─┐
//! │  stop_continuous_fixes()     │                              ├─► run loop
//! │  motion_activity_stream()    │──► mpsc::Receiver<Activity> ─┘
//! │  request_one_fix()           │──► current / watch requests
//! └──────────────────────────────┘
//! ```
//!
//! Streams end when the provider drops its sender; the run loop treats a
//! closed stream as "no more input", not as an error.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use geotrack_core::{AuthorizationStatus, Fix, MotionActivity};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::lock;

/// Stream buffer for fixes and activity samples.
const STREAM_CAPACITY: usize = 64;

/// Hints handed to the provider when continuous updates start.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub desired_accuracy: f64,
    pub distance_filter: f64,
}

/// Platform position source.
#[async_trait]
pub trait PositionProvider: Send + Sync {
    async fn authorization_status(&self) -> AuthorizationStatus;

    /// Begins continuous updates. Calling it again replaces the stream.
    async fn start_continuous_fixes(
        &self,
        settings: &ProviderSettings,
    ) -> EngineResult<mpsc::Receiver<Fix>>;

    async fn stop_continuous_fixes(&self);

    /// One fix, or [`EngineError::Timeout`] when none arrives in time.
    async fn request_one_fix(&self, desired_accuracy: f64, timeout: Duration) -> EngineResult<Fix>;

    async fn motion_activity_stream(&self) -> EngineResult<mpsc::Receiver<MotionActivity>>;
}

// =============================================================================
// Scripted Provider
// =============================================================================

/// Provider fed by the host (replay, simulation) or by tests.
///
/// One-shot fixes are queued with a delay measured from the moment they
/// are requested; continuous fixes and activity samples are pushed into
/// the open streams.
#[derive(Debug)]
pub struct ScriptedProvider {
    status: Mutex<AuthorizationStatus>,
    one_shot: Mutex<VecDeque<(Duration, Fix)>>,
    fixes: Mutex<Option<mpsc::Sender<Fix>>>,
    activity: Mutex<Option<mpsc::Sender<MotionActivity>>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        ScriptedProvider::new(AuthorizationStatus::Always)
    }
}

impl ScriptedProvider {
    pub fn new(status: AuthorizationStatus) -> Self {
        ScriptedProvider {
            status: Mutex::new(status),
            one_shot: Mutex::new(VecDeque::new()),
            fixes: Mutex::new(None),
            activity: Mutex::new(None),
        }
    }

    pub fn set_status(&self, status: AuthorizationStatus) {
        *lock(&self.status) = status;
    }

    /// Queues the answer to a future `request_one_fix`.
    pub fn push_one_shot(&self, delay: Duration, fix: Fix) {
        lock(&self.one_shot).push_back((delay, fix));
    }

    /// True while a continuous stream is open.
    pub fn is_streaming(&self) -> bool {
        lock(&self.fixes).as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Pushes a fix into the continuous stream. Returns false when no
    /// stream is open.
    pub async fn emit_fix(&self, fix: Fix) -> bool {
        let tx = lock(&self.fixes).clone();
        match tx {
            Some(tx) => tx.send(fix).await.is_ok(),
            None => false,
        }
    }

    /// Pushes an activity sample. Returns false when nobody listens.
    pub async fn emit_activity(&self, sample: MotionActivity) -> bool {
        let tx = lock(&self.activity).clone();
        match tx {
            Some(tx) => tx.send(sample).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl PositionProvider for ScriptedProvider {
    async fn authorization_status(&self) -> AuthorizationStatus {
        *lock(&self.status)
    }

    async fn start_continuous_fixes(
        &self,
        settings: &ProviderSettings,
    ) -> EngineResult<mpsc::Receiver<Fix>> {
        debug!(?settings, "Scripted continuous updates started");
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        *lock(&self.fixes) = Some(tx);
        Ok(rx)
    }

    async fn stop_continuous_fixes(&self) {
        lock(&self.fixes).take();
    }

    async fn request_one_fix(&self, _desired_accuracy: f64, timeout: Duration) -> EngineResult<Fix> {
        let next = lock(&self.one_shot).pop_front();
        match next {
            Some((delay, fix)) if delay <= timeout => {
                tokio::time::sleep(delay).await;
                Ok(fix)
            }
            Some((delay, fix)) => {
                tokio::time::sleep(timeout).await;
                lock(&self.one_shot).push_front((delay - timeout, fix));
                Err(EngineError::Timeout)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Err(EngineError::Timeout)
            }
        }
    }

    async fn motion_activity_stream(&self) -> EngineResult<mpsc::Receiver<MotionActivity>> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        *lock(&self.activity) = Some(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_respects_delay() {
        let provider = ScriptedProvider::default();
        provider.push_one_shot(Duration::from_secs(3), Fix::new(1.0, 2.0, 5.0, Utc::now()));

        let started = tokio::time::Instant::now();
        let fix = provider
            .request_one_fix(10.0, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(fix.latitude, 1.0);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_fix_times_out_and_stays_queued() {
        let provider = ScriptedProvider::default();
        provider.push_one_shot(Duration::from_secs(5), Fix::new(1.0, 2.0, 5.0, Utc::now()));

        let err = provider
            .request_one_fix(10.0, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout));

        let started = tokio::time::Instant::now();
        provider
            .request_one_fix(10.0, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_stream_lifecycle() {
        let provider = ScriptedProvider::default();
        assert!(!provider.emit_fix(Fix::new(0.0, 0.0, 5.0, Utc::now())).await);

        let settings = ProviderSettings {
            desired_accuracy: 10.0,
            distance_filter: 10.0,
        };
        let mut rx = provider.start_continuous_fixes(&settings).await.unwrap();
        assert!(provider.is_streaming());
        assert!(provider.emit_fix(Fix::new(0.0, 0.0, 5.0, Utc::now())).await);
        assert!(rx.recv().await.is_some());

        provider.stop_continuous_fixes().await;
        assert!(!provider.is_streaming());
        assert!(rx.recv().await.is_none());
    }
}
