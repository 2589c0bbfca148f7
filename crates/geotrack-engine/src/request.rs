//! # Position Requests
//!
//! One-shot (`get_current_position`) and recurring (`watch_position`)
//! client requests, layered over [`PositionProvider::request_one_fix`].
//!
//! ## Sample Selection
//! ```text
//!  desired 50 m, samples 3, timeout 10 s
//!
//!  t=1s   200 m ──► sample (not good enough, best so far)
//!  t=4s    80 m ──► sample (best so far)
//!  t=8s    40 m ──► meets desired accuracy ──► resolve(40 m, accuracy_met)
//!
//!  samples exhausted or timeout with a best fix ──► resolve(best, !accuracy_met)
//!  timeout without any fix                      ──► Err(Timeout) (408)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use geotrack_core::{Extras, Fix, LocationRecord};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::provider::PositionProvider;

/// Default single-shot timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of samples taken by a single-shot request.
pub const DEFAULT_SAMPLES: u32 = 3;

// =============================================================================
// Current Position
// =============================================================================

/// Options of [`Tracker::get_current_position`](crate::Tracker::get_current_position).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentPositionRequest {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// `None` uses the configured `desired_accuracy`.
    pub desired_accuracy: Option<f64>,
    pub samples: u32,
    pub persist: bool,
    pub extras: Extras,
}

impl Default for CurrentPositionRequest {
    fn default() -> Self {
        CurrentPositionRequest {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            desired_accuracy: None,
            samples: DEFAULT_SAMPLES,
            persist: true,
            extras: Extras::new(),
        }
    }
}

/// Resolved single-shot request.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPosition {
    pub location: LocationRecord,
    /// False when the request resolved to the best available fix without
    /// reaching the desired accuracy.
    pub accuracy_met: bool,
}

/// Best fix found by [`acquire_fix`].
#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub fix: Fix,
    pub accuracy_met: bool,
}

/// Takes up to `samples` fixes within `timeout`, stopping at the first one
/// whose accuracy is at most `desired_accuracy`.
///
/// `on_sample` sees every fix that did not resolve the request.
pub async fn acquire_fix<F>(
    provider: &dyn PositionProvider,
    desired_accuracy: f64,
    timeout: Duration,
    samples: u32,
    mut on_sample: F,
) -> EngineResult<Acquired>
where
    F: FnMut(&Fix) + Send,
{
    let deadline = Instant::now() + timeout;
    let mut best: Option<Fix> = None;

    for attempt in 1..=samples.max(1) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let result = tokio::time::timeout(
            remaining,
            provider.request_one_fix(desired_accuracy, remaining),
        )
        .await;

        match result {
            Ok(Ok(fix)) => {
                debug!(attempt, accuracy = fix.accuracy, desired_accuracy, "Sample received");
                if fix.accuracy <= desired_accuracy {
                    return Ok(Acquired {
                        fix,
                        accuracy_met: true,
                    });
                }
                on_sample(&fix);
                if best.as_ref().map_or(true, |b| fix.accuracy < b.accuracy) {
                    best = Some(fix);
                }
            }
            Ok(Err(EngineError::Timeout)) | Err(_) => break,
            Ok(Err(e)) if best.is_none() => return Err(e),
            Ok(Err(e)) => {
                debug!(error = %e, "Provider failed, keeping best sample");
                break;
            }
        }
    }

    match best {
        Some(fix) => {
            debug!(accuracy = fix.accuracy, desired_accuracy, "Resolved to best-effort fix");
            Ok(Acquired {
                fix,
                accuracy_met: false,
            })
        }
        None => Err(EngineError::Timeout),
    }
}

// =============================================================================
// Watch Position
// =============================================================================

/// Options of [`Tracker::watch_position`](crate::Tracker::watch_position).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchRequest {
    /// Pause between fixes; `None` streams fixes back to back.
    #[serde(with = "opt_duration_secs")]
    pub interval: Option<Duration>,
    /// Total lifetime; `None` runs until stopped.
    #[serde(with = "opt_duration_secs")]
    pub timeout: Option<Duration>,
    pub desired_accuracy: Option<f64>,
    pub persist: bool,
    pub extras: Extras,
}

impl Default for WatchRequest {
    fn default() -> Self {
        WatchRequest {
            interval: None,
            timeout: None,
            desired_accuracy: None,
            persist: false,
            extras: Extras::new(),
        }
    }
}

/// Identifies a running watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// Receives every record produced by a watch. Records that missed the
/// desired accuracy arrive with `is_sample = true`.
pub type WatchCallback = Arc<dyn Fn(&LocationRecord) + Send + Sync>;

// =============================================================================
// Serde helpers
// =============================================================================

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
