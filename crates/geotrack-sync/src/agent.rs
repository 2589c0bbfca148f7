//! # Sync Agent
//!
//! Background task that decides *when* the dispatcher runs.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │   record persisted ──┐                                                  │
//! │   (auto_sync)        │                                                  │
//! │                      │    ┌──────────────────────────────────────┐     │
//! │   network regained ──┼───►│             SyncAgent                │     │
//! │   (ConnectivityProbe)│    │  tokio::select! over all triggers    │     │
//! │                      │    │                                      │     │
//! │   host sync() ───────┤    │  retryable error ─► backoff timer    │     │
//! │                      │    │  success ─────────► backoff reset    │     │
//! │   retry timer ───────┘    └──────────────────┬───────────────────┘     │
//! │                                              │                          │
//! │                                              ▼                          │
//! │                                   SyncDispatcher::flush(trigger)        │
//! │                                                                         │
//! │  BACKOFF (exponential, jittered): 5s, 10s, 20s ... capped at 10 min    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dispatcher itself never loops on failure; every retry is scheduled
//! here.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use geotrack_core::platform::ConnectivityProbe;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{FlushOutcome, FlushTrigger, SyncDispatcher};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot of the agent for external queries.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    /// Last time records were delivered.
    pub last_sync: Option<DateTime<Utc>>,

    /// Records delivered since the agent started.
    pub synced_total: usize,

    /// Last failure, cleared by the next successful flush.
    pub last_error: Option<String>,

    /// A retry timer is armed.
    pub retry_pending: bool,
}

// =============================================================================
// Commands
// =============================================================================

enum AgentCommand {
    Flush {
        trigger: FlushTrigger,
        reply: Option<oneshot::Sender<SyncResult<FlushOutcome>>>,
    },
    Shutdown,
}

/// Retry timing.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(10 * 60),
        }
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Owns the trigger loop around a [`SyncDispatcher`].
pub struct SyncAgent {
    dispatcher: Arc<SyncDispatcher>,
    commands: mpsc::Receiver<AgentCommand>,
    connectivity: mpsc::UnboundedReceiver<bool>,
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncAgent {
    /// Spawns the agent on the current runtime and returns its handle.
    pub fn spawn(
        dispatcher: Arc<SyncDispatcher>,
        connectivity: &Arc<dyn ConnectivityProbe>,
        policy: RetryPolicy,
    ) -> SyncAgentHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (online_tx, online_rx) = mpsc::unbounded_channel();

        connectivity.on_change(Box::new(move |online| {
            let _ = online_tx.send(online);
        }));

        let status = Arc::new(RwLock::new(SyncStatus::default()));
        let agent = SyncAgent {
            dispatcher,
            commands: command_rx,
            connectivity: online_rx,
            backoff: create_backoff(policy),
            retry_at: None,
            status: Arc::clone(&status),
        };
        tokio::spawn(agent.run());

        SyncAgentHandle {
            commands: command_tx,
            status,
        }
    }

    async fn run(mut self) {
        info!("Sync agent started");

        loop {
            let retry_at = self.retry_at;
            let retry_timer = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(AgentCommand::Flush { trigger, reply }) => {
                        let result = self.attempt(trigger).await;
                        match reply {
                            Some(reply) => {
                                let _ = reply.send(result);
                            }
                            None => {
                                if let Err(e) = result {
                                    debug!(error = %e, %trigger, "Autonomous sync did not complete");
                                }
                            }
                        }
                    }
                    Some(AgentCommand::Shutdown) | None => {
                        info!("Sync agent received shutdown");
                        break;
                    }
                },

                Some(online) = self.connectivity.recv() => {
                    if online {
                        info!("Connectivity regained");
                        let _ = self.attempt(FlushTrigger::ConnectivityRegained).await;
                    }
                }

                _ = retry_timer => {
                    self.retry_at = None;
                    let _ = self.attempt(FlushTrigger::Retry).await;
                }
            }
        }

        info!("Sync agent stopped");
    }

    /// Runs one flush and updates backoff and status from its outcome.
    async fn attempt(&mut self, trigger: FlushTrigger) -> SyncResult<FlushOutcome> {
        if trigger.is_autonomous() && !self.dispatcher.config().await.auto_sync {
            return Ok(FlushOutcome::Empty);
        }

        let result = self.dispatcher.flush(trigger).await;
        let mut status = self.status.write().await;

        match &result {
            Ok(FlushOutcome::Synced { count }) => {
                self.backoff.reset();
                self.retry_at = None;
                status.last_sync = Some(Utc::now());
                status.synced_total += count;
                status.last_error = None;
            }
            Ok(FlushOutcome::Empty) => {
                self.backoff.reset();
                self.retry_at = None;
            }
            Ok(FlushOutcome::Busy | FlushOutcome::BelowThreshold { .. }) => {}
            Err(SyncError::NoConnection) => {
                // connectivity-regained will trigger the next attempt
                self.retry_at = None;
            }
            Err(e) if e.is_retryable() => {
                status.last_error = Some(e.to_string());
                if self.retry_at.is_none() {
                    if let Some(delay) = self.backoff.next_backoff() {
                        warn!(error = %e, ?delay, "Sync failed, retry scheduled");
                        self.retry_at = Some(Instant::now() + delay);
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Sync failed, not retrying");
                status.last_error = Some(e.to_string());
                self.retry_at = None;
            }
        }

        status.retry_pending = self.retry_at.is_some();
        result
    }
}

/// Creates the exponential backoff configuration.
fn create_backoff(policy: RetryPolicy) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: policy.initial,
        max_interval: policy.max,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();
    backoff
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for controlling a running [`SyncAgent`].
#[derive(Clone)]
pub struct SyncAgentHandle {
    commands: mpsc::Sender<AgentCommand>,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncAgentHandle {
    /// A record was persisted. Coalesced when the agent is already busy.
    pub fn notify_persisted(&self) {
        let _ = self.commands.try_send(AgentCommand::Flush {
            trigger: FlushTrigger::Persisted,
            reply: None,
        });
    }

    /// Explicit sync; resolves with the flush outcome.
    pub async fn flush(&self) -> SyncResult<FlushOutcome> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(AgentCommand::Flush {
                trigger: FlushTrigger::Explicit,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        rx.await.map_err(|_| SyncError::ShuttingDown)?
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Signals the agent to shut down gracefully.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(AgentCommand::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_starts_at_initial_interval() {
        let mut backoff = create_backoff(RetryPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(600),
        });
        let first = backoff.next_backoff().unwrap();
        // default randomization factor is 0.5
        assert!(first >= Duration::from_millis(2_500) && first <= Duration::from_millis(7_500));

        for _ in 0..20 {
            backoff.next_backoff();
        }
        assert!(backoff.next_backoff().unwrap() <= Duration::from_secs(900));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial, Duration::from_secs(5));
        assert_eq!(policy.max, Duration::from_secs(600));
    }
}
