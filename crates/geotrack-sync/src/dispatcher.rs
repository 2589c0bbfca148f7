//! # Sync Dispatcher
//!
//! Drains the Event Store to the remote endpoint.
//!
//! ## Flush Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        flush(trigger)                                   │
//! │                                                                         │
//! │  busy? ──yes──► FlushOutcome::Busy (coalesced)                         │
//! │    │no                                                                  │
//! │  offline? ──yes──► Err(NoConnection)          records untouched        │
//! │    │                                                                    │
//! │  autonomous and unlocked < threshold ──► BelowThreshold                │
//! │    (reaching the threshold is enough: 5 of 5 sends)                    │
//! │    │                                                                    │
//! │    ▼                                                                    │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ select_for_sync(max_batch_size)     (records now LOCKED)         │  │
//! │  │     │                                                            │  │
//! │  │     ▼                                                            │  │
//! │  │ POST / PUT  {"locations": [...]} | one record per request        │  │
//! │  │     │                                                            │  │
//! │  │     ├── 2xx ─────────► delete_all, "http" event, drain further   │  │
//! │  │     ├── 401/403 ─────► refresh, retry once ─► else unlock + Auth  │  │
//! │  │     ├── other ───────► unlock, Err(HttpResponse{status, body})   │  │
//! │  │     └── transport ───► unlock, Err(Network)                      │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  The busy flag and the background lease are scoped guards: both are    │
//! │  released on every exit path, including cancellation.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use geotrack_core::events::HttpEvent;
use geotrack_core::platform::{BackgroundLease, ConnectivityProbe, LeaseGuard};
use geotrack_core::{EventBus, Extras, LocationRecord, TrackerEvent};
use geotrack_db::{Database, LocationRepository};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::authorization::AuthorizationProvider;
use crate::config::HttpConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Triggers & Outcomes
// =============================================================================

/// What asked for a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Host called `sync()`.
    Explicit,
    /// A record was persisted.
    Persisted,
    /// The network came back.
    ConnectivityRegained,
    /// Backoff timer after a retryable failure.
    Retry,
}

impl FlushTrigger {
    /// Autonomous triggers honor `auto_sync_threshold`.
    pub fn is_autonomous(&self) -> bool {
        !matches!(self, FlushTrigger::Explicit)
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushTrigger::Explicit => write!(f, "explicit"),
            FlushTrigger::Persisted => write!(f, "persisted"),
            FlushTrigger::ConnectivityRegained => write!(f, "connectivity"),
            FlushTrigger::Retry => write!(f, "retry"),
        }
    }
}

/// Successful terminal state of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush is in flight; this one was coalesced into it.
    Busy,
    /// Nothing unlocked to send.
    Empty,
    /// Autonomous trigger with fewer unlocked records than the threshold.
    /// A count equal to the threshold is sent.
    BelowThreshold { pending: i64 },
    /// Records delivered and deleted.
    Synced { count: usize },
}

// =============================================================================
// Scoped Guards
// =============================================================================

/// Clears the busy flag on drop.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Records locked by one batch. Unresolved batches are unlocked on drop so
/// a cancelled flush cannot strand locks.
struct LockedBatch {
    repo: LocationRepository,
    uuids: Vec<String>,
}

impl LockedBatch {
    fn new(repo: LocationRepository, records: &[LocationRecord]) -> Self {
        LockedBatch {
            repo,
            uuids: records.iter().map(|r| r.uuid.clone()).collect(),
        }
    }

    /// Deletes the given delivered records from the store.
    async fn delivered(&mut self, uuids: &[String]) -> SyncResult<()> {
        self.repo.delete_uuids(uuids).await?;
        self.uuids.retain(|u| !uuids.contains(u));
        Ok(())
    }

    /// Makes every remaining record eligible again.
    async fn release(mut self) -> SyncResult<()> {
        let count = self.repo.unlock_uuids(&self.uuids).await?;
        debug!(count, "Batch unlocked");
        self.uuids.clear();
        Ok(())
    }
}

impl Drop for LockedBatch {
    fn drop(&mut self) {
        if self.uuids.is_empty() {
            return;
        }
        let uuids = std::mem::take(&mut self.uuids);
        let repo = self.repo.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(count = uuids.len(), "Abandoned batch, unlocking");
                handle.spawn(async move {
                    if let Err(e) = repo.unlock_uuids(&uuids).await {
                        warn!(?e, "Failed to unlock abandoned batch");
                    }
                });
            }
            Err(_) => warn!(count = uuids.len(), "Abandoned batch left locked until restart"),
        }
    }
}

// =============================================================================
// Request Bodies
// =============================================================================

/// Batch mode: `{"locations": [...]}`; single mode: the record object.
/// `params` are merged into the root object.
pub fn build_body(records: &[LocationRecord], batch: bool, params: &Extras) -> Value {
    let mut root = if batch {
        let mut map = Map::new();
        map.insert(
            "locations".into(),
            Value::Array(records.iter().map(LocationRecord::to_json).collect()),
        );
        map
    } else {
        match records.first().map(LocationRecord::to_json) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    };
    for (key, value) in params {
        root.insert(key.clone(), value.clone());
    }
    Value::Object(root)
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Sends locked batches and resolves them (delete or unlock).
pub struct SyncDispatcher {
    db: Database,
    client: Client,
    config: RwLock<HttpConfig>,
    authorization: RwLock<Option<Arc<dyn AuthorizationProvider>>>,
    connectivity: Arc<dyn ConnectivityProbe>,
    lease: Arc<dyn BackgroundLease>,
    events: Arc<EventBus>,
    busy: AtomicBool,
}

impl fmt::Debug for SyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDispatcher")
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl SyncDispatcher {
    pub fn new(
        db: Database,
        client: Client,
        config: HttpConfig,
        connectivity: Arc<dyn ConnectivityProbe>,
        lease: Arc<dyn BackgroundLease>,
        events: Arc<EventBus>,
    ) -> Self {
        SyncDispatcher {
            db,
            client,
            config: RwLock::new(config),
            authorization: RwLock::new(None),
            connectivity,
            lease,
            events,
            busy: AtomicBool::new(false),
        }
    }

    pub async fn set_authorization(&self, provider: Option<Arc<dyn AuthorizationProvider>>) {
        *self.authorization.write().await = provider;
    }

    pub async fn set_config(&self, config: HttpConfig) {
        *self.config.write().await = config;
    }

    pub async fn config(&self) -> HttpConfig {
        self.config.read().await.clone()
    }

    /// A flush is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_available()
    }

    /// Runs one sync attempt to its terminal outcome.
    ///
    /// ## Errors
    /// `NoConnection` when offline (nothing locked), `Authorization`,
    /// `HttpResponse` and `Network` after the failed batch was unlocked,
    /// `Storage` when the Event Store itself failed.
    pub async fn flush(&self, trigger: FlushTrigger) -> SyncResult<FlushOutcome> {
        let Some(_busy) = BusyGuard::try_acquire(&self.busy) else {
            debug!(%trigger, "Sync already in progress, coalescing");
            return Ok(FlushOutcome::Busy);
        };

        if !self.connectivity.is_available() {
            debug!(%trigger, "No connection, sync deferred");
            return Err(SyncError::NoConnection);
        }

        let config = self.config.read().await.clone();
        if !config.is_enabled() {
            return Err(SyncError::InvalidConfig("sync URL is not configured".into()));
        }

        let repo = self.db.locations();
        let threshold = i64::from(config.auto_sync_threshold).max(1);
        if trigger.is_autonomous() {
            let pending = repo.count(true).await?;
            if pending < threshold {
                return Ok(if pending == 0 {
                    FlushOutcome::Empty
                } else {
                    FlushOutcome::BelowThreshold { pending }
                });
            }
        }

        let _lease = LeaseGuard::acquire(&self.lease);
        let mut synced = 0usize;

        loop {
            let records = repo.select_for_sync(config.max_batch_size).await?;
            if records.is_empty() {
                break;
            }
            info!(count = records.len(), %trigger, "Syncing batch");

            let mut batch = LockedBatch::new(repo.clone(), &records);
            match self.deliver(&config, &records, &mut batch).await {
                Ok(()) => synced += records.len(),
                Err(e) => {
                    warn!(error = %e, "Sync failed, unlocking batch");
                    batch.release().await?;
                    return Err(e);
                }
            }

            let remaining = repo.count(true).await?;
            let drain = if trigger.is_autonomous() {
                remaining >= threshold
            } else {
                remaining > 0
            };
            if !drain {
                break;
            }
        }

        if synced == 0 {
            return Ok(FlushOutcome::Empty);
        }
        info!(count = synced, "Sync complete");
        Ok(FlushOutcome::Synced { count: synced })
    }

    /// Sends a locked batch; delivered records are deleted as they succeed.
    async fn deliver(
        &self,
        config: &HttpConfig,
        records: &[LocationRecord],
        batch: &mut LockedBatch,
    ) -> SyncResult<()> {
        if config.batch_sync {
            let body = build_body(records, true, &config.params);
            self.send_authorized(config, &body, records.len()).await?;
            let uuids: Vec<String> = records.iter().map(|r| r.uuid.clone()).collect();
            batch.delivered(&uuids).await
        } else {
            for record in records {
                let body = build_body(std::slice::from_ref(record), false, &config.params);
                self.send_authorized(config, &body, 1).await?;
                batch.delivered(std::slice::from_ref(&record.uuid)).await?;
            }
            Ok(())
        }
    }

    /// Sends once, refreshing the token and retrying once on 401/403.
    async fn send_authorized(&self, config: &HttpConfig, body: &Value, count: usize) -> SyncResult<()> {
        let provider = self.authorization.read().await.clone();

        if let Some(auth) = &provider {
            if auth.needs_refresh().await {
                debug!("Access token expired, refreshing before send");
                if let Err(e) = auth.refresh().await {
                    warn!(error = %e, "Proactive token refresh failed");
                }
            }
        }

        let (status, text) = self.send(config, body, count, provider.as_deref()).await?;
        if status.is_success() {
            return Ok(());
        }
        if !is_auth_failure(status) {
            return Err(SyncError::HttpResponse {
                status: status.as_u16(),
                body: text,
            });
        }

        let Some(auth) = provider else {
            return Err(SyncError::Authorization(format!(
                "HTTP {} and no authorization configured",
                status.as_u16()
            )));
        };
        info!(status = status.as_u16(), "Server rejected token, refreshing");
        auth.refresh().await?;

        let (status, text) = self.send(config, body, count, Some(auth.as_ref())).await?;
        if status.is_success() {
            Ok(())
        } else if is_auth_failure(status) {
            Err(SyncError::Authorization(format!(
                "HTTP {} after token refresh",
                status.as_u16()
            )))
        } else {
            Err(SyncError::HttpResponse {
                status: status.as_u16(),
                body: text,
            })
        }
    }

    /// One HTTP round trip; emits the `http` event.
    async fn send(
        &self,
        config: &HttpConfig,
        body: &Value,
        count: usize,
        auth: Option<&dyn AuthorizationProvider>,
    ) -> SyncResult<(StatusCode, String)> {
        let mut request = self
            .client
            .request(config.method.as_reqwest(), config.url.trim())
            .timeout(config.timeout())
            .json(body);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if let Some(auth) = auth {
            request = auth.apply_headers(request).await;
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.emit_http(0, false, e.to_string(), count);
                return Err(SyncError::Network(e.to_string()));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                self.emit_http(status.as_u16(), false, e.to_string(), count);
                return Err(SyncError::Network(e.to_string()));
            }
        };

        debug!(status = status.as_u16(), count, "HTTP response");
        self.emit_http(status.as_u16(), status.is_success(), text.clone(), count);
        Ok((status, text))
    }

    fn emit_http(&self, status: u16, success: bool, response_text: String, count: usize) {
        self.events.emit(&TrackerEvent::Http(HttpEvent {
            status,
            success,
            response_text,
            count,
        }));
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}
