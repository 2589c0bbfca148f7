//! # Tracker
//!
//! The top-level orchestrator. It owns one instance of every component and
//! is the only surface the host application talks to.
//!
//! ## Ownership
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Tracker                                   │
//! │                                                                         │
//! │  TrackerConfig (RwLock) ──── set_config(): diff ──► react per section   │
//! │                                                                         │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌────────────────────────┐  │
//! │  │ LocationEngine │─►│ GeofenceRegistry │  │  ScheduleController    │  │
//! │  └───────┬────────┘  └────────┬─────────┘  │  (weak ref to tracker) │  │
//! │          │                    │            └────────────────────────┘  │
//! │          ▼                    ▼                                         │
//! │  ┌─────────────────────────────────────┐   ┌────────────────────────┐  │
//! │  │ StoreSink ─► Event Store (SQLite)   │──►│ SyncAgent ─► Dispatcher│  │
//! │  └─────────────────────────────────────┘   └────────────────────────┘  │
//! │                                                                         │
//! │  EventBus ◄── every component emits; the host subscribes per kind      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Start-up (`ready`)
//! 1. Validate the configuration
//! 2. Unlock every stored record (no sync attempt survives a restart)
//! 3. Build the dispatcher, authorization and sync agent
//! 4. Reload persisted geofences
//! 5. Resume the saved motion flag and odometer
//! 6. Wire connectivity changes to `connectivitychange` events

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use geotrack_core::platform::{BackgroundLease, ConnectivityProbe, ManualConnectivity, NoopLease};
use geotrack_core::{
    EventBus, EventKind, GeofenceRegion, ListenerId, LocationRecord, ProviderState, TrackerEvent,
    TrackingMode,
};
use geotrack_db::Database;
use geotrack_sync::{
    AuthorizationConfig, AuthorizationProvider, ConfigChange, FlushOutcome, RetryPolicy, SyncAgent,
    SyncAgentHandle, SyncDispatcher, SyncError, SyncStatus, TokenAuthorization, TrackerConfig,
};
use reqwest::Client;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::geofence::GeofenceRegistry;
use crate::location::LocationEngine;
use crate::lock;
use crate::provider::PositionProvider;
use crate::request::{CurrentPosition, CurrentPositionRequest, WatchCallback, WatchId, WatchRequest};
use crate::scheduler::{LocalClock, ScheduleController, ScheduleTarget, WallClock};
use crate::sink::StoreSink;

// =============================================================================
// Dependencies
// =============================================================================

/// Collaborators handed to [`Tracker::ready`].
pub struct TrackerDeps {
    pub db: Database,
    pub provider: Arc<dyn PositionProvider>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub lease: Arc<dyn BackgroundLease>,
    pub clock: Arc<dyn WallClock>,
}

impl TrackerDeps {
    /// Always-online connectivity, a no-op lease and the local clock.
    pub fn new(db: Database, provider: Arc<dyn PositionProvider>) -> Self {
        TrackerDeps {
            db,
            provider,
            connectivity: Arc::new(ManualConnectivity::new(true)),
            lease: Arc::new(NoopLease::new()),
            clock: Arc::new(LocalClock),
        }
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_lease(mut self, lease: Arc<dyn BackgroundLease>) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Cheap-to-clone handle to the running tracker.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    config: RwLock<TrackerConfig>,
    db: Database,
    client: Client,
    events: Arc<EventBus>,
    engine: LocationEngine,
    geofences: GeofenceRegistry,
    sink: Arc<StoreSink>,
    dispatcher: Arc<SyncDispatcher>,
    agent: SyncAgentHandle,
    authorization: RwLock<Option<Arc<TokenAuthorization>>>,
    scheduler: ScheduleController,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    /// Builds every component and restores persisted state.
    pub async fn ready(config: TrackerConfig, deps: TrackerDeps) -> EngineResult<Tracker> {
        config.validate()?;

        let TrackerDeps {
            db,
            provider,
            connectivity,
            lease,
            clock,
        } = deps;

        let unlocked = db.locations().unlock_all().await?;
        if unlocked > 0 {
            info!(unlocked, "Records left locked by a previous run were released");
        }

        let events = Arc::new(EventBus::new());
        let client = Client::builder().build().map_err(SyncError::from)?;

        let dispatcher = Arc::new(SyncDispatcher::new(
            db.clone(),
            client.clone(),
            config.http.clone(),
            Arc::clone(&connectivity),
            Arc::clone(&lease),
            Arc::clone(&events),
        ));

        let authorization = match &config.authorization {
            Some(auth) => {
                let provider = Arc::new(TokenAuthorization::new(
                    auth.clone(),
                    client.clone(),
                    Arc::clone(&events),
                ));
                dispatcher
                    .set_authorization(Some(provider.clone() as Arc<dyn AuthorizationProvider>))
                    .await;
                Some(provider)
            }
            None => None,
        };

        let agent = SyncAgent::spawn(
            Arc::clone(&dispatcher),
            &connectivity,
            RetryPolicy {
                initial: Duration::from_secs(config.http.retry_initial_secs),
                max: Duration::from_secs(config.http.retry_max_secs),
            },
        );

        let sink = Arc::new(StoreSink::new(
            db.clone(),
            config.persistence.clone(),
            Some(agent.clone()),
        ));

        let geofences = GeofenceRegistry::new(
            &config.geofence,
            Some(db.geofences()),
            sink.clone(),
            Arc::clone(&events),
        );
        let loaded = geofences.load().await?;

        let engine = LocationEngine::new(
            provider,
            config.motion_settings(),
            Arc::clone(&events),
            sink.clone(),
            geofences.clone(),
            lease,
        );
        engine.set_extras(config.http.extras.clone());
        if let Some(saved) = db.motion_state().load().await? {
            engine.restore_motion(saved.is_moving, saved.odometer).await;
        }

        let scheduler = ScheduleController::new(config.schedule()?, clock);

        let bus = Arc::clone(&events);
        connectivity.on_change(Box::new(move |connected| {
            bus.emit(&TrackerEvent::ConnectivityChange { connected });
        }));

        info!(
            geofences = loaded,
            sync = config.http.is_enabled(),
            online = connectivity.is_available(),
            "Tracker ready"
        );

        Ok(Tracker {
            inner: Arc::new(TrackerInner {
                config: RwLock::new(config),
                db,
                client,
                events,
                engine,
                geofences,
                sink,
                dispatcher,
                agent,
                authorization: RwLock::new(authorization),
                scheduler,
                heartbeat: StdMutex::new(None),
            }),
        })
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn remove_all_listeners(&self) {
        self.inner.events.remove_all_listeners();
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts full location tracking.
    pub async fn start(&self) -> EngineResult<()> {
        self.inner.start_mode(TrackingMode::Location).await
    }

    /// Starts geofence-only tracking.
    pub async fn start_geofences(&self) -> EngineResult<()> {
        self.inner.start_mode(TrackingMode::Geofence).await
    }

    /// Stops tracking. Always succeeds; returns whether it was running.
    ///
    /// A running schedule turns tracking back on at its next evaluation
    /// if a window is still open.
    pub async fn stop(&self) -> bool {
        self.inner.stop().await
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.engine.is_enabled()
    }

    pub fn tracking_mode(&self) -> Option<TrackingMode> {
        self.inner.engine.mode()
    }

    /// Starts the schedule. Returns false when it was already running.
    pub fn start_schedule(&self) -> bool {
        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let target: Weak<dyn ScheduleTarget> = weak;
        self.inner.scheduler.start(target)
    }

    /// Stops the schedule; tracking stays in its current state.
    pub fn stop_schedule(&self) -> bool {
        self.inner.scheduler.stop()
    }

    pub fn is_schedule_running(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    /// Stops everything and shuts the sync agent down.
    pub async fn shutdown(&self) {
        self.inner.scheduler.stop();
        self.inner.stop().await;
        self.inner.agent.shutdown().await;
        info!("Tracker shut down");
    }

    // =========================================================================
    // Location
    // =========================================================================

    pub async fn change_pace(&self, is_moving: bool) -> EngineResult<Option<LocationRecord>> {
        self.inner.engine.change_pace(is_moving).await
    }

    pub async fn is_moving(&self) -> bool {
        self.inner.engine.is_moving().await
    }

    pub async fn get_current_position(
        &self,
        request: CurrentPositionRequest,
    ) -> EngineResult<CurrentPosition> {
        self.inner.engine.get_current_position(request).await
    }

    pub async fn watch_position(
        &self,
        request: WatchRequest,
        callback: WatchCallback,
    ) -> EngineResult<WatchId> {
        self.inner.engine.watch_position(request, callback).await
    }

    pub fn stop_watch_position(&self, id: WatchId) -> bool {
        self.inner.engine.stop_watch_position(id)
    }

    pub fn stop_all_watches(&self) -> usize {
        self.inner.engine.stop_all_watches()
    }

    pub async fn get_odometer(&self) -> f64 {
        self.inner.engine.odometer().await
    }

    pub async fn set_odometer(&self, value: f64) {
        self.inner.engine.set_odometer(value).await;
    }

    pub fn last_location(&self) -> Option<LocationRecord> {
        self.inner.engine.last_location()
    }

    // =========================================================================
    // Geofences
    // =========================================================================

    pub async fn add_geofence(&self, region: GeofenceRegion) -> EngineResult<()> {
        self.inner.geofences.create(vec![region]).await
    }

    /// All or nothing.
    pub async fn add_geofences(&self, regions: Vec<GeofenceRegion>) -> EngineResult<()> {
        self.inner.geofences.create(regions).await
    }

    pub async fn remove_geofence(&self, identifier: &str) -> EngineResult<()> {
        self.inner.geofences.destroy(&[identifier.to_string()]).await
    }

    /// An empty list removes every geofence.
    pub async fn remove_geofences(&self, identifiers: &[String]) -> EngineResult<()> {
        self.inner.geofences.destroy(identifiers).await
    }

    pub async fn get_geofences(&self) -> Vec<GeofenceRegion> {
        self.inner.geofences.all().await
    }

    pub async fn get_geofence(&self, identifier: &str) -> Option<GeofenceRegion> {
        self.inner.geofences.get(identifier).await
    }

    pub async fn geofence_exists(&self, identifier: &str) -> bool {
        self.inner.geofences.exists(identifier).await
    }

    pub fn geofences(&self) -> &GeofenceRegistry {
        &self.inner.geofences
    }

    // =========================================================================
    // Event Store & Sync
    // =========================================================================

    /// Drains the Event Store now, regardless of `auto_sync_threshold`.
    pub async fn sync(&self) -> EngineResult<FlushOutcome> {
        Ok(self.inner.agent.flush().await?)
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.inner.agent.status().await
    }

    pub async fn get_locations(&self) -> EngineResult<Vec<LocationRecord>> {
        Ok(self.inner.db.locations().all().await?)
    }

    pub async fn get_count(&self) -> EngineResult<i64> {
        Ok(self.inner.db.locations().count(false).await?)
    }

    pub async fn destroy_locations(&self) -> EngineResult<u64> {
        let removed = self.inner.db.locations().destroy_all().await?;
        info!(removed, "Event Store cleared");
        Ok(removed)
    }

    pub async fn destroy_location(&self, uuid: &str) -> EngineResult<bool> {
        Ok(self.inner.db.locations().destroy(uuid).await?)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub async fn config(&self) -> TrackerConfig {
        self.inner.config.read().await.clone()
    }

    /// Replaces the configuration and applies what changed.
    ///
    /// Returns the changed fields; an invalid configuration is rejected
    /// without touching the running one.
    pub async fn set_config(&self, config: TrackerConfig) -> EngineResult<Vec<ConfigChange>> {
        config.validate()?;
        let schedule = config.schedule()?;

        let changes = {
            let mut current = self.inner.config.write().await;
            let changes = current.diff(&config);
            *current = config.clone();
            changes
        };
        if changes.is_empty() {
            debug!("Configuration unchanged");
            return Ok(changes);
        }
        for change in &changes {
            info!(field = %change.field, old = %change.old, new = %change.new, "Config changed");
        }

        let touched = |section: &str| changes.iter().any(|c| c.in_section(section));
        let inner = &self.inner;

        if touched("geolocation") || touched("activity") {
            inner.engine.set_settings(config.motion_settings()).await;
        }
        if touched("http") {
            inner.dispatcher.set_config(config.http.clone()).await;
            inner.engine.set_extras(config.http.extras.clone());
        }
        if touched("persistence") {
            inner.sink.set_retention(config.persistence.clone()).await;
        }
        if touched("geofence") {
            inner.geofences.set_config(&config.geofence).await;
        }
        if touched("authorization") {
            inner.apply_authorization(config.authorization.clone()).await;
        }
        if changes.iter().any(|c| c.field == "app.schedule") {
            inner.scheduler.set_schedule(schedule).await;
        }
        if changes.iter().any(|c| c.field == "app.heartbeat_interval_secs") && inner.engine.is_enabled() {
            inner.start_heartbeat(config.app.heartbeat_interval());
        }

        Ok(changes)
    }

    // =========================================================================
    // Host Signals
    // =========================================================================

    /// Provider state forwarded by the host.
    ///
    /// ## Errors
    /// `NotAuthorized` when the new state revoked authorization while
    /// tracking; tracking has been stopped by then.
    pub async fn on_provider_change(&self, state: ProviderState) -> EngineResult<()> {
        info!(
            enabled = state.enabled,
            status = ?state.status,
            gps = state.gps,
            network = state.network,
            "Provider changed"
        );
        let status = state.status;
        self.inner
            .events
            .emit(&TrackerEvent::ProviderChange(state));

        if !status.is_granted() && self.inner.engine.is_enabled() {
            warn!(?status, "Location authorization revoked, stopping");
            self.inner.stop().await;
            return Err(EngineError::NotAuthorized(status));
        }
        Ok(())
    }

    pub fn on_power_save_change(&self, enabled: bool) {
        info!(enabled, "Power save mode changed");
        self.inner
            .events
            .emit(&TrackerEvent::PowerSaveChange(enabled));
    }
}

// =============================================================================
// Internals
// =============================================================================

impl TrackerInner {
    async fn start_mode(&self, mode: TrackingMode) -> EngineResult<()> {
        let was_enabled = self.engine.is_enabled();
        self.engine.start(mode).await?;
        self.geofences.start();

        let interval = self.config.read().await.app.heartbeat_interval();
        self.start_heartbeat(interval);

        if !was_enabled {
            self.events.emit(&TrackerEvent::EnabledChange(true));
        }
        Ok(())
    }

    async fn stop(&self) -> bool {
        let was_enabled = self.engine.stop().await;
        self.geofences.stop();
        self.start_heartbeat(None);
        if was_enabled {
            self.events.emit(&TrackerEvent::EnabledChange(false));
        }
        was_enabled
    }

    /// (Re)starts the heartbeat; `None` only cancels it.
    fn start_heartbeat(&self, interval: Option<Duration>) {
        let mut slot = lock(&self.heartbeat);
        if let Some(task) = slot.take() {
            task.abort();
        }
        let Some(interval) = interval else {
            return;
        };

        let engine = self.engine.clone();
        let events = Arc::clone(&self.events);
        *slot = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("Heartbeat");
                events.emit(&TrackerEvent::Heartbeat {
                    location: engine.last_location(),
                });
            }
        }));
    }

    async fn apply_authorization(&self, config: Option<AuthorizationConfig>) {
        let mut slot = self.authorization.write().await;
        match (slot.as_ref(), config) {
            (Some(existing), Some(config)) => existing.update(config).await,
            (None, Some(config)) => {
                let provider = Arc::new(TokenAuthorization::new(
                    config,
                    self.client.clone(),
                    Arc::clone(&self.events),
                ));
                self.dispatcher
                    .set_authorization(Some(provider.clone() as Arc<dyn AuthorizationProvider>))
                    .await;
                *slot = Some(provider);
            }
            (_, None) => {
                self.dispatcher.set_authorization(None).await;
                *slot = None;
            }
        }
    }
}

#[async_trait]
impl ScheduleTarget for TrackerInner {
    async fn schedule_transition(&self, mode: Option<TrackingMode>) {
        match mode {
            Some(mode) => match self.start_mode(mode).await {
                Ok(()) | Err(EngineError::AlreadyStarted) => {
                    self.events
                        .emit(&TrackerEvent::Schedule { enabled: true, mode });
                }
                Err(e) => warn!(error = %e, %mode, "Scheduled start failed"),
            },
            None => {
                let mode = self.engine.mode().unwrap_or_default();
                self.stop().await;
                self.events
                    .emit(&TrackerEvent::Schedule { enabled: false, mode });
            }
        }
    }

    fn is_tracking(&self) -> bool {
        self.engine.is_enabled()
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.heartbeat).take() {
            task.abort();
        }
    }
}
