//! # Record Sinks
//!
//! Where the location engine and the geofence registry hand finished
//! records.
//!
//! ```text
//! LocationEngine ─┐                      ┌─► Event Store (persist)
//!                 ├─► RecordSink::persist├─► retention (prune, shrink)
//! GeofenceRegistry┘                      └─► SyncAgent::notify_persisted
//! ```

use async_trait::async_trait;
use chrono::Utc;
use geotrack_core::LocationRecord;
use geotrack_db::Database;
use geotrack_sync::config::PersistenceConfig;
use geotrack_sync::SyncAgentHandle;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::EngineResult;

/// Destination of persisted records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Stores the record and returns its UUID.
    async fn persist(&self, record: &LocationRecord) -> EngineResult<String>;

    /// Remembers the motion flag and odometer for the next launch.
    async fn save_motion(&self, _is_moving: bool, _odometer: f64) -> EngineResult<()> {
        Ok(())
    }
}

// =============================================================================
// Event Store Sink
// =============================================================================

/// Persists into the Event Store, enforces retention and wakes the sync
/// agent.
pub struct StoreSink {
    db: Database,
    retention: RwLock<PersistenceConfig>,
    agent: Option<SyncAgentHandle>,
}

impl StoreSink {
    pub fn new(db: Database, retention: PersistenceConfig, agent: Option<SyncAgentHandle>) -> Self {
        StoreSink {
            db,
            retention: RwLock::new(retention),
            agent,
        }
    }

    pub async fn set_retention(&self, retention: PersistenceConfig) {
        *self.retention.write().await = retention;
    }

    /// Applies `max_days_to_persist` then `max_records_to_persist`.
    /// Failures are logged: retention is opportunistic.
    async fn enforce_retention(&self) {
        let retention = self.retention.read().await.clone();
        let locations = self.db.locations();

        if retention.max_days_to_persist > 0 {
            match locations.prune(retention.max_days_to_persist, Utc::now()).await {
                Ok(0) => {}
                Ok(n) => debug!(pruned = n, "Expired records removed"),
                Err(e) => warn!(error = %e, "Prune failed"),
            }
        }
        if retention.max_records_to_persist > 0 {
            match locations.shrink(retention.max_records_to_persist).await {
                Ok(0) => {}
                Ok(n) => debug!(evicted = n, "Oldest records evicted"),
                Err(e) => warn!(error = %e, "Shrink failed"),
            }
        }
    }
}

#[async_trait]
impl RecordSink for StoreSink {
    async fn persist(&self, record: &LocationRecord) -> EngineResult<String> {
        let uuid = self.db.locations().persist(record).await?;
        debug!(%uuid, event = %record.event, "Record persisted");

        self.enforce_retention().await;

        if let Some(agent) = &self.agent {
            agent.notify_persisted();
        }
        Ok(uuid)
    }

    async fn save_motion(&self, is_moving: bool, odometer: f64) -> EngineResult<()> {
        self.db.motion_state().save(is_moving, odometer).await?;
        Ok(())
    }
}

/// Sink for hosts that only want events: nothing is stored.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl RecordSink for DiscardSink {
    async fn persist(&self, record: &LocationRecord) -> EngineResult<String> {
        Ok(record.uuid.clone())
    }
}
