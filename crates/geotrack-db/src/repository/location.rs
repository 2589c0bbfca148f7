//! # Location Repository (Event Store)
//!
//! Durable, lockable queue of location records between production and
//! sync.
//!
//! ## Lock Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  persist(record) ──► INSERT (locked = 0)                               │
//! │                                                                         │
//! │  select_for_sync(n)                                                    │
//! │       │   ONE statement, atomic w.r.t. every other caller:             │
//! │       │   UPDATE locations SET locked = 1                              │
//! │       │   WHERE id IN (SELECT id ... WHERE locked = 0                  │
//! │       │                ORDER BY id LIMIT n)                            │
//! │       │   RETURNING ...                                                │
//! │       ▼                                                                 │
//! │  batch in flight ──┬── 2xx ──────► delete_all(batch)                   │
//! │                    └── failure ──► unlock(batch)                       │
//! │                                                                         │
//! │  process restart ──► unlock_all()   (at-least-once delivery)           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The full record is stored as JSON in `data`; the scalar columns exist
//! for ordering, retention and diagnostics.

use chrono::{DateTime, Duration, Utc};
use geotrack_core::LocationRecord;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// SQLite bind-parameter headroom for IN lists.
const IN_CHUNK: usize = 500;

#[derive(Debug, FromRow)]
struct LocationRow {
    id: i64,
    uuid: String,
    data: String,
    locked: bool,
    synced: bool,
}

impl LocationRow {
    fn decode(self) -> DbResult<LocationRecord> {
        let mut record: LocationRecord =
            serde_json::from_str(&self.data).map_err(|e| DbError::Corrupt {
                id: self.uuid.clone(),
                reason: e.to_string(),
            })?;
        record.uuid = self.uuid;
        record.locked = self.locked;
        record.synced = self.synced;
        Ok(record)
    }
}

/// Repository over the `locations` table.
#[derive(Debug, Clone)]
pub struct LocationRepository {
    pool: SqlitePool,
}

impl LocationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LocationRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Inserts a record unlocked and returns its UUID.
    ///
    /// A record without a UUID gets a fresh v4 identifier.
    pub async fn persist(&self, record: &LocationRecord) -> DbResult<String> {
        let mut record = record.clone();
        if record.uuid.trim().is_empty() {
            record.uuid = Uuid::new_v4().to_string();
        }
        record.locked = false;

        let data = serde_json::to_string(&record)?;

        sqlx::query(
            r#"
            INSERT INTO locations (
                uuid, timestamp, event, is_moving, odometer, data, locked, synced, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7)
            "#,
        )
        .bind(&record.uuid)
        .bind(record.timestamp)
        .bind(record.event)
        .bind(record.is_moving)
        .bind(record.odometer)
        .bind(&data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(uuid = %record.uuid, event = %record.event, "Location persisted");
        Ok(record.uuid)
    }

    /// Atomically selects up to `limit` unlocked records (insertion order)
    /// and marks them locked.
    ///
    /// Rows whose payload cannot be decoded are removed and logged; they
    /// could never be delivered.
    pub async fn select_for_sync(&self, limit: u32) -> DbResult<Vec<LocationRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut rows: Vec<LocationRow> = sqlx::query_as(
            r#"
            UPDATE locations SET locked = 1
            WHERE id IN (
                SELECT id FROM locations
                WHERE locked = 0
                ORDER BY id ASC
                LIMIT ?1
            )
            RETURNING id, uuid, data, locked, synced
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified.
        rows.sort_by_key(|row| row.id);

        let mut batch = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for row in rows {
            let uuid = row.uuid.clone();
            match row.decode() {
                Ok(record) => batch.push(record),
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "Discarding undecodable location");
                    corrupt.push(uuid);
                }
            }
        }
        if !corrupt.is_empty() {
            self.delete_uuids(&corrupt).await?;
        }

        debug!(count = batch.len(), limit, "Locked batch for sync");
        Ok(batch)
    }

    /// Clears the locked flag on the given records.
    pub async fn unlock(&self, records: &[LocationRecord]) -> DbResult<u64> {
        let uuids: Vec<&str> = records.iter().map(|r| r.uuid.as_str()).collect();
        self.unlock_uuids(&uuids).await
    }

    /// Clears the locked flag by UUID.
    pub async fn unlock_uuids<S: AsRef<str>>(&self, uuids: &[S]) -> DbResult<u64> {
        let mut affected = 0;
        for chunk in uuids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE locations SET locked = 0 WHERE uuid IN (");
            push_in_list(&mut qb, chunk);
            affected += qb.build().execute(&self.pool).await?.rows_affected();
        }
        debug!(count = affected, "Unlocked records");
        Ok(affected)
    }

    /// Unlocks every record. Run once at start-up: no batch survives a
    /// process restart.
    pub async fn unlock_all(&self) -> DbResult<u64> {
        let affected = sqlx::query("UPDATE locations SET locked = 0 WHERE locked = 1")
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected > 0 {
            info!(count = affected, "Released locks left by a previous run");
        }
        Ok(affected)
    }

    /// Permanently removes the given records (after confirmed delivery).
    pub async fn delete_all(&self, records: &[LocationRecord]) -> DbResult<u64> {
        let uuids: Vec<&str> = records.iter().map(|r| r.uuid.as_str()).collect();
        self.delete_uuids(&uuids).await
    }

    /// Removes records by UUID.
    pub async fn delete_uuids<S: AsRef<str>>(&self, uuids: &[S]) -> DbResult<u64> {
        let mut affected = 0;
        for chunk in uuids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM locations WHERE uuid IN (");
            push_in_list(&mut qb, chunk);
            affected += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(affected)
    }

    /// Removes one record. Returns false when it did not exist.
    pub async fn destroy(&self, uuid: &str) -> DbResult<bool> {
        Ok(self.delete_uuids(&[uuid]).await? > 0)
    }

    /// Removes every record, locked or not.
    pub async fn destroy_all(&self) -> DbResult<u64> {
        let affected = sqlx::query("DELETE FROM locations")
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(count = affected, "Destroyed all locations");
        Ok(affected)
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Deletes unlocked records older than `max_days` relative to `now`.
    /// `max_days <= 0` disables pruning.
    pub async fn prune(&self, max_days: i64, now: DateTime<Utc>) -> DbResult<u64> {
        if max_days <= 0 {
            return Ok(0);
        }
        let cutoff = now - Duration::days(max_days);

        let affected = sqlx::query("DELETE FROM locations WHERE locked = 0 AND timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected > 0 {
            info!(count = affected, max_days, "Pruned old locations");
        }
        Ok(affected)
    }

    /// Keeps at most `max_records` rows, evicting the oldest unlocked ones.
    /// `max_records <= 0` disables shrinking.
    pub async fn shrink(&self, max_records: i64) -> DbResult<u64> {
        if max_records <= 0 {
            return Ok(0);
        }

        let affected = sqlx::query(
            r#"
            DELETE FROM locations
            WHERE locked = 0
            AND id NOT IN (
                SELECT id FROM locations ORDER BY id DESC LIMIT ?1
            )
            "#,
        )
        .bind(max_records)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected > 0 {
            info!(count = affected, max_records, "Shrunk location store");
        }
        Ok(affected)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Counts records; `only_unlocked` restricts to those eligible for sync.
    pub async fn count(&self, only_unlocked: bool) -> DbResult<i64> {
        let sql = if only_unlocked {
            "SELECT COUNT(*) FROM locations WHERE locked = 0"
        } else {
            "SELECT COUNT(*) FROM locations"
        };
        let count: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    pub async fn find(&self, uuid: &str) -> DbResult<Option<LocationRecord>> {
        let row: Option<LocationRow> = sqlx::query_as(
            "SELECT id, uuid, data, locked, synced FROM locations WHERE uuid = ?1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LocationRow::decode).transpose()
    }

    /// Oldest record, if any.
    pub async fn first(&self) -> DbResult<Option<LocationRecord>> {
        let row: Option<LocationRow> = sqlx::query_as(
            "SELECT id, uuid, data, locked, synced FROM locations ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(LocationRow::decode).transpose()
    }

    /// Every record in insertion order. Undecodable rows are skipped.
    pub async fn all(&self) -> DbResult<Vec<LocationRecord>> {
        let rows: Vec<LocationRow> = sqlx::query_as(
            "SELECT id, uuid, data, locked, synced FROM locations ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.decode() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable location");
                    None
                }
            })
            .collect())
    }
}

fn push_in_list<'a, S: AsRef<str>>(qb: &mut QueryBuilder<'a, Sqlite>, values: &'a [S]) {
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.as_ref());
    }
    separated.push_unseparated(")");
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use geotrack_core::{
        ActivityType, Fix, LocationEvent, MotionActivity,
    };
    use pretty_assertions::assert_eq;

    async fn repo() -> LocationRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().locations()
    }

    fn record(lat: f64, at: DateTime<Utc>) -> LocationRecord {
        let fix = Fix::new(lat, -73.6, 10.0, at).with_speed(2.0);
        LocationRecord::from_fix(&fix, LocationEvent::Tracking, true, 42.0)
    }

    #[tokio::test]
    async fn test_persist_roundtrip() {
        let repo = repo().await;
        let original = record(45.5, Utc::now())
            .with_activity(Some(MotionActivity::new(ActivityType::Walking, 90)));

        let uuid = repo.persist(&original).await.unwrap();
        let stored = repo.find(&uuid).await.unwrap().unwrap();

        assert_eq!(stored, original);
    }

    #[tokio::test]
    async fn test_persist_assigns_missing_uuid() {
        let repo = repo().await;
        let mut r = record(45.5, Utc::now());
        r.uuid.clear();

        let uuid = repo.persist(&r).await.unwrap();
        assert!(Uuid::parse_str(&uuid).is_ok());
    }

    #[tokio::test]
    async fn test_select_locks_and_excludes() {
        let repo = repo().await;
        for i in 0..5 {
            repo.persist(&record(45.0 + f64::from(i), Utc::now())).await.unwrap();
        }

        let first = repo.select_for_sync(3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|r| r.locked));
        assert_eq!(first[0].coords.latitude, 45.0);

        let second = repo.select_for_sync(10).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(repo.select_for_sync(10).await.unwrap().is_empty());
        assert_eq!(repo.count(true).await.unwrap(), 0);
        assert_eq!(repo.count(false).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unlock_then_delete() {
        let repo = repo().await;
        for i in 0..3 {
            repo.persist(&record(10.0 + f64::from(i), Utc::now())).await.unwrap();
        }

        let batch = repo.select_for_sync(10).await.unwrap();
        assert_eq!(repo.unlock(&batch).await.unwrap(), 3);

        let again = repo.select_for_sync(10).await.unwrap();
        assert_eq!(again.len(), 3);

        assert_eq!(repo.delete_all(&again).await.unwrap(), 3);
        assert_eq!(repo.count(false).await.unwrap(), 0);
        assert!(repo.find(&again[0].uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlock_all_after_restart() {
        let repo = repo().await;
        repo.persist(&record(1.0, Utc::now())).await.unwrap();
        repo.select_for_sync(1).await.unwrap();

        assert_eq!(repo.unlock_all().await.unwrap(), 1);
        assert_eq!(repo.count(true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_skips_locked() {
        let repo = repo().await;
        let now = Utc::now();
        let old = now - Duration::days(3);

        repo.persist(&record(1.0, old)).await.unwrap();
        repo.persist(&record(2.0, old)).await.unwrap();
        repo.persist(&record(3.0, now)).await.unwrap();

        // Lock the oldest one as if a batch were in flight.
        let locked = repo.select_for_sync(1).await.unwrap();

        assert_eq!(repo.prune(1, now).await.unwrap(), 1);
        let left = repo.all().await.unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].uuid, locked[0].uuid);

        assert_eq!(repo.prune(0, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shrink_keeps_newest() {
        let repo = repo().await;
        for i in 0..6 {
            repo.persist(&record(f64::from(i), Utc::now())).await.unwrap();
        }

        assert_eq!(repo.shrink(4).await.unwrap(), 2);
        let first = repo.first().await.unwrap().unwrap();
        assert_eq!(first.coords.latitude, 2.0);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_discarded_on_select() {
        let repo = repo().await;
        repo.persist(&record(1.0, Utc::now())).await.unwrap();
        sqlx::query(
            "INSERT INTO locations (uuid, timestamp, data, created_at) VALUES ('bad', '2024-01-01', '{nope', '2024-01-01')",
        )
        .execute(&repo.pool)
        .await
        .unwrap();

        let batch = repo.select_for_sync(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(repo.count(false).await.unwrap(), 1);
    }
}
