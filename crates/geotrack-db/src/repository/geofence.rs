//! # Geofence Repository
//!
//! Persisted copy of the registered region set, reloaded on start-up.
//! Inserts of several regions are all-or-nothing.

use chrono::Utc;
use geotrack_core::{Coordinate, Extras, GeofenceRegion};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};

#[derive(Debug, FromRow)]
struct GeofenceRow {
    identifier: String,
    latitude: f64,
    longitude: f64,
    radius: f64,
    notify_on_entry: bool,
    notify_on_exit: bool,
    notify_on_dwell: bool,
    loitering_delay_ms: i64,
    extras: String,
    vertices: Option<String>,
}

impl GeofenceRow {
    fn decode(self) -> DbResult<GeofenceRegion> {
        let corrupt = |reason: String| DbError::Corrupt {
            id: self.identifier.clone(),
            reason,
        };
        let extras: Extras =
            serde_json::from_str(&self.extras).map_err(|e| corrupt(e.to_string()))?;
        let vertices: Option<Vec<Coordinate>> = self
            .vertices
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(GeofenceRegion {
            identifier: self.identifier,
            latitude: self.latitude,
            longitude: self.longitude,
            radius: self.radius,
            notify_on_entry: self.notify_on_entry,
            notify_on_exit: self.notify_on_exit,
            notify_on_dwell: self.notify_on_dwell,
            loitering_delay_ms: self.loitering_delay_ms.max(0) as u64,
            extras,
            vertices,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT identifier, latitude, longitude, radius,
           notify_on_entry, notify_on_exit, notify_on_dwell,
           loitering_delay_ms, extras, vertices
    FROM geofences
"#;

/// Repository over the `geofences` table.
#[derive(Debug, Clone)]
pub struct GeofenceRepository {
    pool: SqlitePool,
}

impl GeofenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        GeofenceRepository { pool }
    }

    /// Inserts every region in one transaction.
    ///
    /// ## Errors
    /// `DbError::UniqueViolation` (with the offending identifier) when any
    /// identifier already exists; nothing is written in that case.
    pub async fn insert_all(&self, regions: &[GeofenceRegion]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for region in regions {
            let extras = serde_json::to_string(&region.extras)?;
            let vertices = region
                .vertices
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let result = sqlx::query(
                r#"
                INSERT INTO geofences (
                    identifier, latitude, longitude, radius,
                    notify_on_entry, notify_on_exit, notify_on_dwell,
                    loitering_delay_ms, extras, vertices, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )
            .bind(&region.identifier)
            .bind(region.latitude)
            .bind(region.longitude)
            .bind(region.radius)
            .bind(region.notify_on_entry)
            .bind(region.notify_on_exit)
            .bind(region.notify_on_dwell)
            .bind(i64::try_from(region.loitering_delay_ms).unwrap_or(i64::MAX))
            .bind(extras)
            .bind(vertices)
            .bind(now)
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                return Err(match DbError::from(e) {
                    DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                        field,
                        value: region.identifier.clone(),
                    },
                    other => other,
                });
            }
        }

        tx.commit().await?;
        debug!(count = regions.len(), "Geofences persisted");
        Ok(())
    }

    /// Every stored region in registration order. Undecodable rows are
    /// skipped.
    pub async fn all(&self) -> DbResult<Vec<GeofenceRegion>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at ASC, rowid ASC");
        let rows: Vec<GeofenceRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.decode() {
                Ok(region) => Some(region),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable geofence");
                    None
                }
            })
            .collect())
    }

    pub async fn find(&self, identifier: &str) -> DbResult<Option<GeofenceRegion>> {
        let sql = format!("{SELECT_COLUMNS} WHERE identifier = ?1");
        let row: Option<GeofenceRow> = sqlx::query_as(&sql)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GeofenceRow::decode).transpose()
    }

    pub async fn exists(&self, identifier: &str) -> DbResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM geofences WHERE identifier = ?1")
            .bind(identifier)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM geofences")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Deletes the given identifiers; returns how many existed.
    pub async fn delete(&self, identifiers: &[String]) -> DbResult<u64> {
        if identifiers.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM geofences WHERE identifier IN (");
        let mut separated = qb.separated(", ");
        for identifier in identifiers {
            separated.push_bind(identifier.as_str());
        }
        separated.push_unseparated(")");

        let affected = qb.build().execute(&self.pool).await?.rows_affected();
        debug!(count = affected, "Geofences deleted");
        Ok(affected)
    }

    pub async fn delete_all(&self) -> DbResult<u64> {
        let affected = sqlx::query("DELETE FROM geofences")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    async fn repo() -> GeofenceRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().geofences()
    }

    #[tokio::test]
    async fn test_roundtrip_circle_and_polygon() {
        let repo = repo().await;
        let mut extras = Extras::new();
        extras.insert("zone".into(), json!("north"));

        let circle = GeofenceRegion::circle("home", 45.5, -73.6, 150.0)
            .notify(true, false, true)
            .with_dwell(Duration::from_secs(60))
            .with_extras(extras);
        let polygon = GeofenceRegion::polygon(
            "park",
            vec![
                Coordinate::new(45.0, -73.0),
                Coordinate::new(45.0, -72.99),
                Coordinate::new(45.01, -72.99),
            ],
        );

        repo.insert_all(&[circle.clone(), polygon.clone()]).await.unwrap();

        let all = repo.all().await.unwrap();
        assert_eq!(all, vec![circle, polygon]);
    }

    #[tokio::test]
    async fn test_duplicate_rolls_back_whole_batch() {
        let repo = repo().await;
        repo.insert_all(&[GeofenceRegion::circle("a", 0.0, 0.0, 10.0)])
            .await
            .unwrap();

        let err = repo
            .insert_all(&[
                GeofenceRegion::circle("b", 0.0, 0.0, 10.0),
                GeofenceRegion::circle("a", 1.0, 1.0, 10.0),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::UniqueViolation { ref value, .. } if value == "a"));
        assert!(!repo.exists("b").await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_existing_only() {
        let repo = repo().await;
        repo.insert_all(&[
            GeofenceRegion::circle("a", 0.0, 0.0, 10.0),
            GeofenceRegion::circle("b", 0.0, 0.0, 10.0),
        ])
        .await
        .unwrap();

        assert_eq!(repo.delete(&["a".into(), "zzz".into()]).await.unwrap(), 1);
        assert!(repo.find("a").await.unwrap().is_none());
        assert_eq!(repo.delete_all().await.unwrap(), 1);
    }
}
