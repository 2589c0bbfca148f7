//! # Motion State Repository
//!
//! One row holding the motion flag and odometer of the last run.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::error::DbResult;

/// Motion state as last saved.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct MotionSnapshot {
    pub is_moving: bool,
    pub odometer: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MotionStateRepository {
    pool: SqlitePool,
}

impl MotionStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        MotionStateRepository { pool }
    }

    /// `None` on a store that never saved a state.
    pub async fn load(&self) -> DbResult<Option<MotionSnapshot>> {
        let snapshot = sqlx::query_as(
            "SELECT is_moving, odometer, updated_at FROM motion_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(snapshot)
    }

    pub async fn save(&self, is_moving: bool, odometer: f64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO motion_state (id, is_moving, odometer, updated_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT (id) DO UPDATE SET
                is_moving = excluded.is_moving,
                odometer = excluded.odometer,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(is_moving)
        .bind(odometer)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
