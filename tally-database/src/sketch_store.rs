use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tally_hll::Sketch;

use crate::Result;

/// Durable storage for sketches built from database batches.
///
/// One row is kept per `(metric_name, time_period)`. Re-running a computation
/// for a period merges into the stored sketch instead of overwriting it, so
/// overlapping windows and repeated runs never lose observed identities.
#[async_trait]
pub trait SketchStore: Send + Sync {
    /// Merges `sketch` into the stored sketch for `(metric, period)`.
    async fn save(&self, metric: &str, period: &str, sketch: &Sketch) -> Result<()>;

    /// Loads the stored sketch for `(metric, period)`.
    async fn load(&self, metric: &str, period: &str) -> Result<Option<Sketch>>;

    /// Loads and merges the stored sketches of all `periods`.
    ///
    /// Periods without a stored sketch contribute nothing. The result is a
    /// single sketch, never a sum of estimates.
    async fn load_merged(&self, metric: &str, periods: &[String]) -> Result<Sketch> {
        let mut merged = Sketch::new();
        for period in periods {
            if let Some(sketch) = self.load(metric, period).await? {
                merged.merge(&sketch)?;
            }
        }
        Ok(merged)
    }
}

/// A [`SketchStore`] backed by Postgres.
#[derive(Debug, Clone)]
pub struct PgSketchStore {
    pool: PgPool,
}

impl PgSketchStore {
    /// Creates a store reading and writing through `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the backing table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_sketches (
                metric_name TEXT NOT NULL,
                time_period TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                bucket_data BYTEA NOT NULL,
                PRIMARY KEY (metric_name, time_period)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SketchStore for PgSketchStore {
    async fn save(&self, metric: &str, period: &str, sketch: &Sketch) -> Result<()> {
        // Read-merge-write under a row lock, so concurrent runs for the same
        // period combine their registers instead of overwriting each other.
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT bucket_data FROM usage_sketches
             WHERE metric_name = $1 AND time_period = $2 FOR UPDATE",
        )
        .bind(metric)
        .bind(period)
        .fetch_optional(&mut *tx)
        .await?;

        let mut merged = sketch.clone();
        if let Some(row) = existing {
            let stored = Sketch::from_bytes(&row.try_get::<Vec<u8>, _>(0)?)?;
            merged.merge(&stored)?;
        }

        sqlx::query(
            "INSERT INTO usage_sketches (metric_name, time_period, recorded_at, bucket_data)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (metric_name, time_period)
             DO UPDATE SET recorded_at = EXCLUDED.recorded_at,
                           bucket_data = EXCLUDED.bucket_data",
        )
        .bind(metric)
        .bind(period)
        .bind(Utc::now())
        .bind(merged.to_bytes())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, metric: &str, period: &str) -> Result<Option<Sketch>> {
        let row = sqlx::query(
            "SELECT bucket_data FROM usage_sketches
             WHERE metric_name = $1 AND time_period = $2",
        )
        .bind(metric)
        .bind(period)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Sketch::from_bytes(&row.try_get::<Vec<u8>, _>(0)?)?)),
            None => Ok(None),
        }
    }
}
