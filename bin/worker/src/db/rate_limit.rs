//! Sliding-window call counter shared by every worker.
//!
//! Each `try_acquire` runs in one transaction holding an advisory lock on the
//! key, so prune, count, and insert are atomic across processes.

use async_trait::async_trait;
use autoflow_integration::{RateLimitResult, RateLimitStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

fn storage(err: sqlx::Error) -> StoreError {
    StoreError::StorageFailed {
        reason: err.to_string(),
    }
}

/// Decides an acquire from the calls already counted in the window.
fn decide(
    used: u32,
    oldest: Option<DateTime<Utc>>,
    limit: u32,
    window: Duration,
    now: DateTime<Utc>,
) -> RateLimitResult {
    if used >= limit {
        let resets_at = oldest.map_or(now, |at| at + window);
        return RateLimitResult::Exceeded {
            retry_after: resets_at - now,
            resets_at,
        };
    }
    RateLimitResult::Allowed {
        remaining: limit - used - 1,
        resets_at: oldest.unwrap_or(now) + window,
    }
}

#[derive(Clone)]
pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        sqlx::query("DELETE FROM rate_limit_calls WHERE key = $1 AND called_at <= $2")
            .bind(key)
            .bind(now - window)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let (used, oldest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(called_at) FROM rate_limit_calls WHERE key = $1",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        let result = decide(
            u32::try_from(used).unwrap_or(u32::MAX),
            oldest,
            limit,
            window,
            now,
        );
        if result.is_allowed() {
            sqlx::query("INSERT INTO rate_limit_calls (key, called_at) VALUES ($1, $2)")
                .bind(key)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(result)
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM rate_limit_calls WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}
