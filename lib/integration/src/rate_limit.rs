//! Per-integration call caps over a trailing window.
//!
//! The counter lives behind `RateLimitStore` so every worker sharing an
//! integration sees the same count. `InMemoryRateLimitStore` is correct
//! within one process; multi-worker deployments use a shared store.

use crate::error::StoreError;
use crate::integration::Integration;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The call was counted.
    Allowed {
        remaining: u32,
        resets_at: DateTime<Utc>,
    },
    /// The cap is reached; nothing was counted.
    Exceeded {
        retry_after: Duration,
        resets_at: DateTime<Utc>,
    },
}

impl RateLimitResult {
    /// Returns true if the request is allowed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Returns the number of remaining requests (0 if exceeded).
    #[must_use]
    pub fn remaining(&self) -> u32 {
        match self {
            Self::Allowed { remaining, .. } => *remaining,
            Self::Exceeded { .. } => 0,
        }
    }
}

/// A shared sliding-window counter.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Counts one call under `key` if fewer than `limit` calls were counted
    /// in `(now - window, now]`. The check and the count are atomic.
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult, StoreError>;

    /// Forgets every call counted under `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

/// Sliding-window counter for a single process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRateLimitStore {
    calls: Arc<Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>>,
}

impl InMemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult, StoreError> {
        let mut calls = self.calls.lock().await;
        let history = calls.entry(key.to_string()).or_default();

        let cutoff = now - window;
        while history.front().is_some_and(|at| *at <= cutoff) {
            history.pop_front();
        }

        let used = u32::try_from(history.len()).unwrap_or(u32::MAX);
        if used >= limit {
            let resets_at = history.front().map_or(now, |oldest| *oldest + window);
            return Ok(RateLimitResult::Exceeded {
                retry_after: resets_at - now,
                resets_at,
            });
        }

        history.push_back(now);
        let resets_at = history.front().map_or(now + window, |oldest| *oldest + window);
        Ok(RateLimitResult::Allowed {
            remaining: limit - used - 1,
            resets_at,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.calls.lock().await.remove(key);
        Ok(())
    }
}

/// Applies each integration's configured cap through a shared store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    window: Duration,
}

impl RateLimiter {
    /// A limiter over the trailing hour.
    #[must_use]
    pub fn hourly(store: Arc<dyn RateLimitStore>) -> Self {
        Self::with_window(store, Duration::hours(1))
    }

    #[must_use]
    pub fn with_window(store: Arc<dyn RateLimitStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Counts one call for `integration` at `now`, unless its cap is reached.
    /// Integrations without a cap are always allowed and never counted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    pub async fn check_and_record(
        &self,
        integration: &Integration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult, StoreError> {
        let Some(limit) = integration.effective_rate_limit() else {
            return Ok(RateLimitResult::Allowed {
                remaining: u32::MAX,
                resets_at: now + self.window,
            });
        };
        self.store
            .try_acquire(&integration.id.to_string(), limit, self.window, now)
            .await
    }

    /// Clears the counter for an integration.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    pub async fn reset(&self, integration: &Integration) -> Result<(), StoreError> {
        self.store.reset(&integration.id.to_string()).await
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::IntegrationType;
    use autoflow_core::OrganizationId;

    fn capped(limit: u32) -> Integration {
        Integration::new(OrganizationId::new(), "api", IntegrationType::GenericApi)
            .with_rate_limit(limit)
    }

    #[tokio::test]
    async fn allows_under_limit() {
        let limiter = RateLimiter::hourly(Arc::new(InMemoryRateLimitStore::new()));
        let integration = capped(3);
        let now = Utc::now();

        for expected_remaining in [2, 1, 0] {
            let result = limiter
                .check_and_record(&integration, now)
                .await
                .expect("store");
            assert!(result.is_allowed());
            assert_eq!(result.remaining(), expected_remaining);
        }
    }

    #[tokio::test]
    async fn blocks_over_limit_until_window_slides() {
        let limiter = RateLimiter::hourly(Arc::new(InMemoryRateLimitStore::new()));
        let integration = capped(2);
        let start = Utc::now();

        limiter.check_and_record(&integration, start).await.expect("store");
        limiter
            .check_and_record(&integration, start + Duration::minutes(30))
            .await
            .expect("store");

        let blocked = limiter
            .check_and_record(&integration, start + Duration::minutes(45))
            .await
            .expect("store");
        match blocked {
            RateLimitResult::Exceeded { retry_after, .. } => {
                assert_eq!(retry_after, Duration::minutes(15));
            }
            other => panic!("expected exceeded, got {other:?}"),
        }

        let after_first_expires = limiter
            .check_and_record(&integration, start + Duration::minutes(61))
            .await
            .expect("store");
        assert!(after_first_expires.is_allowed());
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let limiter = RateLimiter::hourly(Arc::new(InMemoryRateLimitStore::new()));
        let first = capped(1);
        let second = capped(1);
        let now = Utc::now();

        assert!(limiter.check_and_record(&first, now).await.expect("store").is_allowed());
        assert!(!limiter.check_and_record(&first, now).await.expect("store").is_allowed());
        assert!(limiter.check_and_record(&second, now).await.expect("store").is_allowed());
    }

    #[tokio::test]
    async fn uncapped_integrations_are_not_counted() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = RateLimiter::hourly(store.clone());
        let integration =
            Integration::new(OrganizationId::new(), "hook", IntegrationType::Webhook);

        for _ in 0..10 {
            assert!(limiter
                .check_and_record(&integration, Utc::now())
                .await
                .expect("store")
                .is_allowed());
        }
        assert!(store.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_counter() {
        let limiter = RateLimiter::hourly(Arc::new(InMemoryRateLimitStore::new()));
        let integration = capped(1);
        let now = Utc::now();

        limiter.check_and_record(&integration, now).await.expect("store");
        assert!(!limiter.check_and_record(&integration, now).await.expect("store").is_allowed());

        limiter.reset(&integration).await.expect("reset");
        assert!(limiter.check_and_record(&integration, now).await.expect("store").is_allowed());
    }

    #[tokio::test]
    async fn shared_store_is_consistent_across_limiters() {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::new());
        let a = RateLimiter::hourly(store.clone());
        let b = RateLimiter::hourly(store);
        let integration = capped(2);
        let now = Utc::now();

        assert!(a.check_and_record(&integration, now).await.expect("store").is_allowed());
        assert!(b.check_and_record(&integration, now).await.expect("store").is_allowed());
        assert!(!a.check_and_record(&integration, now).await.expect("store").is_allowed());
    }
}
