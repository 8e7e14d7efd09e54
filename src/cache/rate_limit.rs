//! Fixed-window request limiter over a shared TTL counter store
//!
//! Counters live outside the process (Redis) so every replica enforces the same
//! budget. If the store is unreachable the limiter lets requests through and logs it.

use crate::cache::error::CacheResult;
use crate::cache::keys::rate_limit::RequestCounterKey;
use crate::error::{AppError, AppResult, DomainError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Counter with expiry, the only primitive the limiter needs
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new count. The first hit starts a `window` TTL.
    async fn hit(&self, key: &str, window: Duration) -> CacheResult<i64>;
}

#[cfg(feature = "cache")]
#[async_trait]
impl CounterStore for crate::cache::RedisCache {
    async fn hit(&self, key: &str, window: Duration) -> CacheResult<i64> {
        self.increment_with_ttl(key, window).await
    }
}

/// Single-process counter store
#[derive(Default, Clone)]
pub struct InMemoryCounterStore {
    counters: Arc<Mutex<HashMap<String, (i64, Instant)>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn hit(&self, key: &str, window: Duration) -> CacheResult<i64> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let entry = counters
            .entry(key.to_string())
            .or_insert((0, now + window));

        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    scope: &'static str,
    max_requests: i64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        scope: &'static str,
        max_requests: i64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            scope,
            max_requests,
            window,
        }
    }

    /// Count one request for `subject`, rejecting it once the window budget is spent
    pub async fn check(&self, subject: &str) -> AppResult<()> {
        let key = RequestCounterKey::new(self.scope, subject).to_string();

        match self.store.hit(&key, self.window).await {
            Ok(count) if count > self.max_requests => {
                warn!(scope = self.scope, subject, count, "Rate limit exceeded");
                Err(AppError::domain(DomainError::RateLimited {
                    retry_after_secs: self.window.as_secs(),
                }))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(scope = self.scope, "Rate limit store unavailable, allowing request: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn hit(&self, _key: &str, _window: Duration) -> CacheResult<i64> {
            Err(CacheError::ConnectionError("connection refused".to_string()))
        }
    }

    fn limiter(store: Arc<dyn CounterStore>, max: i64) -> RateLimiter {
        RateLimiter::new(store, "topups", max, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_rejects_after_budget() {
        let limiter = limiter(Arc::new(InMemoryCounterStore::new()), 3);
        for _ in 0..3 {
            limiter.check("user-1").await.unwrap();
        }
        let err = limiter.check("user-1").await.unwrap_err();
        assert_eq!(err.error_code(), "RATE_LIMITED");

        limiter.check("user-2").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = limiter(Arc::new(InMemoryCounterStore::new()), 1);
        limiter.check("user-1").await.unwrap();
        assert!(limiter.check("user-1").await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.check("user-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_fails_open_without_store() {
        let limiter = limiter(Arc::new(UnreachableStore), 1);
        limiter.check("user-1").await.unwrap();
        limiter.check("user-1").await.unwrap();
    }
}
