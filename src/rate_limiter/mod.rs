//! Clock-windowed request counting.
//!
//! The limiter depends on a [`WindowCounter`] capability rather than a global
//! store, so services can be exercised with the in-memory counter and
//! deployments can share a Redis window across instances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tracing::warn;

use crate::errors::ServiceError;

/// Counts hits for a key inside a fixed window.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Records one hit and returns the count within the current window.
    async fn hit(&self, key: &str, window: Duration) -> u64;
}

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u64,
    window_start: Instant,
}

/// Process-local counter.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWindowCounter {
    entries: Arc<DashMap<String, WindowEntry>>,
}

impl InMemoryWindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn hit_now(&self, key: &str, window: Duration) -> u64 {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                window_start: now,
            });

        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        entry.count
    }
}

#[async_trait]
impl WindowCounter for InMemoryWindowCounter {
    async fn hit(&self, key: &str, window: Duration) -> u64 {
        self.hit_now(key, window)
    }
}

/// Redis INCR/EXPIRE counter; falls back to a local window when Redis fails.
#[derive(Clone)]
pub struct RedisWindowCounter {
    client: Arc<redis::Client>,
    fallback: InMemoryWindowCounter,
}

impl RedisWindowCounter {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client: Arc::new(client),
            fallback: InMemoryWindowCounter::new(),
        }
    }

    async fn hit_redis(&self, key: &str, window: Duration) -> redis::RedisResult<u64> {
        let mut conn = self.client.get_async_connection().await?;
        let count: u64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(key, window.as_secs().max(1) as usize).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl WindowCounter for RedisWindowCounter {
    async fn hit(&self, key: &str, window: Duration) -> u64 {
        match self.hit_redis(key, window).await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "Redis rate limit unavailable, using local window");
                self.fallback.hit_now(key, window)
            }
        }
    }
}

/// Fixed-window limiter keyed as `rl:{key}`.
#[derive(Clone)]
pub struct RateLimiter {
    counter: Arc<dyn WindowCounter>,
    limit: u64,
    window: Duration,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn WindowCounter>, limit: u32, window: Duration, enabled: bool) -> Self {
        Self {
            counter,
            limit: u64::from(limit),
            window,
            enabled,
        }
    }

    pub fn in_memory(limit: u32, window: Duration, enabled: bool) -> Self {
        Self::new(Arc::new(InMemoryWindowCounter::new()), limit, window, enabled)
    }

    /// A limiter that never rejects.
    pub fn disabled() -> Self {
        Self::in_memory(u32::MAX, Duration::from_secs(1), false)
    }

    /// Counts one request for `key`, failing once the window is exhausted.
    pub async fn check(&self, key: &str) -> Result<(), ServiceError> {
        if !self.enabled {
            return Ok(());
        }
        let count = self.counter.hit(&format!("rl:{key}"), self.window).await;
        if count > self.limit {
            warn!(key, count, limit = self.limit, "Rate limit exceeded");
            return Err(ServiceError::RateLimitExceeded);
        }
        Ok(())
    }
}
