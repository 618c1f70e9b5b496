//! Idempotency store: remembers the result of every processed job key.
//!
//! The store is fail-open. When the underlying key-value store cannot be
//! reached, lookups report "not processed" and writes are dropped with a
//! warning; the backend's job-id collision check remains the backstop
//! against duplicate execution.

use crate::clock::{Clock, SystemClock};
use crate::error::{QueueError, QueueResult};
use crate::job::JobResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Minimal key-value contract the idempotency store needs.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns true if the key holds a value.
    async fn exists(&self, key: &str) -> QueueResult<bool>;

    /// Stores a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()>;

    /// Reads a value.
    async fn get(&self, key: &str) -> QueueResult<Option<String>>;
}

/// Redis-backed key-value store.
pub struct RedisKeyValueStore {
    pool: Pool,
}

impl RedisKeyValueStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }
}

/// Process-local key-value store with TTL expiry.
#[derive(Debug)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKeyValueStore {
    /// Create a store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn exists(&self, key: &str) -> QueueResult<bool> {
        Ok(self.live_value(key).is_some())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        Ok(self.live_value(key))
    }
}

/// Store used when no key-value backend could be reached at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledKeyValueStore;

#[async_trait]
impl KeyValueStore for DisabledKeyValueStore {
    async fn exists(&self, _key: &str) -> QueueResult<bool> {
        Err(QueueError::BackendUnavailable("idempotency store disabled".to_string()))
    }

    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> QueueResult<()> {
        Err(QueueError::BackendUnavailable("idempotency store disabled".to_string()))
    }

    async fn get(&self, _key: &str) -> QueueResult<Option<String>> {
        Err(QueueError::BackendUnavailable("idempotency store disabled".to_string()))
    }
}

/// Queue-scoped idempotency guard over a [`KeyValueStore`].
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    enabled: bool,
}

impl IdempotencyGuard {
    /// Create a guard.
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            enabled: true,
        }
    }

    /// Turn the guard into a no-op.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Storage key for `(queue, key)`.
    pub fn storage_key(&self, queue: &str, key: &str) -> String {
        format!("{}:idempotency:{}:{}", self.prefix, queue, key)
    }

    /// Returns true if a result was recorded for the key.
    pub async fn exists(&self, queue: &str, key: &str) -> bool {
        if !self.enabled {
            return false;
        }

        match self.store.exists(&self.storage_key(queue, key)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(queue = %queue, idempotency_key = %key, error = %e, "Idempotency check failed, assuming not processed");
                false
            }
        }
    }

    /// Record the result for the key.
    pub async fn mark_processed(&self, queue: &str, key: &str, result: &JobResult, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let value = match serde_json::to_string(result) {
            Ok(value) => value,
            Err(e) => {
                warn!(queue = %queue, idempotency_key = %key, error = %e, "Failed to serialize job result");
                return;
            }
        };

        match self
            .store
            .set_with_ttl(&self.storage_key(queue, key), &value, ttl)
            .await
        {
            Ok(()) => debug!(queue = %queue, idempotency_key = %key, success = result.success, "Recorded job result"),
            Err(e) => {
                warn!(queue = %queue, idempotency_key = %key, error = %e, "Failed to record job result")
            }
        }
    }

    /// Read the recorded result for the key.
    pub async fn get_result(&self, queue: &str, key: &str) -> Option<JobResult> {
        if !self.enabled {
            return None;
        }

        let raw = match self.store.get(&self.storage_key(queue, key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(queue = %queue, idempotency_key = %key, error = %e, "Failed to read job result");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(queue = %queue, idempotency_key = %key, error = %e, "Stored job result is malformed");
                None
            }
        }
    }
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("prefix", &self.prefix)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use serde_json::json;

    fn guard_with_clock() -> (IdempotencyGuard, MockClock) {
        let clock = MockClock::new();
        let store = Arc::new(InMemoryKeyValueStore::with_clock(Arc::new(clock.clone())));
        (IdempotencyGuard::new(store, "test"), clock)
    }

    #[test]
    fn test_storage_key_is_queue_scoped() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryKeyValueStore::new()), "meetsync");
        assert_eq!(
            guard.storage_key("email", "verify-a@x.com-1"),
            "meetsync:idempotency:email:verify-a@x.com-1"
        );
    }

    #[tokio::test]
    async fn test_mark_then_get() {
        let (guard, _clock) = guard_with_clock();
        let result = JobResult::success(json!({"messageId": "m-1"}), Duration::from_millis(12));

        assert!(!guard.exists("email", "k1").await);
        guard.mark_processed("email", "k1", &result, Duration::from_secs(60)).await;

        assert!(guard.exists("email", "k1").await);
        assert!(!guard.exists("meeting", "k1").await);
        assert_eq!(guard.get_result("email", "k1").await, Some(result));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (guard, clock) = guard_with_clock();
        let result = JobResult::failure("boom", Duration::ZERO);

        guard.mark_processed("email", "k1", &result, Duration::from_secs(60)).await;
        clock.advance(Duration::from_secs(61));

        assert!(!guard.exists("email", "k1").await);
        assert!(guard.get_result("email", "k1").await.is_none());
    }

    #[tokio::test]
    async fn test_fail_open_when_store_unavailable() {
        let guard = IdempotencyGuard::new(Arc::new(DisabledKeyValueStore), "test");
        let result = JobResult::success(json!(null), Duration::ZERO);

        guard.mark_processed("email", "k1", &result, Duration::from_secs(60)).await;
        assert!(!guard.exists("email", "k1").await);
        assert!(guard.get_result("email", "k1").await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_guard_is_noop() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryKeyValueStore::new()), "test").enabled(false);
        let result = JobResult::success(json!(1), Duration::ZERO);

        guard.mark_processed("email", "k1", &result, Duration::from_secs(60)).await;
        assert!(!guard.exists("email", "k1").await);
    }
}
