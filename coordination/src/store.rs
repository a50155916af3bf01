//! Backend-agnostic cache store (enum dispatch over Redis and in-memory).

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::memory_store::MemoryStore;
use crate::redis_store::RedisStore;

/// TTL of the short-lived singleflight guard taken around a loader run.
const SINGLEFLIGHT_TTL: Duration = Duration::from_secs(10);

/// How long a losing caller polls for the winner's value before giving up
/// and computing locally.
const SINGLEFLIGHT_WAIT: Duration = Duration::from_secs(5);
const SINGLEFLIGHT_POLL: Duration = Duration::from_millis(50);

/// Shared cache with TTL semantics, atomic counters, hashes, owner-token
/// locks, and pub/sub. All keys carry the instance-level prefix configured
/// at startup (default `AIReview:`).
pub enum CacheStore {
    Redis(RedisStore),
    Memory(MemoryStore),
}

impl CacheStore {
    /// Connect to a Redis deployment.
    pub async fn connect(connection_string: &str, prefix: &str) -> CacheResult<Self> {
        Ok(CacheStore::Redis(
            RedisStore::connect(connection_string, prefix).await?,
        ))
    }

    /// In-process backend with the same semantics; used by tests and
    /// single-node hosts.
    pub fn memory(prefix: &str) -> Self {
        CacheStore::Memory(MemoryStore::new(prefix))
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        match self {
            CacheStore::Redis(s) => s.get(key).await,
            CacheStore::Memory(s) => s.get(key),
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        match self {
            CacheStore::Redis(s) => s.set(key, value, ttl).await,
            CacheStore::Memory(s) => s.set(key, value, ttl),
        }
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        match self {
            CacheStore::Redis(s) => s.delete(key).await,
            CacheStore::Memory(s) => s.delete(key),
        }
    }

    /// Atomic increment; applies `ttl` to the key when provided.
    pub async fn increment_by(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> CacheResult<i64> {
        match self {
            CacheStore::Redis(s) => s.increment_by(key, delta, ttl).await,
            CacheStore::Memory(s) => s.increment_by(key, delta, ttl),
        }
    }

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        match self {
            CacheStore::Redis(s) => s.hash_set(key, field, value).await,
            CacheStore::Memory(s) => s.hash_set(key, field, value),
        }
    }

    /// Set several hash fields at once; applies `ttl` to the whole key when
    /// provided.
    pub async fn hash_set_multi(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        match self {
            CacheStore::Redis(s) => s.hash_set_multi(key, fields, ttl).await,
            CacheStore::Memory(s) => s.hash_set_multi(key, fields, ttl),
        }
    }

    pub async fn hash_get_all(
        &self,
        key: &str,
    ) -> CacheResult<std::collections::HashMap<String, String>> {
        match self {
            CacheStore::Redis(s) => s.hash_get_all(key).await,
            CacheStore::Memory(s) => s.hash_get_all(key),
        }
    }

    pub async fn hash_delete(&self, key: &str, field: &str) -> CacheResult<()> {
        match self {
            CacheStore::Redis(s) => s.hash_delete(key, field).await,
            CacheStore::Memory(s) => s.hash_delete(key, field),
        }
    }

    /// `SET key token NX EX ttl`. Returns `true` when this caller now owns
    /// the lock.
    pub async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> CacheResult<bool> {
        match self {
            CacheStore::Redis(s) => s.acquire_lock(key, token, ttl).await,
            CacheStore::Memory(s) => s.acquire_lock(key, token, ttl),
        }
    }

    /// Compare-and-delete: the lock is released only while still owned by
    /// `token`, so an expired lock re-acquired by another worker is never
    /// clobbered.
    pub async fn release_lock(&self, key: &str, token: &str) -> CacheResult<bool> {
        match self {
            CacheStore::Redis(s) => s.release_lock(key, token).await,
            CacheStore::Memory(s) => s.release_lock(key, token),
        }
    }

    /// Compare-and-pexpire, the liveness heartbeat.
    pub async fn refresh_lock(&self, key: &str, token: &str, ttl: Duration) -> CacheResult<bool> {
        match self {
            CacheStore::Redis(s) => s.refresh_lock(key, token, ttl).await,
            CacheStore::Memory(s) => s.refresh_lock(key, token, ttl),
        }
    }

    /// Fire-and-forget pub/sub event (progress streams, template
    /// invalidation).
    pub async fn publish(&self, channel: &str, payload: &str) -> CacheResult<()> {
        match self {
            CacheStore::Redis(s) => s.publish(channel, payload).await,
            CacheStore::Memory(s) => s.publish(channel, payload),
        }
    }

    /// Cache-aside with a per-key singleflight guard: concurrent misses for
    /// the same key produce one loader run; the rest read the winner's
    /// value. If the winner disappears mid-compute the loser computes
    /// locally after a bounded wait.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> CacheResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<String>>,
    {
        if let Some(v) = self.get(key).await? {
            return Ok(v);
        }

        let guard_key = format!("{key}:sf");
        let token = uuid::Uuid::new_v4().to_string();

        if self.acquire_lock(&guard_key, &token, SINGLEFLIGHT_TTL).await? {
            // Double-check: the value may have landed while we raced for
            // the guard.
            if let Some(v) = self.get(key).await? {
                let _ = self.release_lock(&guard_key, &token).await;
                return Ok(v);
            }

            let out = loader().await;
            let released = match &out {
                Ok(v) => {
                    self.set(key, v, Some(ttl)).await?;
                    self.release_lock(&guard_key, &token).await
                }
                Err(_) => self.release_lock(&guard_key, &token).await,
            };
            if let Err(e) = released {
                warn!(key, error = %e, "failed to release singleflight guard");
            }
            out
        } else {
            debug!(key, "singleflight: waiting for concurrent loader");
            let deadline = tokio::time::Instant::now() + SINGLEFLIGHT_WAIT;
            while tokio::time::Instant::now() < deadline {
                tokio::time::sleep(SINGLEFLIGHT_POLL).await;
                if let Some(v) = self.get(key).await? {
                    return Ok(v);
                }
            }
            warn!(key, "singleflight: winner vanished, computing locally");
            let v = loader().await?;
            self.set(key, &v, Some(ttl)).await?;
            Ok(v)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn ttl_expires_values() {
        let store = CacheStore::memory("t:");
        store
            .set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counters_are_cumulative() {
        let store = CacheStore::memory("t:");
        assert_eq!(store.increment_by("n", 2, None).await.unwrap(), 2);
        assert_eq!(store.increment_by("n", 3, None).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let store = CacheStore::memory("t:");
        assert!(store
            .acquire_lock("lock:a", "tok-1", Duration::from_secs(5))
            .await
            .unwrap());
        // Wrong token must not release.
        assert!(!store.release_lock("lock:a", "tok-2").await.unwrap());
        assert!(!store
            .acquire_lock("lock:a", "tok-3", Duration::from_secs(5))
            .await
            .unwrap());
        // Right token does.
        assert!(store.release_lock("lock:a", "tok-1").await.unwrap());
        assert!(store
            .acquire_lock("lock:a", "tok-3", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_and_old_release_is_a_noop() {
        let store = CacheStore::memory("t:");
        assert!(store
            .acquire_lock("lock:b", "old", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store
            .acquire_lock("lock:b", "new", Duration::from_secs(5))
            .await
            .unwrap());
        // The previous owner's release must not free the new owner's lock.
        assert!(!store.release_lock("lock:b", "old").await.unwrap());
        assert!(!store
            .acquire_lock("lock:b", "third", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn singleflight_coalesces_concurrent_misses() {
        let store = Arc::new(CacheStore::memory("t:"));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                store
                    .get_or_create("expensive", Duration::from_secs(30), || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        Ok("computed".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "computed");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
