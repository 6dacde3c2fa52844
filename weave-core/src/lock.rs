//! Distributed locking built on `StoreAdapter::set_if_absent` (§4.2, §5).
//!
//! Shared by the Blackboard (artifact critical sections), the Memory Graph
//! (supersession on a given `(source, type, target)` triple), and the
//! Consolidator (one sleep cycle per run id at a time).

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::StoreAdapter;

const POLL_START: Duration = Duration::from_millis(10);
const POLL_CAP: Duration = Duration::from_secs(1);

/// Prefix under which lock markers are stored on the networked store (§6.1).
pub fn lock_key(resource: &str) -> String {
    format!("bb:lock:{resource}")
}

/// Attempt to acquire `resource` for `ttl_ms`. Non-blocking: a single
/// conditional-put. Blocking: poll with exponential backoff starting at
/// 10 ms, doubling each failure, capped at 1 s, bounded by
/// `blocking_timeout`.
pub async fn acquire_lock(
    store: &dyn StoreAdapter,
    resource: &str,
    ttl_ms: u64,
    blocking: bool,
    blocking_timeout: Duration,
) -> Result<bool> {
    let key = lock_key(resource);
    let token = Uuid::new_v4().to_string();

    if store.set_if_absent(&key, token.into_bytes(), ttl_ms).await? {
        return Ok(true);
    }
    if !blocking {
        return Ok(false);
    }

    let deadline = Instant::now() + blocking_timeout;
    let mut delay = POLL_START;
    loop {
        if Instant::now() >= deadline {
            return Err(Error::LockTimeout {
                resource: resource.to_string(),
                elapsed_ms: blocking_timeout.as_millis() as u64,
            });
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..=delay.as_millis() as u64 / 4 + 1));
        tokio::time::sleep(delay + jitter).await;

        let token = Uuid::new_v4().to_string();
        if store.set_if_absent(&key, token.into_bytes(), ttl_ms).await? {
            return Ok(true);
        }
        delay = (delay * 2).min(POLL_CAP);
        debug!(resource, ?delay, "lock still held, backing off");
    }
}

/// Release `resource` unconditionally (last-writer-wins on forced release,
/// acceptable because locks auto-expire — §4.2). Returns `true` if a marker
/// was present.
pub async fn release_lock(store: &dyn StoreAdapter, resource: &str) -> Result<bool> {
    store.del(&lock_key(resource)).await
}

/// RAII guard that releases its lock on drop, guaranteeing release on every
/// exit path including early return or panic unwind (§9 "context-managed
/// scoped locks").
///
/// Because `Drop` cannot be async, release on drop is best-effort and fires
/// the underlying delete on a spawned task; callers that need to observe the
/// release outcome should call [`ScopedLock::release`] explicitly.
pub struct ScopedLock {
    store: Arc<dyn StoreAdapter>,
    resource: String,
    released: bool,
}

impl ScopedLock {
    /// Acquire `resource`, returning a guard that releases it on drop.
    pub async fn acquire(
        store: Arc<dyn StoreAdapter>,
        resource: &str,
        ttl_ms: u64,
        blocking: bool,
        blocking_timeout: Duration,
    ) -> Result<Option<Self>> {
        let acquired = acquire_lock(store.as_ref(), resource, ttl_ms, blocking, blocking_timeout).await?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Self {
            store,
            resource: resource.to_string(),
            released: false,
        }))
    }

    /// Explicitly release the lock, observing any store error.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        release_lock(self.store.as_ref(), &self.resource).await
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let resource = self.resource.clone();
        tokio::spawn(async move {
            if let Err(err) = release_lock(store.as_ref(), &resource).await {
                tracing::warn!(resource, ?err, "failed to release lock on drop");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStoreAdapter;

    #[tokio::test]
    async fn non_blocking_acquire_is_exclusive() {
        let store = InMemoryStoreAdapter::new();
        let first = acquire_lock(&store, "r", 5000, false, Duration::ZERO).await.unwrap();
        let second = acquire_lock(&store, "r", 5000, false, Duration::ZERO).await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds() {
        let store = InMemoryStoreAdapter::new();
        assert!(acquire_lock(&store, "r", 5000, false, Duration::ZERO).await.unwrap());
        assert!(release_lock(&store, "r").await.unwrap());
        assert!(acquire_lock(&store, "r", 5000, false, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_expiration() {
        let store = InMemoryStoreAdapter::new();
        assert!(acquire_lock(&store, "r", 100, false, Duration::ZERO).await.unwrap());

        let start = Instant::now();
        let acquired = acquire_lock(&store, "r", 5000, true, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(acquired);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn blocking_acquire_times_out() {
        let store = InMemoryStoreAdapter::new();
        assert!(acquire_lock(&store, "r", 60_000, false, Duration::ZERO).await.unwrap());

        let result = acquire_lock(&store, "r", 60_000, true, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::LockTimeout { .. })));
    }

    #[tokio::test]
    async fn scoped_lock_releases_on_drop() {
        let store: Arc<dyn StoreAdapter> = Arc::new(InMemoryStoreAdapter::new());
        {
            let guard = ScopedLock::acquire(store.clone(), "r", 5000, false, Duration::ZERO)
                .await
                .unwrap();
            assert!(guard.is_some());
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(acquire_lock(store.as_ref(), "r", 5000, false, Duration::ZERO).await.unwrap());
    }
}
