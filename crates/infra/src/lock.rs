//! Distributed lock over a TTL'd key/value store.
//!
//! At most one cron worker across all replicas runs a cycle at a time. The
//! TTL bounds how long a crashed holder keeps the lock; the owner token
//! stops a slow holder from deleting a lock a newer worker already took.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::ServiceResult;

/// Default lock TTL: longer than one daily cycle.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(25 * 60 * 60);

/// Minimal KV surface the lock needs.
#[async_trait]
pub trait LockKv: Send + Sync {
    /// Set `key` to `value` only if unset. Returns whether the set happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> ServiceResult<bool>;

    async fn get(&self, key: &str) -> ServiceResult<Option<String>>;

    async fn del(&self, key: &str) -> ServiceResult<()>;

    /// Delete `key` only while it still holds `expected`.
    ///
    /// The default is a read followed by a delete; stores with scripting
    /// override it with an atomic version.
    async fn compare_and_del(&self, key: &str, expected: &str) -> ServiceResult<bool> {
        match self.get(key).await? {
            Some(current) if current == expected => {
                self.del(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Keyed lock with an owner token minted on every acquire.
pub struct DistributedLock {
    kv: Arc<dyn LockKv>,
    key: String,
    ttl: Duration,
    owner: Mutex<Option<String>>,
}

impl DistributedLock {
    pub fn new(kv: Arc<dyn LockKv>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            key: key.into(),
            ttl,
            owner: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Token of the last successful acquire, if any.
    pub fn owner(&self) -> Option<String> {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Try to take the lock. `Ok(false)` means another owner holds it.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn acquire(&self) -> ServiceResult<bool> {
        let token = Uuid::new_v4().to_string();
        let acquired = self.kv.set_nx(&self.key, &token, self.ttl).await?;
        if acquired {
            *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        }
        debug!(acquired, "lock acquire");
        Ok(acquired)
    }

    /// Release the lock if this instance still owns it; otherwise no-op.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn release(&self) -> ServiceResult<()> {
        let Some(token) = self.owner() else {
            return Ok(());
        };
        let released = self.kv.compare_and_del(&self.key, &token).await?;
        debug!(released, "lock release");
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if owner.as_deref() == Some(token.as_str()) {
            *owner = None;
        }
        Ok(())
    }
}

/// In-process lock store for tests/dev. Honors TTLs using tokio's clock.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLockKv {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryLockKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Value under `key` unless its TTL ran out; expired entries are dropped.
fn live_entry<'a>(
    entries: &'a mut HashMap<String, (String, Instant)>,
    key: &str,
) -> Option<&'a String> {
    if entries
        .get(key)
        .is_some_and(|(_, expires)| *expires <= Instant::now())
    {
        entries.remove(key);
    }
    entries.get(key).map(|(value, _)| value)
}

#[async_trait]
impl LockKv for InMemoryLockKv {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> ServiceResult<bool> {
        let mut entries = self.entries();
        if live_entry(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> ServiceResult<Option<String>> {
        Ok(live_entry(&mut self.entries(), key).cloned())
    }

    async fn del(&self, key: &str) -> ServiceResult<()> {
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_over(kv: &InMemoryLockKv) -> DistributedLock {
        DistributedLock::new(Arc::new(kv.clone()), "cron:lock", DEFAULT_LOCK_TTL)
    }

    #[tokio::test]
    async fn second_instance_cannot_acquire() {
        let kv = InMemoryLockKv::new();
        let a = lock_over(&kv);
        let b = lock_over(&kv);

        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());
        assert!(b.owner().is_none());

        a.release().await.unwrap();
        assert!(b.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn release_never_steals_a_newer_owner() {
        let kv = InMemoryLockKv::new();
        let stale = lock_over(&kv);
        assert!(stale.acquire().await.unwrap());

        // TTL ran out and another worker took over.
        kv.del("cron:lock").await.unwrap();
        kv.set_nx("cron:lock", "someone-else", DEFAULT_LOCK_TTL)
            .await
            .unwrap();

        stale.release().await.unwrap();
        assert_eq!(
            kv.get("cron:lock").await.unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn release_without_key_is_a_no_op() {
        let kv = InMemoryLockKv::new();
        let lock = lock_over(&kv);
        lock.release().await.unwrap();

        assert!(lock.acquire().await.unwrap());
        kv.del("cron:lock").await.unwrap();
        lock.release().await.unwrap();
        assert!(kv.get("cron:lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn every_acquire_mints_a_fresh_token() {
        let kv = InMemoryLockKv::new();
        let lock = lock_over(&kv);
        assert!(lock.acquire().await.unwrap());
        let first = lock.owner().unwrap();
        lock.release().await.unwrap();
        assert!(lock.acquire().await.unwrap());
        assert_ne!(lock.owner().unwrap(), first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_set_nx_has_exactly_one_winner() {
        for round in 0..50 {
            let kv = InMemoryLockKv::new();
            let contenders: Vec<_> = (0..16)
                .map(|i| {
                    let kv = kv.clone();
                    tokio::spawn(async move {
                        let value = format!("worker-{i}");
                        let won = kv.set_nx("k", &value, DEFAULT_LOCK_TTL).await.unwrap();
                        won.then_some(value)
                    })
                })
                .collect();

            let mut winners = Vec::new();
            for contender in contenders {
                winners.extend(contender.await.unwrap());
            }
            assert_eq!(winners.len(), 1, "round {round}: {winners:?}");
            assert_eq!(kv.get("k").await.unwrap(), winners.pop());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_free_the_key() {
        let kv = InMemoryLockKv::new();
        assert!(kv.set_nx("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!kv.set_nx("k", "b", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(kv.set_nx("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("b"));
    }
}
