// src/lock/kv.rs

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::clock::{Clock, add_duration, duration_until};
use crate::errors::Result;
use crate::lock::{DistributedLock, LockHandle};

const KEY_PREFIX: &str = "lock:";

/// Key-value port with the conditional writes a lock needs.
///
/// Every method is a single atomic operation on the backend. Expired keys
/// behave as absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync + Debug {
    /// Set `key = value` with expiry `ttl` only if the key is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key` only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Reset the expiry of `key` to `ttl` only if it currently holds
    /// `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process key-value store. Expiry is evaluated against the injected
/// clock, so tests can expire keys by advancing a manual clock.
#[derive(Debug)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKvStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Run `f` on the live entry for `key`, dropping it first if expired.
    fn with_live<R>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>, bool) -> R) -> R {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        let live = entries.contains_key(key);
        f(&mut entries, live)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let expires_at = add_duration(self.clock.now(), ttl);
        Ok(self.with_live(key, |entries, live| {
            if live {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at,
                },
            );
            true
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_live(key, |entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        Ok(self.with_live(key, |entries, _| {
            if entries.get(key).is_some_and(|e| e.value == expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let expires_at = add_duration(self.clock.now(), ttl);
        Ok(self.with_live(key, |entries, _| match entries.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expires_at;
                true
            }
            _ => false,
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.with_live(key, |entries, _| entries.remove(key).is_some()))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now();
        Ok(self.with_live(key, |entries, _| {
            entries.get(key).map(|e| duration_until(now, e.expires_at))
        }))
    }
}

/// [`DistributedLock`] on top of a [`KeyValueStore`].
///
/// The stored value is the handle's token; keys are namespaced with
/// `lock:`.
#[derive(Debug)]
pub struct KvLock<S: KeyValueStore> {
    store: Arc<S>,
    owner: String,
}

impl<S: KeyValueStore> KvLock<S> {
    pub fn new(store: Arc<S>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    fn storage_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl<S: KeyValueStore> DistributedLock for KvLock<S> {
    async fn acquire(&self, key: &str, ttl: Duration) -> Option<LockHandle> {
        let handle = LockHandle::new(key, &self.owner);
        match self
            .store
            .set_if_absent(&Self::storage_key(key), &handle.token, ttl)
            .await
        {
            Ok(true) => Some(handle),
            Ok(false) => None,
            Err(err) => {
                error!(key, error = %err, "lock backend failed during acquire");
                None
            }
        }
    }

    async fn release(&self, handle: &LockHandle) -> bool {
        match self
            .store
            .delete_if_equals(&Self::storage_key(&handle.key), &handle.token)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(key = %handle.key, owner = %handle.owner, "release refused: token does not match");
                false
            }
            Err(err) => {
                error!(key = %handle.key, error = %err, "lock backend failed during release");
                false
            }
        }
    }

    async fn extend(&self, handle: &LockHandle, additional: Duration) -> bool {
        match self
            .store
            .expire_if_equals(&Self::storage_key(&handle.key), &handle.token, additional)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(key = %handle.key, "extend refused: lock lost or token does not match");
                false
            }
            Err(err) => {
                error!(key = %handle.key, error = %err, "lock backend failed during extend");
                false
            }
        }
    }

    async fn is_locked(&self, key: &str) -> bool {
        match self.store.get(&Self::storage_key(key)).await {
            Ok(value) => value.is_some(),
            Err(err) => {
                error!(key, error = %err, "lock backend failed during lookup");
                false
            }
        }
    }

    async fn force_release(&self, key: &str) -> bool {
        warn!(key, "force-releasing lock");
        match self.store.delete(&Self::storage_key(key)).await {
            Ok(removed) => removed,
            Err(err) => {
                error!(key, error = %err, "lock backend failed during force release");
                false
            }
        }
    }

    async fn time_to_live(&self, key: &str) -> Option<Duration> {
        match self.store.ttl(&Self::storage_key(key)).await {
            Ok(ttl) => ttl,
            Err(err) => {
                error!(key, error = %err, "lock backend failed during ttl lookup");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::JobflowError;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryKvStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryKvStore::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn acquire_release_round_trip() {
        let (_, store) = setup();
        let lock = KvLock::new(store.clone(), "node-a");

        let handle = lock.acquire("task:1", Duration::from_secs(5)).await.unwrap();
        assert!(lock.is_locked("task:1").await);
        assert_eq!(store.get("lock:task:1").await.unwrap(), Some(handle.token.clone()));
        assert!(lock.acquire("task:1", Duration::from_secs(5)).await.is_none());

        assert!(lock.release(&handle).await);
        assert!(!lock.is_locked("task:1").await);
        assert!(!lock.release(&handle).await);
    }

    #[tokio::test]
    async fn foreign_token_never_clears_the_entry() {
        let (_, store) = setup();
        let a = KvLock::new(store.clone(), "node-a");
        let b = KvLock::new(store.clone(), "node-b");

        let held = a.acquire("wf", Duration::from_secs(5)).await.unwrap();
        let forged = LockHandle {
            token: "not-the-token".into(),
            ..held.clone()
        };

        assert!(!b.release(&forged).await);
        assert!(!b.extend(&forged, Duration::from_secs(60)).await);
        assert!(a.is_locked("wf").await);
        assert!(a.release(&held).await);
    }

    #[tokio::test]
    async fn expired_entry_can_be_taken_over() {
        let (clock, store) = setup();
        let a = KvLock::new(store.clone(), "node-a");
        let b = KvLock::new(store.clone(), "node-b");

        let first = a.acquire("wf-1", Duration::from_millis(5000)).await.unwrap();
        clock.advance(Duration::from_millis(6000));

        assert!(!a.is_locked("wf-1").await);
        let second = b.acquire("wf-1", Duration::from_millis(5000)).await.unwrap();
        assert_ne!(first.token, second.token);

        // The stale handle cannot release the new owner's entry.
        assert!(!a.release(&first).await);
        assert!(b.is_locked("wf-1").await);
    }

    #[tokio::test]
    async fn extend_moves_expiry_and_keeps_token() {
        let (clock, store) = setup();
        let lock = KvLock::new(store.clone(), "node-a");

        let handle = lock.acquire("k", Duration::from_secs(2)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(lock.extend(&handle, Duration::from_secs(10)).await);
        assert_eq!(lock.time_to_live("k").await, Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(5));
        assert!(lock.is_locked("k").await);
        assert!(lock.release(&handle).await);
    }

    #[tokio::test]
    async fn force_release_ignores_token() {
        let (_, store) = setup();
        let lock = KvLock::new(store, "admin");
        lock.acquire("k", Duration::from_secs(30)).await.unwrap();
        assert!(lock.force_release("k").await);
        assert!(!lock.is_locked("k").await);
        assert_eq!(lock.time_to_live("k").await, None);
    }

    #[tokio::test]
    async fn concurrent_acquire_has_a_single_winner() {
        let (_, store) = setup();
        let mut joins = Vec::new();
        for n in 0..16 {
            let lock = KvLock::new(store.clone(), format!("node-{n}"));
            joins.push(tokio::spawn(async move {
                lock.acquire("hot", Duration::from_secs(30)).await.is_some()
            }));
        }

        let mut winners = 0;
        for join in joins {
            if join.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl KeyValueStore for Unreachable {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
            Err(JobflowError::Backend("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(JobflowError::Backend("connection refused".into()))
        }
        async fn delete_if_equals(&self, _: &str, _: &str) -> Result<bool> {
            Err(JobflowError::Backend("connection refused".into()))
        }
        async fn expire_if_equals(&self, _: &str, _: &str, _: Duration) -> Result<bool> {
            Err(JobflowError::Backend("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            Err(JobflowError::Backend("connection refused".into()))
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>> {
            Err(JobflowError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn backend_errors_read_as_not_acquired() {
        let lock = KvLock::new(Arc::new(Unreachable), "node-a");
        assert!(lock.acquire("k", Duration::from_secs(1)).await.is_none());
        assert!(!lock.is_locked("k").await);
    }
}
