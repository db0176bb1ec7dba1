// src/lock/mod.rs

//! Distributed mutual exclusion keyed by string.
//!
//! Every successful [`DistributedLock::acquire`] hands back a [`LockHandle`]
//! carrying a fresh token. Only that handle can release or extend the entry;
//! a lock that expired and was taken by someone else is never touched.
//!
//! Backends:
//! - [`kv::KvLock`] over any [`kv::KeyValueStore`] with conditional writes.
//! - [`sql::SqlLock`] over a SQLite table.
//!
//! Backend errors are logged and reported as "not acquired" (or `false`):
//! callers must never assume exclusion when the backend failed.

pub mod kv;
pub mod sql;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{JobflowError, Result};

pub use kv::{KeyValueStore, KvLock, MemoryKvStore};
pub use sql::SqlLock;

/// Proof of ownership returned by a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
    /// Identity of the instance that took the lock, for diagnostics.
    pub owner: String,
}

impl LockHandle {
    pub(crate) fn new(key: &str, owner: &str) -> Self {
        Self {
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
        }
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync + Debug {
    /// One atomic attempt to take `key` for `ttl`. Never blocks on a held
    /// lock.
    async fn acquire(&self, key: &str, ttl: Duration) -> Option<LockHandle>;

    /// Release if the stored token still matches the handle.
    async fn release(&self, handle: &LockHandle) -> bool;

    /// Push the expiry to `now + additional` if the token still matches.
    async fn extend(&self, handle: &LockHandle, additional: Duration) -> bool;

    /// Whether a live (non-expired) entry exists for `key`.
    async fn is_locked(&self, key: &str) -> bool;

    /// Administrative removal that ignores tokens.
    async fn force_release(&self, key: &str) -> bool;

    /// Remaining lifetime of the live entry, if any.
    async fn time_to_live(&self, key: &str) -> Option<Duration>;
}

/// Poll [`DistributedLock::acquire`] every `retry_interval` until `wait`
/// has elapsed.
pub async fn acquire_with_retry(
    lock: &dyn DistributedLock,
    key: &str,
    ttl: Duration,
    retry_interval: Duration,
    wait: Duration,
) -> Result<LockHandle> {
    let deadline = Instant::now() + wait;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(handle) = lock.acquire(key, ttl).await {
            debug!(key, attempts, "lock acquired");
            return Ok(handle);
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(retry_interval.min(deadline - now)).await;
    }

    warn!(key, attempts, ?wait, "giving up on lock");
    Err(JobflowError::LockUnavailable(format!(
        "{key} still held after {attempts} attempts"
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::SystemClock;

    fn memory_lock(owner: &str, store: &Arc<MemoryKvStore>) -> KvLock<MemoryKvStore> {
        KvLock::new(Arc::clone(store), owner)
    }

    #[tokio::test]
    async fn retry_gives_up_with_lock_unavailable() {
        let store = Arc::new(MemoryKvStore::new(Arc::new(SystemClock)));
        let a = memory_lock("a", &store);
        let b = memory_lock("b", &store);

        let _held = a.acquire("k", Duration::from_secs(10)).await.unwrap();
        let err = acquire_with_retry(
            &b,
            "k",
            Duration::from_secs(10),
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JobflowError::LockUnavailable(_)));
    }

    #[tokio::test]
    async fn retry_succeeds_once_holder_releases() {
        let store = Arc::new(MemoryKvStore::new(Arc::new(SystemClock)));
        let a = Arc::new(memory_lock("a", &store));
        let b = memory_lock("b", &store);

        let held = a.acquire("k", Duration::from_secs(10)).await.unwrap();
        let releaser = {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                sleep(Duration::from_millis(30)).await;
                a.release(&held).await
            })
        };

        let handle = acquire_with_retry(
            &b,
            "k",
            Duration::from_secs(10),
            Duration::from_millis(5),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(handle.owner, "b");
        assert!(releaser.await.unwrap());
    }
}
