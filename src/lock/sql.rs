// src/lock/sql.rs

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use tokio_rusqlite::Connection;
use tracing::{error, warn};

use crate::clock::{Clock, add_duration};
use crate::errors::Result;
use crate::lock::{DistributedLock, LockHandle};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jf_lock (
    lock_key    TEXT PRIMARY KEY,
    lock_token  TEXT NOT NULL,
    owner       TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL
);
"#;

/// Taking a lock is an upsert that only overwrites an expired row. It runs
/// in an `IMMEDIATE` transaction so the expiry check and the write cannot
/// interleave with another writer.
const ACQUIRE: &str = "INSERT INTO jf_lock (lock_key, lock_token, owner, acquired_at, expires_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(lock_key) DO UPDATE SET
         lock_token = excluded.lock_token,
         owner = excluded.owner,
         acquired_at = excluded.acquired_at,
         expires_at = excluded.expires_at
     WHERE jf_lock.expires_at <= ?4";

/// [`DistributedLock`] backed by a SQLite table.
///
/// Timestamps are epoch milliseconds taken from the injected clock, not from
/// the database, so every instance sharing the file must share a clock
/// source of similar accuracy.
pub struct SqlLock {
    conn: Connection,
    owner: String,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SqlLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlLock")
            .field("owner", &self.owner)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl SqlLock {
    /// Open (and create if needed) the lock table in the database at `path`.
    pub async fn open(
        path: impl AsRef<Path>,
        owner: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let conn = Connection::open(path.as_ref().to_path_buf()).await?;
        Self::init(conn, owner.into(), clock).await
    }

    /// A private in-memory database. Only useful inside one process.
    pub async fn open_in_memory(owner: impl Into<String>, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, owner.into(), clock).await
    }

    async fn init(conn: Connection, owner: String, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.call(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, owner, clock })
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn millis_after(&self, ttl: Duration) -> i64 {
        add_duration(self.clock.now(), ttl).timestamp_millis()
    }

    async fn try_acquire(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let now = self.now_millis();
        let expires_at = self.millis_after(ttl);
        let (key, token, owner) = (
            handle.key.clone(),
            handle.token.clone(),
            handle.owner.clone(),
        );

        let changed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(ACQUIRE, params![key, token, owner, now, expires_at])?;
                tx.commit()?;
                Ok(changed)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Expired rows are left for the next acquire to overwrite, so a lapsed
    /// holder's release reports `false` just like the KV backend.
    async fn delete_matching(&self, key: String, token: String) -> Result<bool> {
        let now = self.now_millis();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM jf_lock
                     WHERE lock_key = ?1 AND lock_token = ?2 AND expires_at > ?3",
                    params![key, token, now],
                )?)
            })
            .await?;
        Ok(changed == 1)
    }

    async fn extend_matching(&self, key: String, token: String, additional: Duration) -> Result<bool> {
        let now = self.now_millis();
        let expires_at = self.millis_after(additional);
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE jf_lock SET expires_at = ?3
                     WHERE lock_key = ?1 AND lock_token = ?2 AND expires_at > ?4",
                    params![key, token, expires_at, now],
                )?)
            })
            .await?;
        Ok(changed == 1)
    }

    async fn live_expiry(&self, key: String) -> Result<Option<i64>> {
        let now = self.now_millis();
        let expiry = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT expires_at FROM jf_lock WHERE lock_key = ?1 AND expires_at > ?2",
                        params![key, now],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(expiry)
    }

    async fn delete_any(&self, key: String) -> Result<bool> {
        let now = self.now_millis();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM jf_lock WHERE lock_key = ?1 AND expires_at > ?2",
                    params![key, now],
                )?)
            })
            .await?;
        Ok(changed == 1)
    }
}

#[async_trait]
impl DistributedLock for SqlLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Option<LockHandle> {
        let handle = LockHandle::new(key, &self.owner);
        match self.try_acquire(&handle, ttl).await {
            Ok(true) => Some(handle),
            Ok(false) => None,
            Err(err) => {
                error!(key, error = %err, "lock table unavailable during acquire");
                None
            }
        }
    }

    async fn release(&self, handle: &LockHandle) -> bool {
        match self
            .delete_matching(handle.key.clone(), handle.token.clone())
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(key = %handle.key, owner = %handle.owner, "release refused: token does not match");
                false
            }
            Err(err) => {
                error!(key = %handle.key, error = %err, "lock table unavailable during release");
                false
            }
        }
    }

    async fn extend(&self, handle: &LockHandle, additional: Duration) -> bool {
        match self
            .extend_matching(handle.key.clone(), handle.token.clone(), additional)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(key = %handle.key, "extend refused: lock lost or token does not match");
                false
            }
            Err(err) => {
                error!(key = %handle.key, error = %err, "lock table unavailable during extend");
                false
            }
        }
    }

    async fn is_locked(&self, key: &str) -> bool {
        match self.live_expiry(key.to_string()).await {
            Ok(expiry) => expiry.is_some(),
            Err(err) => {
                error!(key, error = %err, "lock table unavailable during lookup");
                false
            }
        }
    }

    async fn force_release(&self, key: &str) -> bool {
        warn!(key, "force-releasing lock");
        match self.delete_any(key.to_string()).await {
            Ok(removed) => removed,
            Err(err) => {
                error!(key, error = %err, "lock table unavailable during force release");
                false
            }
        }
    }

    async fn time_to_live(&self, key: &str) -> Option<Duration> {
        match self.live_expiry(key.to_string()).await {
            Ok(expiry) => {
                let remaining = expiry? - self.now_millis();
                Some(Duration::from_millis(remaining.max(0) as u64))
            }
            Err(err) => {
                error!(key, error = %err, "lock table unavailable during ttl lookup");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    async fn lock(owner: &str, clock: &Arc<ManualClock>) -> SqlLock {
        SqlLock::open_in_memory(owner, clock.clone()).await.unwrap()
    }

    #[tokio::test]
    async fn acquire_release_round_trip() {
        let clock = Arc::new(ManualClock::starting_now());
        let lock = lock("node-a", &clock).await;

        let handle = lock.acquire("task:1", Duration::from_secs(5)).await.unwrap();
        assert!(lock.is_locked("task:1").await);
        assert!(lock.acquire("task:1", Duration::from_secs(5)).await.is_none());
        assert_eq!(lock.time_to_live("task:1").await, Some(Duration::from_secs(5)));

        assert!(lock.release(&handle).await);
        assert!(!lock.is_locked("task:1").await);
        assert!(!lock.release(&handle).await);
    }

    #[tokio::test]
    async fn expired_row_is_taken_over_and_old_token_is_dead() {
        let clock = Arc::new(ManualClock::starting_now());
        let lock = lock("node-a", &clock).await;

        let first = lock.acquire("wf-1", Duration::from_millis(5000)).await.unwrap();
        clock.advance(Duration::from_millis(6000));
        let second = lock.acquire("wf-1", Duration::from_millis(5000)).await.unwrap();

        assert!(!lock.release(&first).await);
        assert!(!lock.extend(&first, Duration::from_secs(60)).await);
        assert!(lock.is_locked("wf-1").await);
        assert!(lock.release(&second).await);
    }

    #[tokio::test]
    async fn extend_requires_live_matching_row() {
        let clock = Arc::new(ManualClock::starting_now());
        let lock = lock("node-a", &clock).await;

        let handle = lock.acquire("k", Duration::from_secs(2)).await.unwrap();
        assert!(lock.extend(&handle, Duration::from_secs(30)).await);
        clock.advance(Duration::from_secs(10));
        assert!(lock.is_locked("k").await);

        clock.advance(Duration::from_secs(30));
        assert!(!lock.extend(&handle, Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn instances_sharing_a_file_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        let clock = Arc::new(ManualClock::starting_now());

        let a = SqlLock::open(&path, "node-a", clock.clone()).await.unwrap();
        let b = SqlLock::open(&path, "node-b", clock.clone()).await.unwrap();

        let held = a.acquire("workflow:7", Duration::from_secs(30)).await.unwrap();
        assert!(b.acquire("workflow:7", Duration::from_secs(30)).await.is_none());
        assert!(b.is_locked("workflow:7").await);
        assert!(!b.force_release("workflow:8").await);

        assert!(a.release(&held).await);
        assert!(b.acquire("workflow:7", Duration::from_secs(30)).await.is_some());
    }
}
