// tests/lock_backends.rs

use std::sync::Arc;
use std::time::Duration;

use jobflow::clock::{Clock, ManualClock};
use jobflow::lock::{DistributedLock, KvLock, MemoryKvStore, SqlLock};

/// Two owners contending on one backend, sharing a manual clock.
async fn backends(clock: Arc<ManualClock>, dir: &tempfile::TempDir) -> Vec<[Arc<dyn DistributedLock>; 2]> {
    let shared: Arc<dyn Clock> = clock;

    let kv = Arc::new(MemoryKvStore::new(shared.clone()));
    let kv_pair: [Arc<dyn DistributedLock>; 2] = [
        Arc::new(KvLock::new(kv.clone(), "node-a")),
        Arc::new(KvLock::new(kv, "node-b")),
    ];

    let path = dir.path().join("locks.db");
    let sql_pair: [Arc<dyn DistributedLock>; 2] = [
        Arc::new(SqlLock::open(&path, "node-a", shared.clone()).await.unwrap()),
        Arc::new(SqlLock::open(&path, "node-b", shared).await.unwrap()),
    ];

    vec![kv_pair, sql_pair]
}

#[tokio::test]
async fn unrenewed_lock_expires_for_the_next_owner() {
    let clock = Arc::new(ManualClock::starting_now());
    let dir = tempfile::tempdir().unwrap();

    for [a, b] in backends(clock.clone(), &dir).await {
        let first = a.acquire("wf-1", Duration::from_millis(5000)).await.unwrap();
        assert!(b.acquire("wf-1", Duration::from_millis(5000)).await.is_none());

        clock.advance(Duration::from_millis(6000));
        let second = b.acquire("wf-1", Duration::from_millis(5000)).await.unwrap();
        assert_ne!(first.token, second.token);

        assert!(!a.release(&first).await, "{a:?}");
        assert!(!a.extend(&first, Duration::from_secs(5)).await, "{a:?}");
        assert!(b.is_locked("wf-1").await);
        assert!(b.release(&second).await);
    }
}

#[tokio::test]
async fn renewal_keeps_the_owner() {
    let clock = Arc::new(ManualClock::starting_now());
    let dir = tempfile::tempdir().unwrap();

    for [a, b] in backends(clock.clone(), &dir).await {
        let held = a.acquire("task:9", Duration::from_millis(1000)).await.unwrap();
        clock.advance(Duration::from_millis(800));
        assert!(a.extend(&held, Duration::from_millis(1000)).await);
        clock.advance(Duration::from_millis(800));

        assert!(b.acquire("task:9", Duration::from_millis(1000)).await.is_none());
        let ttl = b.time_to_live("task:9").await.unwrap();
        assert!(ttl <= Duration::from_millis(200), "{ttl:?}");

        assert!(b.force_release("task:9").await);
        assert!(!a.is_locked("task:9").await);
    }
}

#[tokio::test]
async fn lapsed_holder_cannot_release() {
    let clock = Arc::new(ManualClock::starting_now());
    let dir = tempfile::tempdir().unwrap();

    for [a, b] in backends(clock.clone(), &dir).await {
        let held = a.acquire("wf-2", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert!(!a.release(&held).await, "{a:?}");
        assert!(!a.is_locked("wf-2").await, "{a:?}");
        assert!(!b.force_release("wf-2").await, "{b:?}");
        assert!(b.time_to_live("wf-2").await.is_none(), "{b:?}");

        let next = b.acquire("wf-2", Duration::from_secs(1)).await.unwrap();
        assert!(b.release(&next).await, "{b:?}");
    }
}
