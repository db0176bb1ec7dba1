// src/engine/pools.rs

//! Bounded worker pools.
//!
//! Each pool is a semaphore: work holds one permit for as long as it runs.
//! Task actions, run drivers, lock polling and notifications are sized
//! independently so a flood of one kind cannot starve the others.

use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolSizes {
    pub task_workers: usize,
    pub orchestration_workers: usize,
    pub coordination_workers: usize,
    pub notification_workers: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            task_workers: 8,
            orchestration_workers: 4,
            coordination_workers: 4,
            notification_workers: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Running task actions.
    Task,
    /// Driving standalone task runs and workflow runs.
    Orchestration,
    /// Lock acquisition and polling.
    Coordination,
    /// Notifications and audit writes.
    Notification,
}

#[derive(Debug, Clone)]
pub struct WorkerPools {
    task: Arc<Semaphore>,
    orchestration: Arc<Semaphore>,
    coordination: Arc<Semaphore>,
    notification: Arc<Semaphore>,
}

impl WorkerPools {
    /// Zero-sized pools are bumped to one worker.
    pub fn new(sizes: PoolSizes) -> Self {
        let sem = |n: usize| Arc::new(Semaphore::new(n.max(1)));
        Self {
            task: sem(sizes.task_workers),
            orchestration: sem(sizes.orchestration_workers),
            coordination: sem(sizes.coordination_workers),
            notification: sem(sizes.notification_workers),
        }
    }

    fn semaphore(&self, pool: Pool) -> &Arc<Semaphore> {
        match pool {
            Pool::Task => &self.task,
            Pool::Orchestration => &self.orchestration,
            Pool::Coordination => &self.coordination,
            Pool::Notification => &self.notification,
        }
    }

    /// Free permits right now.
    pub fn available(&self, pool: Pool) -> usize {
        self.semaphore(pool).available_permits()
    }

    /// Await `fut` while holding a permit of `pool`.
    pub async fn run<F: Future>(&self, pool: Pool, fut: F) -> F::Output {
        // The semaphores are never closed, so acquiring only waits.
        let _permit = self.semaphore(pool).clone().acquire_owned().await.ok();
        trace!(?pool, "pool permit acquired");
        fut.await
    }

    /// Spawn `fut` onto the runtime; it starts once a permit of `pool` is
    /// free.
    pub fn spawn<F>(&self, pool: Pool, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(self.semaphore(pool));
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            fut.await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn spawn_respects_pool_size() {
        let pools = WorkerPools::new(PoolSizes {
            task_workers: 2,
            ..PoolSizes::default()
        });
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                pools.spawn(Pool::Task, async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pools.available(Pool::Task), 2);
    }

    #[test]
    fn zero_sizes_get_one_worker() {
        let pools = WorkerPools::new(PoolSizes {
            task_workers: 0,
            orchestration_workers: 0,
            coordination_workers: 0,
            notification_workers: 0,
        });
        assert_eq!(pools.available(Pool::Coordination), 1);
    }
}
