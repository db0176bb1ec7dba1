// src/engine/keepalive.rs

//! Lock renewal for long runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::lock::{DistributedLock, LockHandle};

/// Background renewer for one held lock.
///
/// Extends the lock by `ttl` every `ttl / 2`. If an extension is refused
/// (the entry expired and someone else took it, or the backend failed)
/// `on_lost` is cancelled and renewal stops.
#[derive(Debug)]
pub struct KeepAlive {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    pub fn spawn(
        lock: Arc<dyn DistributedLock>,
        held: LockHandle,
        ttl: Duration,
        on_lost: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let period = (ttl / 2).max(Duration::from_millis(10));

        let handle = {
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = sleep(period) => {}
                    }
                    if lock.extend(&held, ttl).await {
                        debug!(key = %held.key, "lock renewed");
                    } else {
                        error!(key = %held.key, "lock renewal refused; ownership lost");
                        on_lost.cancel();
                        break;
                    }
                }
            })
        };

        Self { stop, handle }
    }

    /// Stop renewing and wait for the renewer to exit.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}
