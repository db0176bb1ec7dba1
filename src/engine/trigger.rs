// src/engine/trigger.rs

//! Trigger loop: periodic scheduling cycles plus trigger requests raised by
//! finished runs (downstream workflows).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::orchestrator::{Orchestrator, RunTicket};
use crate::errors::Result;
use crate::types::{Target, TriggerType};

/// A request to start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRequest {
    pub target: Target,
    pub trigger: TriggerType,
}

#[derive(Debug)]
pub struct TriggerLoop {
    orchestrator: Orchestrator,
    requests: mpsc::UnboundedReceiver<TriggerRequest>,
    poll_interval: Duration,
}

impl TriggerLoop {
    /// Attach to `orchestrator`. Only one loop can exist per orchestrator;
    /// later calls return `None`.
    pub fn new(orchestrator: Orchestrator) -> Option<Self> {
        let requests = orchestrator.take_requests()?;
        let poll_interval = orchestrator.options().poll_interval;
        Some(Self {
            orchestrator,
            requests,
            poll_interval,
        })
    }

    /// Poll for due work every `poll_interval` and serve trigger requests
    /// until `shutdown` fires. Runs started here are detached.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(poll_interval = ?self.poll_interval, "trigger loop started");
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("trigger loop shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.orchestrator.poll_due().await {
                        error!(error = %e, "scheduling cycle failed");
                    }
                }

                Some(request) = self.requests.recv() => {
                    debug!(target_id = %request.target, trigger = %request.trigger, "trigger request");
                    self.orchestrator.fire(request).await;
                }
            }
        }
        Ok(())
    }

    /// Run one scheduling cycle, then keep waiting on every started run and
    /// on the runs they trigger until nothing is left. Used by `--once`.
    pub async fn run_until_idle(&mut self, mut tickets: Vec<RunTicket>) -> Result<()> {
        tickets.extend(self.orchestrator.poll_due().await?);

        while !tickets.is_empty() {
            for ticket in std::mem::take(&mut tickets) {
                let target = ticket.target;
                match ticket.wait().await {
                    Ok(state) => info!(target_id = %target, ?state, "run finished"),
                    Err(e) => warn!(target_id = %target, error = %e, "run did not finish cleanly"),
                }
            }
            while let Ok(request) = self.requests.try_recv() {
                tickets.extend(self.orchestrator.fire(request).await);
            }
        }
        Ok(())
    }
}
