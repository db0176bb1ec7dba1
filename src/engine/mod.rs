// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - the [`orchestrator`], which takes locks, drives task attempts and
//!   workflow runs, and exposes the operator API
//! - the [`trigger`] loop, which fires due schedules and upstream-workflow
//!   triggers
//! - bounded worker [`pools`] and lock [`keepalive`] renewal
//!
//! The per-run semantics live in [`crate::workflow::run`] and
//! [`crate::task::state`]; this module is the async shell around them.

use std::time::Duration;

use uuid::Uuid;

pub mod keepalive;
pub mod orchestrator;
pub mod pools;
pub mod trigger;

pub use orchestrator::{FinalState, Orchestrator, OrchestratorBuilder, RunTicket, TargetState};
pub use pools::{Pool, PoolSizes, WorkerPools};
pub use trigger::{TriggerLoop, TriggerRequest};

/// Operator commands delivered to a running workflow's driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Pause,
    Resume,
    Cancel,
}

/// Engine tuning shared by the orchestrator and the trigger loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Identity written into locks and execution records.
    pub instance_id: String,
    pub lock_ttl: Duration,
    /// How long a trigger waits for a held lock before giving up.
    pub lock_wait: Duration,
    pub lock_retry_interval: Duration,
    /// Trigger loop period.
    pub poll_interval: Duration,
    pub pools: PoolSizes,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            instance_id: format!("jobflow-{}", Uuid::new_v4()),
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            pools: PoolSizes::default(),
        }
    }
}
