// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::engine::{EngineOptions, PoolSizes};
use crate::task::model::TaskKind;
use crate::types::{ErrorPolicy, Priority};

/// Top-level configuration exactly as read from a TOML file.
///
/// ```toml
/// [engine]
/// instance_id = "node-a"
/// poll_interval_ms = 1000
///
/// [lock]
/// backend = "sql"
/// path = "jobflow.db"
///
/// [task.cleanup]
/// action = { type = "shell", command = "rm -rf /tmp/scratch" }
/// cron = "0 0 3 * * *"
///
/// [workflow.nightly]
/// cron = "0 0 1 * * *"
/// error_policy = "skip_failed"
///
/// [workflow.nightly.task.extract]
/// action = { type = "procedure", name = "echo", args = ["extract"] }
///
/// [workflow.nightly.task.load]
/// action = { type = "shell", command = "./load.sh" }
/// after = ["extract"]
/// ```
///
/// All sections are optional; validation happens when converting into
/// [`ConfigFile`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub lock: LockSection,

    #[serde(default)]
    pub pools: PoolSizes,

    #[serde(default)]
    pub notify: NotifySection,

    /// Standalone tasks from `[task.<name>]`.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,

    /// Workflows from `[workflow.<name>]`.
    #[serde(default)]
    pub workflow: BTreeMap<String, WorkflowConfig>,
}

/// Validated configuration. Only obtainable through
/// `ConfigFile::try_from(RawConfigFile)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub lock: LockSection,
    pub pools: PoolSizes,
    pub notify: NotifySection,
    pub task: BTreeMap<String, TaskConfig>,
    pub workflow: BTreeMap<String, WorkflowConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            engine: raw.engine,
            lock: raw.lock,
            pools: raw.pools,
            notify: raw.notify,
            task: raw.task,
            workflow: raw.workflow,
        }
    }

    /// Engine tuning derived from `[engine]`, `[lock]` and `[pools]`.
    pub fn engine_options(&self) -> EngineOptions {
        let defaults = EngineOptions::default();
        EngineOptions {
            instance_id: self
                .engine
                .instance_id
                .clone()
                .unwrap_or(defaults.instance_id),
            lock_ttl: Duration::from_millis(self.lock.ttl_ms),
            lock_wait: Duration::from_millis(self.lock.wait_ms),
            lock_retry_interval: Duration::from_millis(self.lock.retry_interval_ms),
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            pools: self.pools,
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Identity used as lock owner; a random one is generated when unset.
    pub instance_id: Option<String>,
    pub poll_interval_ms: u64,
    /// Tenant that owns everything defined in this file.
    pub tenant: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            instance_id: None,
            poll_interval_ms: 1000,
            tenant: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// In-process key-value store. Only coordinates within one process.
    #[default]
    Kv,
    /// SQLite table; shared by every process using the same file.
    Sql,
}

/// `[lock]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub backend: LockBackend,
    /// Database file for the `sql` backend. In-memory when unset.
    pub path: Option<PathBuf>,
    pub ttl_ms: u64,
    pub wait_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            backend: LockBackend::Kv,
            path: None,
            ttl_ms: 30_000,
            wait_ms: 5_000,
            retry_interval_ms: 100,
        }
    }
}

/// `[notify]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifySection {
    /// POST outcome notices as JSON to this URL. Log only when unset.
    #[serde(default)]
    pub webhook: Option<String>,
}

/// `[task.<name>]` or `[workflow.<w>.task.<name>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// What to run, e.g. `{ type = "shell", command = "echo hi" }`.
    pub action: TaskKind,

    #[serde(default)]
    pub cron: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub window_start: Option<DateTime<Utc>>,

    #[serde(default)]
    pub window_end: Option<DateTime<Utc>>,

    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_task_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub notify_on_success: bool,

    #[serde(default = "default_true")]
    pub notify_on_failure: bool,

    /// Tasks of the same workflow that must succeed first.
    #[serde(default)]
    pub after: Vec<String>,

    /// Tasks of the same workflow that must finish (in any state) first.
    #[serde(default)]
    pub after_completion: Vec<String>,
}

/// `[workflow.<name>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub cron: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub window_start: Option<DateTime<Utc>>,

    #[serde(default)]
    pub window_end: Option<DateTime<Utc>>,

    #[serde(default = "default_workflow_timeout_ms")]
    pub timeout_ms: u64,

    /// Allow overlapping runs (no workflow lock).
    #[serde(default)]
    pub concurrent: bool,

    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// Workflow-level retries used by `error_policy = "auto_retry"`.
    #[serde(default)]
    pub max_retries: u32,

    /// Workflows started after every run of this one that completes.
    #[serde(default)]
    pub downstream: Vec<String>,

    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

fn default_true() -> bool {
    true
}

fn default_retry_interval_ms() -> u64 {
    60_000
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_workflow_timeout_ms() -> u64 {
    3_600_000
}
