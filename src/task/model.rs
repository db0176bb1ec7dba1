// src/task/model.rs

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Priority, TaskId, TenantId, WorkflowId};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
    /// Waiting for `next_retry_at` after a failed or timed-out attempt.
    Retry,
}

impl TaskStatus {
    /// No further automatic transition happens from these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    pub fn is_success(self) -> bool {
        self == TaskStatus::Success
    }

    /// Pending or running: somebody is (about to be) working on it.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// What a task actually does when dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run through `sh -c` (or `cmd /C` on Windows).
    Shell { command: String },
    /// HTTP request; any non-2xx response is a failure.
    Http {
        method: String,
        url: String,
        body: Option<String>,
    },
    /// Invoke a procedure registered with the executor by name.
    Procedure {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Shell { .. } => "shell",
            TaskKind::Http { .. } => "http",
            TaskKind::Procedure { .. } => "procedure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            interval: Duration::from_secs(60),
        }
    }
}

/// Optional `[start, end]` window outside of which a task must not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ScheduleWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if let Some(start) = self.start {
            if now < start {
                return false;
            }
        }
        match self.end {
            Some(end) => now <= end,
            None => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        }
    }
}

/// A schedulable unit of work.
///
/// Mutated only by the orchestrator while it holds `task:{id}`; every save
/// goes through the store's version check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub tenant_id: TenantId,
    /// Owning workflow, or `None` for a standalone task.
    pub workflow_id: Option<WorkflowId>,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: Priority,
    pub enabled: bool,
    pub window: ScheduleWindow,
    pub cron: Option<String>,
    pub retry: RetryPolicy,
    pub current_retries: u32,
    pub timeout: Duration,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub last_duration: Option<Duration>,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub version: u64,
    pub deleted: bool,
}

impl Task {
    pub fn new(id: TaskId, tenant_id: TenantId, name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id,
            tenant_id,
            workflow_id: None,
            name: name.into(),
            kind,
            status: TaskStatus::Created,
            priority: Priority::default(),
            enabled: true,
            window: ScheduleWindow::default(),
            cron: None,
            retry: RetryPolicy::default(),
            current_retries: 0,
            timeout: Duration::from_secs(300),
            last_execution: None,
            next_execution: None,
            next_retry_at: None,
            last_result: None,
            last_duration: None,
            notify_on_success: false,
            notify_on_failure: true,
            version: 0,
            deleted: false,
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.workflow_id.is_none()
    }

    pub fn retries_exhausted(&self) -> bool {
        self.current_retries >= self.retry.max_retries
    }

    /// Whether the outcome of an attempt ending in `status` is worth a
    /// notification.
    pub fn wants_notification(&self, status: TaskStatus) -> bool {
        match status {
            TaskStatus::Success => self.notify_on_success,
            TaskStatus::Failed | TaskStatus::Timeout => self.notify_on_failure,
            _ => false,
        }
    }
}
