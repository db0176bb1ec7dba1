// src/workflow/model.rs

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::model::{RetryPolicy, ScheduleWindow};
use crate::types::{DependencyType, EdgeId, ErrorPolicy, Priority, TaskId, TenantId, WorkflowId};

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Scheduled,
    Running,
    /// Only reachable from `Running`; completions are still recorded but no
    /// new task is dispatched.
    Paused,
    /// A failed task is being re-queued under the auto-retry policy.
    Retry,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Timeout
        )
    }

    /// A run is in progress.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Running | WorkflowStatus::Paused | WorkflowStatus::Retry
        )
    }
}

/// Task counters of the current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Tasks never dispatched because a required upstream task failed.
    pub skipped: usize,
}

impl RunProgress {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// A named DAG of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub tenant_id: TenantId,
    pub name: String,
    pub status: WorkflowStatus,
    pub priority: Priority,
    pub enabled: bool,
    pub cron: Option<String>,
    pub window: ScheduleWindow,
    pub timeout: Duration,
    pub concurrent: bool,
    pub error_policy: ErrorPolicy,
    /// Workflow-level retries, consumed by [`ErrorPolicy::AutoRetry`].
    pub retry: RetryPolicy,
    pub progress: RunProgress,
    /// Triggered with `TriggerType::UpstreamWorkflow` after every run that
    /// ends `Completed`.
    pub downstream_workflows: Vec<WorkflowId>,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    pub version: u64,
    pub deleted: bool,
}

impl Workflow {
    pub fn new(id: WorkflowId, tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id,
            name: name.into(),
            status: WorkflowStatus::Created,
            priority: Priority::default(),
            enabled: true,
            cron: None,
            window: ScheduleWindow::default(),
            timeout: Duration::from_secs(3600),
            concurrent: false,
            error_policy: ErrorPolicy::default(),
            retry: RetryPolicy::default(),
            progress: RunProgress::default(),
            downstream_workflows: Vec::new(),
            last_execution: None,
            next_execution: None,
            version: 0,
            deleted: false,
        }
    }

    /// Overlapping runs are permitted; the workflow lock is skipped.
    pub fn allows_concurrent(&self) -> bool {
        self.concurrent
    }

    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.deleted && self.window.contains(now)
    }

    /// `Created -> Scheduled`. Re-scheduling an idle workflow is a no-op.
    pub fn mark_scheduled(&mut self) -> bool {
        match self.status {
            WorkflowStatus::Created => {
                self.status = WorkflowStatus::Scheduled;
                true
            }
            _ => false,
        }
    }
}

/// Directed edge `source -> target` inside one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: EdgeId,
    pub workflow_id: WorkflowId,
    pub source: TaskId,
    pub target: TaskId,
    pub kind: DependencyType,
}

impl DependencyEdge {
    pub fn as_tuple(&self) -> (TaskId, TaskId, DependencyType) {
        (self.source, self.target, self.kind)
    }
}
