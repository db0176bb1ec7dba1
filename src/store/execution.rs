// src/store/execution.rs

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::duration_until;
use crate::errors::{JobflowError, Result};
use crate::task::model::TaskStatus;
use crate::types::{Target, TriggerType};
use crate::workflow::model::WorkflowStatus;

/// Status vocabulary shared by task and workflow execution records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    /// The attempt failed and another one is scheduled.
    Retry,
}

impl ExecutionStatus {
    pub fn is_open(self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl From<TaskStatus> for ExecutionStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Created | TaskStatus::Pending => ExecutionStatus::Pending,
            TaskStatus::Running => ExecutionStatus::Running,
            TaskStatus::Success => ExecutionStatus::Completed,
            TaskStatus::Failed => ExecutionStatus::Failed,
            TaskStatus::Timeout => ExecutionStatus::Timeout,
            TaskStatus::Cancelled => ExecutionStatus::Cancelled,
            TaskStatus::Retry => ExecutionStatus::Retry,
        }
    }
}

impl From<WorkflowStatus> for ExecutionStatus {
    fn from(status: WorkflowStatus) -> Self {
        match status {
            WorkflowStatus::Created | WorkflowStatus::Scheduled => ExecutionStatus::Pending,
            WorkflowStatus::Running | WorkflowStatus::Paused => ExecutionStatus::Running,
            WorkflowStatus::Retry => ExecutionStatus::Retry,
            WorkflowStatus::Completed => ExecutionStatus::Completed,
            WorkflowStatus::Failed => ExecutionStatus::Failed,
            WorkflowStatus::Cancelled => ExecutionStatus::Cancelled,
            WorkflowStatus::Timeout => ExecutionStatus::Timeout,
        }
    }
}

/// Audit record of one task attempt or one workflow run.
///
/// Opened when the attempt starts and closed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub target: Target,
    /// Workflow run this record belongs to, if any.
    pub run_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub trigger: TriggerType,
    /// Instance that executed it.
    pub executor: String,
    pub message: Option<String>,
}

impl ExecutionRecord {
    pub fn open(
        target: Target,
        trigger: TriggerType,
        executor: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            run_id: None,
            status: ExecutionStatus::Running,
            started_at: now,
            ended_at: None,
            duration: None,
            retry_count: 0,
            next_retry_at: None,
            trigger,
            executor: executor.into(),
            message: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Close the record with a final status.
    pub fn close(
        &mut self,
        status: ExecutionStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(JobflowError::InvalidTransition(format!(
                "execution {} is already closed as {:?}",
                self.id, self.status
            )));
        }
        if status.is_open() {
            return Err(JobflowError::InvalidTransition(format!(
                "execution {} cannot be closed as {status:?}",
                self.id
            )));
        }
        self.status = status;
        self.message = message;
        self.ended_at = Some(now);
        self.duration = Some(duration_until(self.started_at, now));
        Ok(())
    }
}
