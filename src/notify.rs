// src/notify.rs

//! Outcome notifications.
//!
//! Delivery is fire-and-forget: the orchestrator runs notifiers on their
//! own pool and only logs failures. Nothing here can change task or
//! workflow state.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{JobflowError, Result};
use crate::task::model::TaskStatus;
use crate::types::{TaskId, TenantId, WorkflowId};
use crate::workflow::model::{RunProgress, WorkflowStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskNotice {
    pub tenant: TenantId,
    pub task: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub retries: u32,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowNotice {
    pub tenant: TenantId,
    pub workflow: WorkflowId,
    pub name: String,
    pub run_id: Uuid,
    pub status: WorkflowStatus,
    pub progress: RunProgress,
}

#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    async fn notify_task_outcome(&self, notice: &TaskNotice) -> Result<()>;

    async fn notify_workflow_outcome(&self, notice: &WorkflowNotice) -> Result<()>;
}

/// Writes every notice to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_task_outcome(&self, notice: &TaskNotice) -> Result<()> {
        match notice.status {
            TaskStatus::Success => info!(
                task = %notice.task,
                name = %notice.name,
                "task succeeded"
            ),
            status => warn!(
                task = %notice.task,
                name = %notice.name,
                ?status,
                retries = notice.retries,
                message = notice.message.as_deref().unwrap_or(""),
                "task did not succeed"
            ),
        }
        Ok(())
    }

    async fn notify_workflow_outcome(&self, notice: &WorkflowNotice) -> Result<()> {
        info!(
            workflow = %notice.workflow,
            name = %notice.name,
            run_id = %notice.run_id,
            status = ?notice.status,
            completed = notice.progress.completed,
            failed = notice.progress.failed,
            skipped = notice.progress.skipped,
            total = notice.progress.total,
            "workflow run finished"
        );
        Ok(())
    }
}

/// POSTs notices as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| JobflowError::ConfigError(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, body: &T) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| JobflowError::Backend(format!("webhook {}: {e}", self.url)))?;

        if !response.status().is_success() {
            return Err(JobflowError::Backend(format!(
                "webhook {} answered {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_task_outcome(&self, notice: &TaskNotice) -> Result<()> {
        self.post(notice).await
    }

    async fn notify_workflow_outcome(&self, notice: &WorkflowNotice) -> Result<()> {
        self.post(notice).await
    }
}
