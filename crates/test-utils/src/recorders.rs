use std::sync::Mutex;

use async_trait::async_trait;

use jobflow::audit::{AuditAction, AuditEntry, AuditSink};
use jobflow::errors::Result;
use jobflow::notify::{Notifier, TaskNotice, WorkflowNotice};

/// Keeps every notice it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub tasks: Mutex<Vec<TaskNotice>>,
    pub workflows: Mutex<Vec<WorkflowNotice>>,
}

impl RecordingNotifier {
    pub fn task_notices(&self) -> Vec<TaskNotice> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn workflow_notices(&self) -> Vec<WorkflowNotice> {
        self.workflows.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_task_outcome(&self, notice: &TaskNotice) -> Result<()> {
        self.tasks.lock().unwrap().push(notice.clone());
        Ok(())
    }

    async fn notify_workflow_outcome(&self, notice: &WorkflowNotice) -> Result<()> {
        self.workflows.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Keeps every audit entry it receives.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAudit {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.entries().iter().map(|e| e.action).collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
