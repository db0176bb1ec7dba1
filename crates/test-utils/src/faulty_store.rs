use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobflow::errors::{JobflowError, Result};
use jobflow::store::{ExecutionRecord, InMemoryStore, Store};
use jobflow::task::model::Task;
use jobflow::types::{DependencyType, EdgeId, TaskId, Target, TenantId, WorkflowId};
use jobflow::workflow::model::{DependencyEdge, Workflow};

/// An [`InMemoryStore`] whose task saves can be made to fail, as if the
/// task had been deleted underneath a run.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: Arc<InMemoryStore>,
    vanished: Mutex<HashSet<TaskId>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            vanished: Mutex::default(),
        }
    }

    /// Saves of `task` fail with `TaskNotFound` until [`FaultyStore::heal`].
    pub fn vanish(&self, task: TaskId) {
        self.vanished.lock().unwrap().insert(task);
    }

    pub fn heal(&self) {
        self.vanished.lock().unwrap().clear();
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn load_task(&self, id: TaskId) -> Result<Task> {
        self.inner.load_task(id).await
    }

    async fn insert_task(&self, task: Task) -> Result<()> {
        self.inner.insert_task(task).await
    }

    async fn save_task(&self, task: &mut Task) -> Result<()> {
        if self.vanished.lock().unwrap().contains(&task.id) {
            return Err(JobflowError::TaskNotFound(task.id));
        }
        self.inner.save_task(task).await
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        self.inner.load_workflow(id).await
    }

    async fn insert_workflow(&self, workflow: Workflow) -> Result<()> {
        self.inner.insert_workflow(workflow).await
    }

    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<()> {
        self.inner.save_workflow(workflow).await
    }

    async fn list_workflow_tasks(&self, workflow: WorkflowId) -> Result<Vec<Task>> {
        self.inner.list_workflow_tasks(workflow).await
    }

    async fn list_edges(&self, workflow: WorkflowId) -> Result<Vec<DependencyEdge>> {
        self.inner.list_edges(workflow).await
    }

    async fn insert_edge(
        &self,
        workflow: WorkflowId,
        source: TaskId,
        target: TaskId,
        kind: DependencyType,
    ) -> Result<DependencyEdge> {
        self.inner.insert_edge(workflow, source, target, kind).await
    }

    async fn delete_edge(&self, id: EdgeId) -> Result<bool> {
        self.inner.delete_edge(id).await
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        self.inner.list_tenants().await
    }

    async fn find_due_tasks(&self, tenant: TenantId, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.inner.find_due_tasks(tenant, now).await
    }

    async fn find_due_workflows(
        &self,
        tenant: TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Workflow>> {
        self.inner.find_due_workflows(tenant, now).await
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.inner.save_execution(record).await
    }

    async fn list_executions(&self, target: Target) -> Result<Vec<ExecutionRecord>> {
        self.inner.list_executions(target).await
    }
}
