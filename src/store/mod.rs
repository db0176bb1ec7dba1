// src/store/mod.rs

//! Persistence port for tasks, workflows, edges and execution records.
//!
//! Every save is version checked: the caller passes the entity it loaded,
//! the store refuses the write if someone else saved in between, and bumps
//! the version on success.

pub mod execution;
pub mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::task::model::Task;
use crate::types::{DependencyType, EdgeId, TaskId, Target, TenantId, WorkflowId};
use crate::workflow::model::{DependencyEdge, Workflow};

pub use execution::{ExecutionRecord, ExecutionStatus};
pub use memory::InMemoryStore;

#[async_trait]
pub trait Store: Send + Sync + Debug {
    async fn load_task(&self, id: TaskId) -> Result<Task>;

    async fn insert_task(&self, task: Task) -> Result<()>;

    /// Version-checked save; bumps `task.version` on success.
    async fn save_task(&self, task: &mut Task) -> Result<()>;

    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow>;

    async fn insert_workflow(&self, workflow: Workflow) -> Result<()>;

    /// Version-checked save; bumps `workflow.version` on success.
    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<()>;

    /// Non-deleted tasks owned by the workflow, ordered by id.
    async fn list_workflow_tasks(&self, workflow: WorkflowId) -> Result<Vec<Task>>;

    async fn list_edges(&self, workflow: WorkflowId) -> Result<Vec<DependencyEdge>>;

    /// Store a new edge and return it with its assigned id.
    async fn insert_edge(
        &self,
        workflow: WorkflowId,
        source: TaskId,
        target: TaskId,
        kind: DependencyType,
    ) -> Result<DependencyEdge>;

    async fn delete_edge(&self, id: EdgeId) -> Result<bool>;

    async fn list_tenants(&self) -> Result<Vec<TenantId>>;

    /// Standalone tasks of the tenant whose next execution is due.
    async fn find_due_tasks(&self, tenant: TenantId, now: DateTime<Utc>) -> Result<Vec<Task>>;

    async fn find_due_workflows(&self, tenant: TenantId, now: DateTime<Utc>)
    -> Result<Vec<Workflow>>;

    /// Insert or update a record. A record that is already closed in the
    /// store cannot be changed.
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Records for `target`, oldest first.
    async fn list_executions(&self, target: Target) -> Result<Vec<ExecutionRecord>>;
}
