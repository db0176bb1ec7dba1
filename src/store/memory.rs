// src/store/memory.rs

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::errors::{JobflowError, Result};
use crate::store::{ExecutionRecord, Store};
use crate::task::model::Task;
use crate::types::{DependencyType, EdgeId, TaskId, Target, TenantId, WorkflowId};
use crate::workflow::model::{DependencyEdge, Workflow};

#[derive(Debug, Default)]
struct Inner {
    tasks: BTreeMap<TaskId, Task>,
    workflows: BTreeMap<WorkflowId, Workflow>,
    edges: BTreeMap<EdgeId, DependencyEdge>,
    executions: Vec<ExecutionRecord>,
    next_edge: u64,
}

/// Process-local [`Store`]. Strongly consistent by construction.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_version(entity: String, stored: u64, given: u64) -> Result<()> {
    if stored != given {
        return Err(JobflowError::StaleVersion {
            entity,
            expected: given,
            found: stored,
        });
    }
    Ok(())
}

#[async_trait]
impl Store for InMemoryStore {
    async fn load_task(&self, id: TaskId) -> Result<Task> {
        self.inner
            .read()
            .tasks
            .get(&id)
            .filter(|t| !t.deleted)
            .cloned()
            .ok_or(JobflowError::TaskNotFound(id))
    }

    async fn insert_task(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.tasks.contains_key(&task.id) {
            return Err(JobflowError::ConfigError(format!(
                "{} already exists",
                task.id
            )));
        }
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn save_task(&self, task: &mut Task) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or(JobflowError::TaskNotFound(task.id))?;
        check_version(task.id.to_string(), stored.version, task.version)?;

        task.version += 1;
        *stored = task.clone();
        debug!(task = %task.id, version = task.version, status = ?task.status, "task saved");
        Ok(())
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        self.inner
            .read()
            .workflows
            .get(&id)
            .filter(|w| !w.deleted)
            .cloned()
            .ok_or(JobflowError::WorkflowNotFound(id))
    }

    async fn insert_workflow(&self, workflow: Workflow) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.workflows.contains_key(&workflow.id) {
            return Err(JobflowError::ConfigError(format!(
                "{} already exists",
                workflow.id
            )));
        }
        inner.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .workflows
            .get_mut(&workflow.id)
            .ok_or(JobflowError::WorkflowNotFound(workflow.id))?;
        check_version(workflow.id.to_string(), stored.version, workflow.version)?;

        workflow.version += 1;
        *stored = workflow.clone();
        debug!(
            workflow = %workflow.id,
            version = workflow.version,
            status = ?workflow.status,
            "workflow saved"
        );
        Ok(())
    }

    async fn list_workflow_tasks(&self, workflow: WorkflowId) -> Result<Vec<Task>> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.workflow_id == Some(workflow) && !t.deleted)
            .cloned()
            .collect())
    }

    async fn list_edges(&self, workflow: WorkflowId) -> Result<Vec<DependencyEdge>> {
        Ok(self
            .inner
            .read()
            .edges
            .values()
            .filter(|e| e.workflow_id == workflow)
            .copied()
            .collect())
    }

    async fn insert_edge(
        &self,
        workflow: WorkflowId,
        source: TaskId,
        target: TaskId,
        kind: DependencyType,
    ) -> Result<DependencyEdge> {
        let mut inner = self.inner.write();
        if inner
            .edges
            .values()
            .any(|e| e.workflow_id == workflow && e.source == source && e.target == target)
        {
            return Err(JobflowError::InvalidDependency(format!(
                "dependency {source} -> {target} already exists"
            )));
        }

        inner.next_edge += 1;
        let edge = DependencyEdge {
            id: EdgeId(inner.next_edge),
            workflow_id: workflow,
            source,
            target,
            kind,
        };
        inner.edges.insert(edge.id, edge);
        Ok(edge)
    }

    async fn delete_edge(&self, id: EdgeId) -> Result<bool> {
        Ok(self.inner.write().edges.remove(&id).is_some())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        let inner = self.inner.read();
        let tenants: BTreeSet<TenantId> = inner
            .tasks
            .values()
            .map(|t| t.tenant_id)
            .chain(inner.workflows.values().map(|w| w.tenant_id))
            .collect();
        Ok(tenants.into_iter().collect())
    }

    async fn find_due_tasks(&self, tenant: TenantId, now: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.tenant_id == tenant && t.is_standalone())
            .filter(|t| t.is_executable(now))
            .filter(|t| t.next_execution.is_some_and(|at| at <= now))
            .cloned()
            .collect())
    }

    async fn find_due_workflows(
        &self,
        tenant: TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Workflow>> {
        Ok(self
            .inner
            .read()
            .workflows
            .values()
            .filter(|w| w.tenant_id == tenant && w.is_dispatchable(now))
            .filter(|w| !w.status.is_active() || w.allows_concurrent())
            .filter(|w| w.next_execution.is_some_and(|at| at <= now))
            .cloned()
            .collect())
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.executions.iter_mut().find(|r| r.id == record.id) {
            Some(existing) if existing.is_closed() => {
                if existing != record {
                    return Err(JobflowError::InvalidTransition(format!(
                        "execution {} is closed and cannot change",
                        record.id
                    )));
                }
            }
            Some(existing) => *existing = record.clone(),
            None => inner.executions.push(record.clone()),
        }
        Ok(())
    }

    async fn list_executions(&self, target: Target) -> Result<Vec<ExecutionRecord>> {
        Ok(self
            .inner
            .read()
            .executions
            .iter()
            .filter(|r| r.target == target)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExecutionStatus;
    use crate::task::model::{TaskKind, TaskStatus};
    use crate::types::TriggerType;

    fn task(id: u64) -> Task {
        Task::new(
            TaskId(id),
            TenantId(1),
            format!("t{id}"),
            TaskKind::Shell {
                command: "true".into(),
            },
        )
    }

    #[tokio::test]
    async fn stale_save_fails_visibly() {
        let store = InMemoryStore::new();
        store.insert_task(task(1)).await.unwrap();

        let mut first = store.load_task(TaskId(1)).await.unwrap();
        let mut second = store.load_task(TaskId(1)).await.unwrap();

        first.status = TaskStatus::Pending;
        store.save_task(&mut first).await.unwrap();
        assert_eq!(first.version, 1);

        second.enabled = false;
        let err = store.save_task(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            JobflowError::StaleVersion {
                expected: 0,
                found: 1,
                ..
            }
        ));
        assert!(store.load_task(TaskId(1)).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn due_tasks_respect_tenant_schedule_and_status() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut due = task(1);
        due.next_execution = Some(now);
        let mut later = task(2);
        later.next_execution = Some(now + chrono::Duration::minutes(5));
        let mut running = task(3);
        running.next_execution = Some(now);
        running.status = TaskStatus::Running;
        let mut other_tenant = task(4);
        other_tenant.tenant_id = TenantId(2);
        other_tenant.next_execution = Some(now);

        for t in [due, later, running, other_tenant] {
            store.insert_task(t).await.unwrap();
        }

        let found = store.find_due_tasks(TenantId(1), now).await.unwrap();
        assert_eq!(found.iter().map(|t| t.id).collect::<Vec<_>>(), vec![TaskId(1)]);
        assert_eq!(
            store.list_tenants().await.unwrap(),
            vec![TenantId(1), TenantId(2)]
        );
    }

    #[tokio::test]
    async fn closed_execution_records_are_immutable() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut rec = ExecutionRecord::open(Target::Task(TaskId(1)), TriggerType::Api, "n", now);
        store.save_execution(&rec).await.unwrap();

        rec.close(ExecutionStatus::Failed, Some("boom".into()), now).unwrap();
        store.save_execution(&rec).await.unwrap();
        // Saving the same closed record again is harmless.
        store.save_execution(&rec).await.unwrap();

        let mut tampered = rec.clone();
        tampered.status = ExecutionStatus::Completed;
        assert!(store.save_execution(&tampered).await.is_err());

        let records = store.list_executions(Target::Task(TaskId(1))).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_edges_are_rejected() {
        let store = InMemoryStore::new();
        let wf = WorkflowId(1);
        let e = store
            .insert_edge(wf, TaskId(1), TaskId(2), DependencyType::SuccessRequired)
            .await
            .unwrap();
        assert_eq!(e.id, EdgeId(1));
        assert!(
            store
                .insert_edge(wf, TaskId(1), TaskId(2), DependencyType::CompletionRequired)
                .await
                .is_err()
        );
        assert!(store.delete_edge(e.id).await.unwrap());
        assert!(store.list_edges(wf).await.unwrap().is_empty());
    }
}
