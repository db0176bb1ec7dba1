// src/config/catalog.rs

//! Config names to engine entities.
//!
//! Ids are assigned in name order: workflows `1..`, standalone tasks `1..`,
//! then the tasks of each workflow. Workflow tasks are addressed as
//! `"<workflow>.<task>"`.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::model::{ConfigFile, TaskConfig, WorkflowConfig};
use crate::engine::Orchestrator;
use crate::errors::{JobflowError, Result};
use crate::task::model::{RetryPolicy, ScheduleWindow, Task};
use crate::types::{DependencyType, TaskId, Target, TenantId, WorkflowId};
use crate::workflow::model::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEdge {
    pub workflow: WorkflowId,
    pub source: TaskId,
    pub target: TaskId,
    pub kind: DependencyType,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub workflows: Vec<Workflow>,
    pub tasks: Vec<Task>,
    pub edges: Vec<CatalogEdge>,
    names: BTreeMap<String, Target>,
}

impl Catalog {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let tenant = TenantId(cfg.engine.tenant);
        let mut catalog = Catalog::default();

        let workflow_ids: BTreeMap<&str, WorkflowId> = cfg
            .workflow
            .keys()
            .enumerate()
            .map(|(i, name)| (name.as_str(), WorkflowId(i as u64 + 1)))
            .collect();

        let mut next_task = 1u64;
        let mut alloc = || {
            let id = TaskId(next_task);
            next_task += 1;
            id
        };

        for (name, task_cfg) in cfg.task.iter() {
            let id = alloc();
            catalog.names.insert(name.clone(), Target::Task(id));
            catalog.tasks.push(build_task(id, tenant, name, None, task_cfg));
        }

        for (name, wf_cfg) in cfg.workflow.iter() {
            let Some(&wf_id) = workflow_ids.get(name.as_str()) else {
                continue;
            };
            catalog.names.insert(name.clone(), Target::Workflow(wf_id));

            let mut workflow = build_workflow(wf_id, tenant, name, wf_cfg);
            workflow.downstream_workflows = wf_cfg
                .downstream
                .iter()
                .filter_map(|d| workflow_ids.get(d.as_str()).copied())
                .collect();
            catalog.workflows.push(workflow);

            let mut task_ids: BTreeMap<&str, TaskId> = BTreeMap::new();
            for (task_name, task_cfg) in wf_cfg.task.iter() {
                let id = alloc();
                task_ids.insert(task_name.as_str(), id);
                catalog
                    .names
                    .insert(format!("{name}.{task_name}"), Target::Task(id));
                catalog
                    .tasks
                    .push(build_task(id, tenant, task_name, Some(wf_id), task_cfg));
            }

            for (task_name, task_cfg) in wf_cfg.task.iter() {
                let Some(&target) = task_ids.get(task_name.as_str()) else {
                    continue;
                };
                let deps = task_cfg
                    .after
                    .iter()
                    .map(|d| (d, DependencyType::SuccessRequired))
                    .chain(
                        task_cfg
                            .after_completion
                            .iter()
                            .map(|d| (d, DependencyType::CompletionRequired)),
                    );
                for (dep, kind) in deps {
                    if let Some(&source) = task_ids.get(dep.as_str()) {
                        catalog.edges.push(CatalogEdge {
                            workflow: wf_id,
                            source,
                            target,
                            kind,
                        });
                    }
                }
            }
        }

        catalog
    }

    /// Resolve a task, workflow or `"<workflow>.<task>"` name.
    pub fn lookup(&self, name: &str) -> Option<Target> {
        self.names.get(name).copied()
    }

    pub fn name_of(&self, target: Target) -> Option<&str> {
        self.names
            .iter()
            .find(|(_, t)| **t == target)
            .map(|(name, _)| name.as_str())
    }

    /// Register everything with the orchestrator. Edges go through
    /// `add_dependency`, so they are validated the same way as API calls.
    pub async fn install(&self, orchestrator: &Orchestrator) -> Result<()> {
        for workflow in self.workflows.iter() {
            orchestrator.schedule_workflow(workflow.clone()).await?;
        }
        for task in self.tasks.iter() {
            orchestrator.schedule_task(task.clone()).await?;
        }
        for edge in self.edges.iter() {
            orchestrator
                .add_dependency(edge.workflow, edge.source, edge.target, edge.kind)
                .await
                .map_err(|e| match e {
                    JobflowError::CycleDetected(msg) => JobflowError::ConfigError(msg),
                    other => other,
                })?;
            debug!(workflow = %edge.workflow, source = %edge.source, target = %edge.target, "edge installed");
        }
        info!(
            workflows = self.workflows.len(),
            tasks = self.tasks.len(),
            edges = self.edges.len(),
            "catalog installed"
        );
        Ok(())
    }
}

fn window(start: Option<chrono::DateTime<chrono::Utc>>, end: Option<chrono::DateTime<chrono::Utc>>) -> ScheduleWindow {
    ScheduleWindow { start, end }
}

fn build_task(
    id: TaskId,
    tenant: TenantId,
    name: &str,
    workflow: Option<WorkflowId>,
    cfg: &TaskConfig,
) -> Task {
    let mut task = Task::new(id, tenant, name, cfg.action.clone());
    task.workflow_id = workflow;
    task.priority = cfg.priority;
    task.enabled = cfg.enabled;
    task.window = window(cfg.window_start, cfg.window_end);
    task.cron = cfg.cron.clone();
    task.retry = RetryPolicy {
        max_retries: cfg.max_retries,
        interval: Duration::from_millis(cfg.retry_interval_ms),
    };
    task.timeout = Duration::from_millis(cfg.timeout_ms);
    task.notify_on_success = cfg.notify_on_success;
    task.notify_on_failure = cfg.notify_on_failure;
    task
}

fn build_workflow(id: WorkflowId, tenant: TenantId, name: &str, cfg: &WorkflowConfig) -> Workflow {
    let mut workflow = Workflow::new(id, tenant, name);
    workflow.priority = cfg.priority;
    workflow.enabled = cfg.enabled;
    workflow.cron = cfg.cron.clone();
    workflow.window = window(cfg.window_start, cfg.window_end);
    workflow.timeout = Duration::from_millis(cfg.timeout_ms);
    workflow.concurrent = cfg.concurrent;
    workflow.error_policy = cfg.error_policy;
    workflow.retry.max_retries = cfg.max_retries;
    workflow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_and_validate;
    use crate::types::ErrorPolicy;

    const CONFIG: &str = r#"
[engine]
tenant = 7

[task.cleanup]
action = { type = "shell", command = "true" }
cron = "0 0 3 * * *"

[workflow.nightly]
error_policy = "skip_failed"
downstream = ["report"]

[workflow.nightly.task.extract]
action = { type = "procedure", name = "echo", args = ["x"] }

[workflow.nightly.task.load]
action = { type = "procedure", name = "noop" }
after = ["extract"]

[workflow.nightly.task.audit]
action = { type = "procedure", name = "noop" }
after_completion = ["load"]
max_retries = 2

[workflow.report.task.send]
action = { type = "http", method = "post", url = "http://localhost:9/report" }
"#;

    #[test]
    fn ids_and_edges_follow_names() {
        let cfg = parse_and_validate(CONFIG).unwrap();
        let catalog = Catalog::from_config(&cfg);

        assert_eq!(catalog.lookup("nightly"), Some(Target::Workflow(WorkflowId(1))));
        assert_eq!(catalog.lookup("report"), Some(Target::Workflow(WorkflowId(2))));
        assert_eq!(catalog.lookup("cleanup"), Some(Target::Task(TaskId(1))));
        // nightly tasks in name order: audit, extract, load.
        assert_eq!(catalog.lookup("nightly.audit"), Some(Target::Task(TaskId(2))));
        assert_eq!(catalog.lookup("nightly.extract"), Some(Target::Task(TaskId(3))));
        assert_eq!(catalog.lookup("nightly.load"), Some(Target::Task(TaskId(4))));
        assert_eq!(catalog.name_of(Target::Task(TaskId(5))), Some("report.send"));

        let nightly = &catalog.workflows[0];
        assert_eq!(nightly.tenant_id, TenantId(7));
        assert_eq!(nightly.error_policy, ErrorPolicy::SkipFailed);
        assert_eq!(nightly.downstream_workflows, vec![WorkflowId(2)]);

        assert_eq!(
            catalog.edges,
            vec![
                CatalogEdge {
                    workflow: WorkflowId(1),
                    source: TaskId(4),
                    target: TaskId(2),
                    kind: DependencyType::CompletionRequired,
                },
                CatalogEdge {
                    workflow: WorkflowId(1),
                    source: TaskId(3),
                    target: TaskId(4),
                    kind: DependencyType::SuccessRequired,
                },
            ]
        );

        let audit = catalog.tasks.iter().find(|t| t.id == TaskId(2)).unwrap();
        assert_eq!(audit.workflow_id, Some(WorkflowId(1)));
        assert_eq!(audit.retry.max_retries, 2);
    }
}
