// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile, TaskConfig, WorkflowConfig};
use crate::errors::{JobflowError, Result};
use crate::schedule::parse_cron;
use crate::task::model::TaskKind;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = JobflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_work(cfg)?;
    validate_engine(cfg)?;
    for (name, task) in cfg.task.iter() {
        validate_standalone_task(name, task)?;
    }
    for (name, workflow) in cfg.workflow.iter() {
        validate_workflow(cfg, name, workflow)?;
    }
    Ok(())
}

fn config_error(msg: impl Into<String>) -> JobflowError {
    JobflowError::ConfigError(msg.into())
}

fn ensure_has_work(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() && cfg.workflow.is_empty() {
        return Err(config_error(
            "config must contain at least one [task.<name>] or [workflow.<name>] section",
        ));
    }
    Ok(())
}

fn validate_engine(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.poll_interval_ms == 0 {
        return Err(config_error("[engine].poll_interval_ms must be >= 1 (got 0)"));
    }
    if cfg.lock.ttl_ms == 0 {
        return Err(config_error("[lock].ttl_ms must be >= 1 (got 0)"));
    }
    if cfg.lock.retry_interval_ms == 0 {
        return Err(config_error("[lock].retry_interval_ms must be >= 1 (got 0)"));
    }
    Ok(())
}

fn validate_standalone_task(name: &str, task: &TaskConfig) -> Result<()> {
    if !task.after.is_empty() || !task.after_completion.is_empty() {
        return Err(config_error(format!(
            "task '{name}' is not part of a workflow and cannot use `after`"
        )));
    }
    validate_task(&format!("task '{name}'"), task)
}

fn validate_task(label: &str, task: &TaskConfig) -> Result<()> {
    validate_action(label, &task.action)?;
    validate_schedule(label, task.cron.as_deref(), task.window_start, task.window_end)?;
    if task.timeout_ms == 0 {
        return Err(config_error(format!("{label}: timeout_ms must be >= 1 (got 0)")));
    }
    Ok(())
}

fn validate_action(label: &str, action: &TaskKind) -> Result<()> {
    match action {
        TaskKind::Shell { command } if command.trim().is_empty() => Err(config_error(format!(
            "{label}: shell action needs a non-empty command"
        ))),
        TaskKind::Http { method, url, .. } => {
            if reqwest::Method::from_bytes(method.to_uppercase().as_bytes()).is_err() {
                return Err(config_error(format!(
                    "{label}: invalid HTTP method '{method}'"
                )));
            }
            if url.trim().is_empty() {
                return Err(config_error(format!("{label}: http action needs a url")));
            }
            Ok(())
        }
        TaskKind::Procedure { name, .. } if name.trim().is_empty() => Err(config_error(format!(
            "{label}: procedure action needs a name"
        ))),
        _ => Ok(()),
    }
}

fn validate_schedule(
    label: &str,
    cron: Option<&str>,
    start: Option<chrono::DateTime<chrono::Utc>>,
    end: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    if let Some(expr) = cron {
        parse_cron(expr).map_err(|e| config_error(format!("{label}: {e}")))?;
    }
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(config_error(format!(
                "{label}: window_start is after window_end"
            )));
        }
    }
    Ok(())
}

fn validate_workflow(cfg: &RawConfigFile, name: &str, workflow: &WorkflowConfig) -> Result<()> {
    let label = format!("workflow '{name}'");
    validate_schedule(
        &label,
        workflow.cron.as_deref(),
        workflow.window_start,
        workflow.window_end,
    )?;
    if workflow.timeout_ms == 0 {
        return Err(config_error(format!("{label}: timeout_ms must be >= 1 (got 0)")));
    }

    for downstream in workflow.downstream.iter() {
        if downstream == name {
            return Err(config_error(format!(
                "{label} cannot list itself in `downstream`"
            )));
        }
        if !cfg.workflow.contains_key(downstream) {
            return Err(config_error(format!(
                "{label} has unknown downstream workflow '{downstream}'"
            )));
        }
    }

    for (task_name, task) in workflow.task.iter() {
        validate_task(&format!("task '{name}.{task_name}'"), task)?;
        for dep in task.after.iter().chain(task.after_completion.iter()) {
            if !workflow.task.contains_key(dep) {
                return Err(config_error(format!(
                    "task '{name}.{task_name}' has unknown dependency '{dep}'"
                )));
            }
            if dep == task_name {
                return Err(config_error(format!(
                    "task '{name}.{task_name}' cannot depend on itself"
                )));
            }
        }
    }

    validate_dag(name, workflow)
}

fn validate_dag(name: &str, workflow: &WorkflowConfig) -> Result<()> {
    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for task_name in workflow.task.keys() {
        graph.add_node(task_name.as_str());
    }
    for (task_name, task) in workflow.task.iter() {
        for dep in task.after.iter().chain(task.after_completion.iter()) {
            graph.add_edge(dep.as_str(), task_name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(JobflowError::CycleDetected(format!(
            "workflow '{name}': cycle involving task '{}'",
            cycle.node_id()
        ))),
    }
}
