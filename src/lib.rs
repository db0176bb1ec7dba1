// src/lib.rs

pub mod audit;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod schedule;
pub mod store;
pub mod task;
pub mod types;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::clock::{Clock, SystemClock};
use crate::config::{Catalog, ConfigFile, LockBackend, load_and_validate};
use crate::engine::{Orchestrator, TriggerLoop};
use crate::exec::{ActionExecutor, ProcedureRegistry};
use crate::lock::{DistributedLock, KvLock, MemoryKvStore, SqlLock};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::store::InMemoryStore;
use crate::types::{Target, TriggerType};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and the catalog of tasks and workflows
/// - lock backend, store, executor and notifier
/// - the orchestrator and its trigger loop
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;
    let catalog = Catalog::from_config(&cfg);

    if args.dry_run {
        print_dry_run(&cfg, &catalog);
        return Ok(());
    }

    let options = cfg.engine_options();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let lock = build_lock(&cfg, &options.instance_id, clock.clone()).await?;
    let notifier = build_notifier(&cfg)?;
    let executor = Arc::new(ActionExecutor::new(ProcedureRegistry::with_builtins()));

    let orchestrator = Orchestrator::builder(Arc::new(InMemoryStore::new()), lock, executor)
        .clock(clock)
        .notifier(notifier)
        .options(options)
        .build();
    catalog.install(&orchestrator).await?;

    let mut trigger_loop =
        TriggerLoop::new(orchestrator.clone()).ok_or_else(|| anyhow!("trigger loop already taken"))?;

    if let Some(name) = args.run.as_deref() {
        let target = resolve(&catalog, name)?;
        info!(%name, target_id = %target, "running on demand");
        let ticket = orchestrator.execute_now(target, TriggerType::Manual).await?;
        return trigger_loop.run_until_idle(vec![ticket]).await.map_err(Into::into);
    }

    if let Some(name) = args.from_task.as_deref() {
        let Target::Task(task) = resolve(&catalog, name)? else {
            bail!("--from-task expects a task name, got workflow '{name}'");
        };
        let workflow = catalog
            .tasks
            .iter()
            .find(|t| t.id == task)
            .and_then(|t| t.workflow_id)
            .ok_or_else(|| anyhow!("task '{name}' is not part of a workflow"))?;
        info!(%name, %workflow, "partial run");
        let ticket = orchestrator
            .execute_from_task(workflow, task, TriggerType::Manual)
            .await?;
        return trigger_loop.run_until_idle(vec![ticket]).await.map_err(Into::into);
    }

    if args.once {
        return trigger_loop.run_until_idle(Vec::new()).await.map_err(Into::into);
    }

    // Ctrl-C → graceful shutdown.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            shutdown.cancel();
        });
    }

    trigger_loop.run(shutdown).await?;
    Ok(())
}

async fn build_lock(
    cfg: &ConfigFile,
    owner: &str,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn DistributedLock>> {
    let lock: Arc<dyn DistributedLock> = match cfg.lock.backend {
        LockBackend::Kv => {
            let store = Arc::new(MemoryKvStore::new(clock));
            Arc::new(KvLock::new(store, owner))
        }
        LockBackend::Sql => match cfg.lock.path.as_ref() {
            Some(path) => Arc::new(
                SqlLock::open(path, owner, clock)
                    .await
                    .with_context(|| format!("opening lock database {}", path.display()))?,
            ),
            None => Arc::new(SqlLock::open_in_memory(owner, clock).await?),
        },
    };
    debug!(backend = ?cfg.lock.backend, owner, "lock backend ready");
    Ok(lock)
}

fn build_notifier(cfg: &ConfigFile) -> Result<Arc<dyn Notifier>> {
    Ok(match cfg.notify.webhook.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    })
}

fn resolve(catalog: &Catalog, name: &str) -> Result<Target> {
    catalog
        .lookup(name)
        .ok_or_else(|| anyhow!("no task or workflow named '{name}'"))
}

/// Print every workflow with its tasks in execution order, then the
/// standalone tasks.
fn print_dry_run(cfg: &ConfigFile, catalog: &Catalog) {
    println!("jobflow dry-run");
    println!("  lock.backend = {:?}", cfg.lock.backend);
    println!("  engine.tenant = {}", cfg.engine.tenant);
    println!();

    println!("workflows ({}):", catalog.workflows.len());
    for workflow in catalog.workflows.iter() {
        println!("  - {} ({})", workflow.name, workflow.id);
        if let Some(ref cron) = workflow.cron {
            println!("      cron: {cron}");
        }
        println!("      error_policy: {:?}", workflow.error_policy);
        if !workflow.downstream_workflows.is_empty() {
            let names: Vec<_> = workflow
                .downstream_workflows
                .iter()
                .filter_map(|w| catalog.name_of(Target::Workflow(*w)))
                .collect();
            println!("      downstream: {names:?}");
        }

        let tasks: Vec<_> = catalog
            .tasks
            .iter()
            .filter(|t| t.workflow_id == Some(workflow.id))
            .map(|t| t.id)
            .collect();
        let edges = catalog
            .edges
            .iter()
            .filter(|e| e.workflow == workflow.id)
            .map(|e| (e.source, e.target, e.kind));
        match dag::DependencyGraph::from_parts(tasks, edges).and_then(|g| g.waves()) {
            Ok(waves) => {
                for (i, wave) in waves.iter().enumerate() {
                    let names: Vec<_> = wave
                        .iter()
                        .filter_map(|t| catalog.name_of(Target::Task(*t)))
                        .collect();
                    println!("      wave {i}: {names:?}");
                }
            }
            Err(e) => println!("      invalid graph: {e}"),
        }
    }
    println!();

    let standalone: Vec<_> = catalog.tasks.iter().filter(|t| t.is_standalone()).collect();
    println!("tasks ({}):", standalone.len());
    for task in standalone {
        println!("  - {} ({})", task.name, task.id);
        println!("      action: {}", task.kind.label());
        if let Some(ref cron) = task.cron {
            println!("      cron: {cron}");
        }
        if task.retry.max_retries > 0 {
            println!("      max_retries: {}", task.retry.max_retries);
        }
    }

    debug!("dry-run complete (no execution)");
}
