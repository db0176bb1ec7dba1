// src/engine/orchestrator.rs

//! The orchestrator: lock-guarded task attempts, workflow run drivers and
//! the operator API.
//!
//! Every run is owned by one spawned driver. The orchestrator itself only
//! keeps a registry of cancellation and control handles so API calls can
//! reach active runs; the run state lives in the driver.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditSink, LogAuditSink};
use crate::clock::{Clock, SystemClock, duration_until};
use crate::dag::DependencyGraph;
use crate::engine::keepalive::KeepAlive;
use crate::engine::pools::{Pool, WorkerPools};
use crate::engine::trigger::TriggerRequest;
use crate::engine::{EngineOptions, RunControl};
use crate::errors::{JobflowError, Result};
use crate::exec::{ExecutorBackend, run_action};
use crate::lock::{DistributedLock, LockHandle, acquire_with_retry};
use crate::notify::{LogNotifier, Notifier, TaskNotice, WorkflowNotice};
use crate::schedule::{next_fire, parse_cron};
use crate::store::{ExecutionRecord, ExecutionStatus, Store};
use crate::task::{Task, TaskStatus};
use crate::types::{DependencyType, TaskId, Target, TenantId, TriggerType, WorkflowId};
use crate::workflow::{DependencyEdge, RunProgress, RunStep, Workflow, WorkflowRun, WorkflowStatus};

/// Actor recorded for API calls in the audit trail.
const OPERATOR: &str = "operator";

/// Reload-and-reapply attempts when a save hits a stale version.
const MAX_CONFLICTS: u32 = 3;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    Task(TaskStatus),
    Workflow(WorkflowStatus),
}

/// Handle on a run started by the orchestrator. Dropping it detaches the
/// run; it keeps going in the background.
#[derive(Debug)]
pub struct RunTicket {
    pub target: Target,
    /// Workflow run id; `None` for a task run outside a workflow run.
    pub run_id: Option<Uuid>,
    handle: JoinHandle<Result<FinalState>>,
}

impl RunTicket {
    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<FinalState> {
        let target = self.target;
        self.handle.await.map_err(|e| {
            JobflowError::Other(anyhow::anyhow!("driver of {target} did not finish: {e}"))
        })?
    }
}

/// Snapshot returned by [`Orchestrator::get_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    Task {
        status: TaskStatus,
        retries: u32,
        max_retries: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_result: Option<String>,
        /// An attempt loop for this task is live on this instance.
        active: bool,
    },
    Workflow {
        status: WorkflowStatus,
        progress: RunProgress,
        active_runs: usize,
    },
}

impl TargetState {
    pub fn is_terminal(&self) -> bool {
        match self {
            TargetState::Task { status, .. } => status.is_terminal(),
            TargetState::Workflow { status, .. } => status.is_terminal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    /// New trigger with a full retry budget.
    Fresh,
    /// Operator retry of a task waiting in `Retry`.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunScope {
    All,
    FromTask(TaskId),
    Unsuccessful,
}

struct ActiveTask {
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

struct ActiveRun {
    run_id: Uuid,
    control: mpsc::UnboundedSender<RunControl>,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, ActiveTask>,
    runs: HashMap<WorkflowId, Vec<ActiveRun>>,
}

struct Inner {
    store: Arc<dyn Store>,
    lock: Arc<dyn DistributedLock>,
    executor: Arc<dyn ExecutorBackend>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    pools: WorkerPools,
    options: EngineOptions,
    registry: Mutex<Registry>,
    requests: mpsc::UnboundedSender<TriggerRequest>,
    pending_requests: Mutex<Option<mpsc::UnboundedReceiver<TriggerRequest>>>,
}

/// Removes a task's handles from the registry when its run ends.
struct TaskGuard {
    inner: Arc<Inner>,
    id: TaskId,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.registry.lock().tasks.remove(&self.id);
    }
}

/// Removes a workflow run's control handle when the driver ends.
struct RunGuard {
    inner: Arc<Inner>,
    workflow: WorkflowId,
    run_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut registry = self.inner.registry.lock();
        if let Some(runs) = registry.runs.get_mut(&self.workflow) {
            runs.retain(|r| r.run_id != self.run_id);
            if runs.is_empty() {
                registry.runs.remove(&self.workflow);
            }
        }
    }
}

pub struct OrchestratorBuilder {
    store: Arc<dyn Store>,
    lock: Arc<dyn DistributedLock>,
    executor: Arc<dyn ExecutorBackend>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    options: EngineOptions,
}

impl OrchestratorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Orchestrator {
        let (requests, pending) = mpsc::unbounded_channel();
        Orchestrator {
            inner: Arc::new(Inner {
                store: self.store,
                lock: self.lock,
                executor: self.executor,
                clock: self.clock,
                notifier: self.notifier,
                audit: self.audit,
                pools: WorkerPools::new(self.options.pools),
                options: self.options,
                registry: Mutex::new(Registry::default()),
                requests,
                pending_requests: Mutex::new(Some(pending)),
            }),
        }
    }
}

/// Cheap to clone; all clones share the same registry and pools.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("instance_id", &self.inner.options.instance_id)
            .field("store", &self.inner.store)
            .field("lock", &self.inner.lock)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start building an orchestrator. Defaults: system clock, log notifier,
    /// log audit sink, default [`EngineOptions`].
    pub fn builder(
        store: Arc<dyn Store>,
        lock: Arc<dyn DistributedLock>,
        executor: Arc<dyn ExecutorBackend>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            lock,
            executor,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            audit: Arc::new(LogAuditSink),
            options: EngineOptions::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Receiver of trigger requests raised by finished runs. Handed out once,
    /// to the trigger loop.
    pub(crate) fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<TriggerRequest>> {
        self.inner.pending_requests.lock().take()
    }

    // ------------------------------------------------------------------
    // Operator API
    // ------------------------------------------------------------------

    /// Register or redefine a task and compute its next fire time.
    ///
    /// Redefining keeps the runtime fields (status, counters, last result)
    /// of the stored task.
    pub async fn schedule_task(&self, mut task: Task) -> Result<Task> {
        if !task.window.is_valid() {
            return Err(JobflowError::InvalidSchedule(format!(
                "{}: window starts after it ends",
                task.id
            )));
        }
        if let Some(expr) = &task.cron {
            parse_cron(expr)?;
        }

        let existing = match self.inner.store.load_task(task.id).await {
            Ok(existing) => Some(existing),
            Err(JobflowError::TaskNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if let Some(existing) = &existing {
            task.status = existing.status;
            task.current_retries = existing.current_retries;
            task.last_execution = existing.last_execution;
            task.next_retry_at = existing.next_retry_at;
            task.last_result = existing.last_result.clone();
            task.last_duration = existing.last_duration;
            task.version = existing.version;
        }

        let now = self.inner.clock.now();
        task.next_execution = next_fire(
            task.cron.as_deref(),
            &task.window,
            now,
            task.last_execution.is_some(),
        )?;

        if existing.is_some() {
            self.inner.store.save_task(&mut task).await?;
        } else {
            self.inner.store.insert_task(task.clone()).await?;
        }

        info!(
            task = %task.id,
            name = %task.name,
            next = ?task.next_execution,
            "task scheduled"
        );
        self.audit(
            task.tenant_id,
            OPERATOR,
            AuditAction::Schedule,
            Target::Task(task.id),
            task.next_execution
                .map_or_else(|| "manual".to_string(), |at| at.to_rfc3339()),
        );
        Ok(task)
    }

    /// Register or redefine a workflow and compute its next fire time.
    pub async fn schedule_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        if !workflow.window.is_valid() {
            return Err(JobflowError::InvalidSchedule(format!(
                "{}: window starts after it ends",
                workflow.id
            )));
        }
        if let Some(expr) = &workflow.cron {
            parse_cron(expr)?;
        }
        if workflow.downstream_workflows.contains(&workflow.id) {
            return Err(JobflowError::InvalidDependency(format!(
                "{} cannot trigger itself",
                workflow.id
            )));
        }

        let existing = match self.inner.store.load_workflow(workflow.id).await {
            Ok(existing) => Some(existing),
            Err(JobflowError::WorkflowNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if let Some(existing) = &existing {
            workflow.status = existing.status;
            workflow.progress = existing.progress;
            workflow.last_execution = existing.last_execution;
            workflow.version = existing.version;
        }
        workflow.mark_scheduled();

        let now = self.inner.clock.now();
        workflow.next_execution = next_fire(
            workflow.cron.as_deref(),
            &workflow.window,
            now,
            workflow.last_execution.is_some(),
        )?;

        if existing.is_some() {
            self.inner.store.save_workflow(&mut workflow).await?;
        } else {
            self.inner.store.insert_workflow(workflow.clone()).await?;
        }

        info!(
            workflow = %workflow.id,
            name = %workflow.name,
            next = ?workflow.next_execution,
            "workflow scheduled"
        );
        self.audit(
            workflow.tenant_id,
            OPERATOR,
            AuditAction::Schedule,
            Target::Workflow(workflow.id),
            workflow
                .next_execution
                .map_or_else(|| "manual".to_string(), |at| at.to_rfc3339()),
        );
        Ok(workflow)
    }

    /// Trigger a task or a whole workflow now.
    ///
    /// Returns once the lock is held and the run is handed to its driver.
    /// Fails with `LockUnavailable` if another run holds the lock past the
    /// configured wait.
    pub async fn execute_now(&self, target: Target, trigger: TriggerType) -> Result<RunTicket> {
        match target {
            Target::Task(id) => self.start_task(id, trigger, StartMode::Fresh).await,
            Target::Workflow(id) => self.start_workflow(id, trigger, RunScope::All).await,
        }
    }

    /// Run `task` and everything downstream of it inside `workflow`.
    pub async fn execute_from_task(
        &self,
        workflow: WorkflowId,
        task: TaskId,
        trigger: TriggerType,
    ) -> Result<RunTicket> {
        self.start_workflow(workflow, trigger, RunScope::FromTask(task))
            .await
    }

    /// Cancel a task attempt or every active run of a workflow.
    ///
    /// Returns `false` when there was nothing to cancel.
    pub async fn cancel(&self, target: Target) -> Result<bool> {
        match target {
            Target::Task(id) => {
                let task = self.inner.store.load_task(id).await?;
                let active = self
                    .inner
                    .registry
                    .lock()
                    .tasks
                    .get(&id)
                    .map(|a| a.cancel.clone());

                let cancelled = if let Some(token) = active {
                    token.cancel();
                    true
                } else if matches!(task.status, TaskStatus::Pending | TaskStatus::Retry)
                    && !self.inner.lock.is_locked(&target.lock_key()).await
                {
                    // Left over by a driver that is gone; cancel in place.
                    let now = self.inner.clock.now();
                    self.update_task(id, |t| t.cancel(now)).await?;
                    true
                } else {
                    false
                };

                if cancelled {
                    info!(task = %id, "task cancellation requested");
                    self.audit(task.tenant_id, OPERATOR, AuditAction::Cancel, target, "");
                }
                Ok(cancelled)
            }
            Target::Workflow(id) => {
                let workflow = self.inner.store.load_workflow(id).await?;
                let sent = self.send_control(id, RunControl::Cancel);
                if sent > 0 {
                    info!(workflow = %id, runs = sent, "workflow cancellation requested");
                    self.audit(workflow.tenant_id, OPERATOR, AuditAction::Cancel, target, "");
                }
                Ok(sent > 0)
            }
        }
    }

    /// Operator retry.
    ///
    /// - Task waiting in `Retry` on this instance: the wait is cut short and
    ///   `None` is returned.
    /// - Task left in `Retry` with no live driver: a new attempt loop starts
    ///   with the remaining budget.
    /// - Workflow that ended `Failed` or `Timeout`: a new run over the tasks
    ///   that did not succeed.
    ///
    /// Exhausted tasks fail with `RetriesExhausted`; cancelled tasks and
    /// workflows with `Cancelled`.
    pub async fn retry(&self, target: Target) -> Result<Option<RunTicket>> {
        match target {
            Target::Task(id) => {
                let task = self.inner.store.load_task(id).await?;
                let wake = self
                    .inner
                    .registry
                    .lock()
                    .tasks
                    .get(&id)
                    .map(|a| Arc::clone(&a.wake));

                if let Some(wake) = wake {
                    if task.status != TaskStatus::Retry {
                        return Err(JobflowError::InvalidTransition(format!(
                            "{id} is already running"
                        )));
                    }
                    wake.notify_one();
                    self.audit(task.tenant_id, OPERATOR, AuditAction::Retry, target, "early");
                    return Ok(None);
                }

                task.ensure_retryable()?;
                self.audit(task.tenant_id, OPERATOR, AuditAction::Retry, target, "");
                Ok(Some(
                    self.start_task(id, TriggerType::Manual, StartMode::Retry)
                        .await?,
                ))
            }
            Target::Workflow(id) => {
                let workflow = self.inner.store.load_workflow(id).await?;
                match workflow.status {
                    WorkflowStatus::Failed | WorkflowStatus::Timeout => {}
                    WorkflowStatus::Cancelled => {
                        return Err(JobflowError::Cancelled(format!(
                            "{id} was cancelled and is not retried"
                        )));
                    }
                    other => {
                        return Err(JobflowError::InvalidTransition(format!(
                            "{id}: nothing to retry while {other:?}"
                        )));
                    }
                }
                self.audit(workflow.tenant_id, OPERATOR, AuditAction::Retry, target, "");
                Ok(Some(
                    self.start_workflow(id, TriggerType::Manual, RunScope::Unsuccessful)
                        .await?,
                ))
            }
        }
    }

    /// Pause every active run of `workflow`. Running tasks finish; newly
    /// eligible ones are held.
    pub async fn pause(&self, workflow: WorkflowId) -> Result<()> {
        self.control(workflow, RunControl::Pause, AuditAction::Pause)
            .await
    }

    pub async fn resume(&self, workflow: WorkflowId) -> Result<()> {
        self.control(workflow, RunControl::Resume, AuditAction::Resume)
            .await
    }

    async fn control(
        &self,
        id: WorkflowId,
        control: RunControl,
        action: AuditAction,
    ) -> Result<()> {
        let workflow = self.inner.store.load_workflow(id).await?;
        if self.send_control(id, control) == 0 {
            return Err(JobflowError::InvalidTransition(format!(
                "{id} has no active run on this instance"
            )));
        }
        info!(workflow = %id, ?control, "run control sent");
        self.audit(workflow.tenant_id, OPERATOR, action, Target::Workflow(id), "");
        Ok(())
    }

    fn send_control(&self, id: WorkflowId, control: RunControl) -> usize {
        let registry = self.inner.registry.lock();
        registry
            .runs
            .get(&id)
            .map(|runs| {
                runs.iter()
                    .filter(|r| r.control.send(control).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Add `source -> target` to `workflow`.
    ///
    /// Serialised per workflow by the `workflow:{id}:edges` lock. The edge is
    /// validated against the current graph before it is stored, so a
    /// rejected edge leaves the stored graph untouched.
    pub async fn add_dependency(
        &self,
        workflow: WorkflowId,
        source: TaskId,
        target: TaskId,
        kind: DependencyType,
    ) -> Result<DependencyEdge> {
        let held = self.acquire(&edges_lock_key(workflow)).await?;
        let result = self.add_edge_locked(workflow, source, target, kind).await;
        self.release(&held).await;

        let edge = result?;
        info!(
            workflow = %workflow,
            %source,
            %target,
            ?kind,
            "dependency added"
        );
        let tenant = self.inner.store.load_workflow(workflow).await?.tenant_id;
        self.audit(
            tenant,
            OPERATOR,
            AuditAction::AddDependency,
            Target::Workflow(workflow),
            format!("{source} -> {target} ({kind:?})"),
        );
        Ok(edge)
    }

    async fn add_edge_locked(
        &self,
        workflow: WorkflowId,
        source: TaskId,
        target: TaskId,
        kind: DependencyType,
    ) -> Result<DependencyEdge> {
        self.inner.store.load_workflow(workflow).await?;
        let tasks = self.inner.store.list_workflow_tasks(workflow).await?;
        for end in [source, target] {
            if !tasks.iter().any(|t| t.id == end && !t.deleted) {
                return Err(JobflowError::InvalidDependency(format!(
                    "{end} is not a task of {workflow}"
                )));
            }
        }

        let edges = self.inner.store.list_edges(workflow).await?;
        let mut graph = build_graph(&tasks, &edges)?;
        graph.try_add_edge(source, target, kind)?;

        self.inner
            .store
            .insert_edge(workflow, source, target, kind)
            .await
    }

    /// Remove `source -> target` from `workflow`. Returns `false` if there
    /// was no such edge.
    pub async fn remove_dependency(
        &self,
        workflow: WorkflowId,
        source: TaskId,
        target: TaskId,
    ) -> Result<bool> {
        let wf = self.inner.store.load_workflow(workflow).await?;
        let held = self.acquire(&edges_lock_key(workflow)).await?;
        let result: Result<bool> = async {
            let edges = self.inner.store.list_edges(workflow).await?;
            match edges
                .iter()
                .find(|e| e.source == source && e.target == target)
            {
                Some(edge) => self.inner.store.delete_edge(edge.id).await,
                None => Ok(false),
            }
        }
        .await;
        self.release(&held).await;

        let removed = result?;
        if removed {
            info!(workflow = %workflow, %source, %target, "dependency removed");
            self.audit(
                wf.tenant_id,
                OPERATOR,
                AuditAction::RemoveDependency,
                Target::Workflow(workflow),
                format!("{source} -> {target}"),
            );
        }
        Ok(removed)
    }

    /// Persisted status plus progress, and whether it is live here.
    pub async fn get_state(&self, target: Target) -> Result<TargetState> {
        match target {
            Target::Task(id) => {
                let task = self.inner.store.load_task(id).await?;
                let active = self.inner.registry.lock().tasks.contains_key(&id);
                Ok(TargetState::Task {
                    status: task.status,
                    retries: task.current_retries,
                    max_retries: task.retry.max_retries,
                    next_retry_at: task.next_retry_at,
                    last_result: task.last_result,
                    active,
                })
            }
            Target::Workflow(id) => {
                let workflow = self.inner.store.load_workflow(id).await?;
                let active_runs = self
                    .inner
                    .registry
                    .lock()
                    .runs
                    .get(&id)
                    .map_or(0, Vec::len);
                Ok(TargetState::Workflow {
                    status: workflow.status,
                    progress: workflow.progress,
                    active_runs,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// One scheduling cycle: fire every due standalone task and workflow of
    /// every tenant.
    ///
    /// Targets whose lock is held elsewhere are skipped and picked up by a
    /// later cycle. Store errors abort the cycle.
    pub async fn poll_due(&self) -> Result<Vec<RunTicket>> {
        let now = self.inner.clock.now();
        let mut tickets = Vec::new();

        for tenant in self.inner.store.list_tenants().await? {
            for task in self.inner.store.find_due_tasks(tenant, now).await? {
                let request = TriggerRequest {
                    target: Target::Task(task.id),
                    trigger: TriggerType::Scheduled,
                };
                tickets.extend(self.fire(request).await);
            }
            for workflow in self.inner.store.find_due_workflows(tenant, now).await? {
                let request = TriggerRequest {
                    target: Target::Workflow(workflow.id),
                    trigger: TriggerType::Scheduled,
                };
                tickets.extend(self.fire(request).await);
            }
        }

        if !tickets.is_empty() {
            debug!(fired = tickets.len(), "scheduling cycle fired runs");
        }
        Ok(tickets)
    }

    /// Start the requested run, logging instead of failing when it cannot
    /// start.
    pub async fn fire(&self, request: TriggerRequest) -> Option<RunTicket> {
        match self.execute_now(request.target, request.trigger).await {
            Ok(ticket) => Some(ticket),
            Err(JobflowError::LockUnavailable(reason)) => {
                debug!(target_id = %request.target, %reason, "target busy; skipping trigger");
                None
            }
            Err(JobflowError::NotExecutable(reason)) => {
                debug!(target_id = %request.target, %reason, "target not executable");
                None
            }
            Err(e) => {
                warn!(target_id = %request.target, error = %e, "trigger failed");
                None
            }
        }
    }

    fn request(&self, request: TriggerRequest) {
        if let Err(mpsc::error::SendError(dropped)) = self.inner.requests.send(request) {
            warn!(target_id = %dropped.target, "trigger loop gone; request dropped");
        }
    }

    // ------------------------------------------------------------------
    // Task runs
    // ------------------------------------------------------------------

    async fn start_task(&self, id: TaskId, trigger: TriggerType, mode: StartMode) -> Result<RunTicket> {
        let task = self.inner.store.load_task(id).await?;
        let now = self.inner.clock.now();
        if mode == StartMode::Fresh && !task.is_dispatchable(now) {
            return Err(JobflowError::NotExecutable(format!(
                "{id} is disabled, deleted or outside its window"
            )));
        }

        let held = self.acquire(&Target::Task(id).lock_key()).await?;
        let cancel = CancellationToken::new();
        // Renewal starts before the run waits for a pool permit.
        let keepalive = self.keep_alive(&held, cancel.clone());
        let (guard, wake) = self.register_task(id, cancel.clone());
        self.audit(
            task.tenant_id,
            &self.actor(trigger),
            AuditAction::Execute,
            Target::Task(id),
            trigger.to_string(),
        );

        let this = self.clone();
        let handle = self.inner.pools.spawn(Pool::Orchestration, async move {
            let _guard = guard;
            let result = this
                .run_locked_task(id, trigger, None, mode, cancel, wake, (held, keepalive))
                .await;
            if let Err(e) = &result {
                error!(task = %id, error = %e, "task run aborted");
            }
            result.map(FinalState::Task)
        });

        Ok(RunTicket {
            target: Target::Task(id),
            run_id: None,
            handle,
        })
    }

    /// A task dispatched by a workflow run. Never fails: problems become a
    /// non-success status for the run to act on.
    async fn run_workflow_task(
        &self,
        id: TaskId,
        run_id: Uuid,
        trigger: TriggerType,
        cancel: CancellationToken,
    ) -> TaskStatus {
        let held = match self.acquire(&Target::Task(id).lock_key()).await {
            Ok(held) => held,
            Err(e) => {
                warn!(task = %id, %run_id, error = %e, "task lock unavailable; counting as failed");
                return TaskStatus::Failed;
            }
        };
        if cancel.is_cancelled() {
            self.release(&held).await;
            return TaskStatus::Cancelled;
        }

        let keepalive = self.keep_alive(&held, cancel.clone());
        let (_guard, wake) = self.register_task(id, cancel.clone());
        match self
            .run_locked_task(
                id,
                trigger,
                Some(run_id),
                StartMode::Fresh,
                cancel,
                wake,
                (held, keepalive),
            )
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!(task = %id, %run_id, error = %e, "task run aborted");
                TaskStatus::Failed
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_locked_task(
        &self,
        id: TaskId,
        trigger: TriggerType,
        run_id: Option<Uuid>,
        mode: StartMode,
        cancel: CancellationToken,
        wake: Arc<Notify>,
        (held, keepalive): (LockHandle, KeepAlive),
    ) -> Result<TaskStatus> {
        let result = self
            .attempt_loop(id, trigger, run_id, mode, &cancel, &wake)
            .await;
        keepalive.stop().await;
        self.release(&held).await;
        result
    }

    /// Run attempts until the task reaches a terminal state. Caller holds
    /// `task:{id}`.
    async fn attempt_loop(
        &self,
        id: TaskId,
        trigger: TriggerType,
        run_id: Option<Uuid>,
        mode: StartMode,
        cancel: &CancellationToken,
        wake: &Notify,
    ) -> Result<TaskStatus> {
        let inner = &self.inner;
        let (task, ()) = self
            .update_task(id, |t| {
                match mode {
                    StartMode::Fresh => {
                        t.recover_stale();
                        t.begin_run()?;
                        if t.is_standalone() {
                            t.next_execution =
                                next_fire(t.cron.as_deref(), &t.window, inner.clock.now(), true)?;
                        }
                    }
                    StartMode::Retry => t.prepare_retry()?,
                }
                Ok(())
            })
            .await?;
        info!(task = %id, name = %task.name, %trigger, ?mode, "task run started");

        loop {
            let now = inner.clock.now();
            let (task, ()) = self.update_task(id, |t| t.start(now)).await?;

            let mut record =
                ExecutionRecord::open(Target::Task(id), trigger, &inner.options.instance_id, now);
            record.retry_count = task.current_retries;
            if let Some(run_id) = run_id {
                record = record.with_run(run_id);
            }
            inner.store.save_execution(&record).await?;

            let outcome = inner
                .pools
                .run(
                    Pool::Task,
                    run_action(Arc::clone(&inner.executor), task, cancel.clone()),
                )
                .await;

            let now = inner.clock.now();
            let (task, transition) = self
                .update_task(id, |t| t.record_outcome(&outcome, now))
                .await?;
            record.next_retry_at = transition.retry_at;
            record.close(transition.to.into(), task.last_result.clone(), now)?;
            inner.store.save_execution(&record).await?;

            self.notify_task(&task, transition.to);
            self.audit(
                task.tenant_id,
                &inner.options.instance_id,
                AuditAction::Finish,
                Target::Task(id),
                format!("{:?}", transition.to),
            );

            if transition.to != TaskStatus::Retry {
                return Ok(transition.to);
            }

            let wait = transition
                .retry_at
                .map(|at| duration_until(inner.clock.now(), at))
                .unwrap_or_default();
            info!(task = %id, retries = task.current_retries, ?wait, "waiting before retry");

            tokio::select! {
                _ = sleep(wait) => {}
                _ = wake.notified() => info!(task = %id, "retry requested early"),
                _ = cancel.cancelled() => {
                    let now = inner.clock.now();
                    self.update_task(id, |t| t.cancel(now)).await?;
                    info!(task = %id, "task cancelled while waiting to retry");
                    return Ok(TaskStatus::Cancelled);
                }
            }

            self.update_task(id, |t| t.prepare_retry()).await?;
        }
    }

    fn register_task(&self, id: TaskId, cancel: CancellationToken) -> (TaskGuard, Arc<Notify>) {
        let wake = Arc::new(Notify::new());
        self.inner.registry.lock().tasks.insert(
            id,
            ActiveTask {
                cancel,
                wake: Arc::clone(&wake),
            },
        );
        let guard = TaskGuard {
            inner: Arc::clone(&self.inner),
            id,
        };
        (guard, wake)
    }

    // ------------------------------------------------------------------
    // Workflow runs
    // ------------------------------------------------------------------

    async fn start_workflow(
        &self,
        id: WorkflowId,
        trigger: TriggerType,
        scope: RunScope,
    ) -> Result<RunTicket> {
        let workflow = self.inner.store.load_workflow(id).await?;
        if !workflow.is_dispatchable(self.inner.clock.now()) {
            return Err(JobflowError::NotExecutable(format!(
                "{id} is disabled, deleted or outside its window"
            )));
        }

        let held = if workflow.allows_concurrent() {
            None
        } else {
            Some(self.acquire(&Target::Workflow(id).lock_key()).await?)
        };
        // Renewal starts before the driver waits for a pool permit.
        let lost = CancellationToken::new();
        let keepalive = held.as_ref().map(|held| self.keep_alive(held, lost.clone()));

        let run = match self.prepare_run(&workflow, scope).await {
            Ok(run) => run,
            Err(e) => {
                if let Some(keepalive) = keepalive {
                    keepalive.stop().await;
                }
                if let Some(held) = &held {
                    self.release(held).await;
                }
                return Err(e);
            }
        };

        let run_id = run.run_id();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let guard = self.register_run(id, run_id, control_tx);

        let this = self.clone();
        let handle = self.inner.pools.spawn(Pool::Orchestration, async move {
            let _guard = guard;
            let result = this
                .drive_workflow(workflow, run, trigger, control_rx, lost)
                .await;

            if let Some(keepalive) = keepalive {
                keepalive.stop().await;
            }
            if let Some(held) = &held {
                this.release(held).await;
            }
            if let Err(e) = &result {
                error!(workflow = %id, %run_id, error = %e, "workflow run aborted");
            }
            result.map(FinalState::Workflow)
        });

        Ok(RunTicket {
            target: Target::Workflow(id),
            run_id: Some(run_id),
            handle,
        })
    }

    async fn prepare_run(&self, workflow: &Workflow, scope: RunScope) -> Result<WorkflowRun> {
        let tasks = self.inner.store.list_workflow_tasks(workflow.id).await?;
        let edges = self.inner.store.list_edges(workflow.id).await?;
        let graph = build_graph(&tasks, &edges)?;
        let prior: BTreeMap<TaskId, TaskStatus> = tasks.iter().map(|t| (t.id, t.status)).collect();

        match scope {
            RunScope::All => Ok(WorkflowRun::new(workflow, graph)),
            RunScope::FromTask(task) => WorkflowRun::from_task(workflow, graph, task, &prior),
            RunScope::Unsuccessful => Ok(WorkflowRun::retrying(workflow, graph, &prior)),
        }
    }

    fn register_run(
        &self,
        workflow: WorkflowId,
        run_id: Uuid,
        control: mpsc::UnboundedSender<RunControl>,
    ) -> RunGuard {
        self.inner
            .registry
            .lock()
            .runs
            .entry(workflow)
            .or_default()
            .push(ActiveRun { run_id, control });
        RunGuard {
            inner: Arc::clone(&self.inner),
            workflow,
            run_id,
        }
    }

    /// Own one workflow run from start to terminal state.
    async fn drive_workflow(
        &self,
        workflow: Workflow,
        mut run: WorkflowRun,
        trigger: TriggerType,
        mut control_rx: mpsc::UnboundedReceiver<RunControl>,
        lost: CancellationToken,
    ) -> Result<WorkflowStatus> {
        let inner = &self.inner;
        let id = workflow.id;
        let run_id = run.run_id();
        let now = inner.clock.now();

        let mut record = match self.open_run(&run, trigger, now).await {
            Ok(record) => record,
            Err(e) => {
                self.fail_unopened_run(&workflow, &run, trigger, &e).await;
                return Err(e);
            }
        };
        self.audit(
            workflow.tenant_id,
            &self.actor(trigger),
            AuditAction::Execute,
            Target::Workflow(id),
            format!("run {run_id} ({trigger})"),
        );

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(TaskId, TaskStatus)>();
        let mut in_flight: HashMap<TaskId, CancellationToken> = HashMap::new();
        let deadline = Instant::now() + workflow.timeout;
        let mut controls_open = true;

        let step = run.start()?;
        self.apply_step(&workflow, run_id, trigger, step, &mut in_flight, &done_tx);
        self.persist_run(id, &run).await;

        while !(run.is_finished() && in_flight.is_empty()) {
            let step = tokio::select! {
                Some((task, status)) = done_rx.recv() => {
                    in_flight.remove(&task);
                    match run.on_task_finished(task, status) {
                        Ok(step) => step,
                        Err(e) => {
                            warn!(workflow = %id, %run_id, error = %e, "ignoring task completion");
                            continue;
                        }
                    }
                }

                control = control_rx.recv(), if controls_open && !run.is_finished() => {
                    let applied = match control {
                        Some(RunControl::Pause) => run.pause().map(|()| RunStep::default()),
                        Some(RunControl::Resume) => run.resume(),
                        Some(RunControl::Cancel) => run.cancel(),
                        None => {
                            controls_open = false;
                            Ok(RunStep::default())
                        }
                    };
                    applied.unwrap_or_else(|e| {
                        warn!(workflow = %id, %run_id, error = %e, "run control rejected");
                        RunStep::default()
                    })
                }

                _ = sleep_until(deadline), if !run.is_finished() => {
                    warn!(workflow = %id, %run_id, timeout = ?workflow.timeout, "workflow timed out");
                    run.time_out()?
                }

                _ = lost.cancelled(), if !run.is_finished() => {
                    error!(workflow = %id, %run_id, "workflow lock lost; aborting run");
                    run.abort()?
                }

                else => break,
            };

            self.apply_step(&workflow, run_id, trigger, step, &mut in_flight, &done_tx);
            self.persist_run(id, &run).await;
        }

        let status = run.status();
        let progress = run.progress();
        let now = inner.clock.now();
        let (workflow, ()) = self
            .update_workflow(id, |wf| {
                wf.status = status;
                wf.progress = progress;
                Ok(())
            })
            .await?;

        record.close(
            status.into(),
            Some(format!(
                "{} of {} completed, {} failed, {} skipped",
                progress.completed, progress.total, progress.failed, progress.skipped
            )),
            now,
        )?;
        inner.store.save_execution(&record).await?;

        self.notify_workflow(&workflow, run_id, status, progress);
        self.audit(
            workflow.tenant_id,
            &inner.options.instance_id,
            AuditAction::Finish,
            Target::Workflow(id),
            format!("{status:?}"),
        );
        info!(workflow = %id, %run_id, ?status, "workflow run finished");

        if status == WorkflowStatus::Completed {
            for &downstream in &workflow.downstream_workflows {
                debug!(workflow = %id, %downstream, "triggering downstream workflow");
                self.request(TriggerRequest {
                    target: Target::Workflow(downstream),
                    trigger: TriggerType::UpstreamWorkflow,
                });
            }
        }
        Ok(status)
    }

    /// Mark the workflow `Running`, reset its in-scope tasks and open the
    /// execution record.
    async fn open_run(
        &self,
        run: &WorkflowRun,
        trigger: TriggerType,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord> {
        let id = run.workflow_id();
        let progress = run.progress();

        self.update_workflow(id, |wf| {
            wf.status = WorkflowStatus::Running;
            wf.progress = progress;
            wf.last_execution = Some(now);
            wf.next_execution = next_fire(wf.cron.as_deref(), &wf.window, now, true)?;
            Ok(())
        })
        .await?;

        for &task in run.scope() {
            self.update_task(task, |t| {
                if t.status == TaskStatus::Created || t.status.is_terminal() {
                    t.begin_run()?;
                }
                Ok(())
            })
            .await?;
        }

        let record =
            ExecutionRecord::open(Target::Workflow(id), trigger, &self.inner.options.instance_id, now)
                .with_run(run.run_id());
        self.inner.store.save_execution(&record).await?;
        Ok(record)
    }

    /// A run that failed before dispatching anything still ends `Failed`
    /// with a closed record, so it can be retried.
    async fn fail_unopened_run(
        &self,
        workflow: &Workflow,
        run: &WorkflowRun,
        trigger: TriggerType,
        cause: &JobflowError,
    ) {
        let (id, run_id) = (workflow.id, run.run_id());
        error!(workflow = %id, %run_id, error = %cause, "workflow run could not start");

        let progress = run.progress();
        let saved = self
            .update_workflow(id, |wf| {
                wf.status = WorkflowStatus::Failed;
                wf.progress = progress;
                Ok(())
            })
            .await;
        if let Err(e) = saved {
            warn!(workflow = %id, %run_id, error = %e, "could not mark run failed");
        }

        let now = self.inner.clock.now();
        let mut record =
            ExecutionRecord::open(Target::Workflow(id), trigger, &self.inner.options.instance_id, now)
                .with_run(run_id);
        let closed = record
            .close(ExecutionStatus::Failed, Some(cause.to_string()), now)
            .map(|()| record);
        let saved = match closed {
            Ok(record) => self.inner.store.save_execution(&record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            warn!(workflow = %id, %run_id, error = %e, "could not record failed start");
        }

        self.notify_workflow(workflow, run_id, WorkflowStatus::Failed, progress);
        self.audit(
            workflow.tenant_id,
            &self.inner.options.instance_id,
            AuditAction::Finish,
            Target::Workflow(id),
            format!("{:?}", WorkflowStatus::Failed),
        );
    }

    fn apply_step(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        trigger: TriggerType,
        step: RunStep,
        in_flight: &mut HashMap<TaskId, CancellationToken>,
        done: &mpsc::UnboundedSender<(TaskId, TaskStatus)>,
    ) {
        if !step.skipped.is_empty() {
            info!(workflow = %workflow.id, %run_id, skipped = ?step.skipped, "tasks skipped");
        }

        for task in &step.cancel {
            if let Some(token) = in_flight.get(task) {
                debug!(workflow = %workflow.id, %run_id, %task, "interrupting task");
                token.cancel();
            }
        }

        for &task in &step.requeued {
            self.audit(
                workflow.tenant_id,
                &self.inner.options.instance_id,
                AuditAction::Retry,
                Target::Task(task),
                format!("re-queued by run {run_id}"),
            );
        }

        for task in step.dispatch {
            let cancel = CancellationToken::new();
            in_flight.insert(task, cancel.clone());
            let this = self.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let status = this.run_workflow_task(task, run_id, trigger, cancel).await;
                let _ = done.send((task, status));
            });
        }
    }

    async fn persist_run(&self, id: WorkflowId, run: &WorkflowRun) {
        let (status, progress) = (run.status(), run.progress());
        let saved = self
            .update_workflow(id, |wf| {
                wf.status = status;
                wf.progress = progress;
                Ok(())
            })
            .await;
        if let Err(e) = saved {
            warn!(workflow = %id, run_id = %run.run_id(), error = %e, "could not persist run progress");
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn acquire(&self, key: &str) -> Result<LockHandle> {
        let options = &self.inner.options;
        self.inner
            .pools
            .run(
                Pool::Coordination,
                acquire_with_retry(
                    self.inner.lock.as_ref(),
                    key,
                    options.lock_ttl,
                    options.lock_retry_interval,
                    options.lock_wait,
                ),
            )
            .await
    }

    /// Renew `held` until stopped; `on_lost` fires if ownership is lost.
    fn keep_alive(&self, held: &LockHandle, on_lost: CancellationToken) -> KeepAlive {
        KeepAlive::spawn(
            Arc::clone(&self.inner.lock),
            held.clone(),
            self.inner.options.lock_ttl,
            on_lost,
        )
    }

    async fn release(&self, held: &LockHandle) {
        if !self.inner.lock.release(held).await {
            warn!(key = %held.key, "lock was no longer held at release");
        }
    }

    /// Load, apply, save; on a version conflict reload and apply again.
    async fn update_task<R, F>(&self, id: TaskId, mut apply: F) -> Result<(Task, R)>
    where
        F: FnMut(&mut Task) -> Result<R> + Send,
        R: Send,
    {
        let mut conflicts = 0;
        loop {
            let mut task = self.inner.store.load_task(id).await?;
            let out = apply(&mut task)?;
            match self.inner.store.save_task(&mut task).await {
                Ok(()) => return Ok((task, out)),
                Err(JobflowError::StaleVersion { .. }) if conflicts < MAX_CONFLICTS => {
                    conflicts += 1;
                    debug!(task = %id, conflicts, "concurrent task update; reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn update_workflow<R, F>(&self, id: WorkflowId, mut apply: F) -> Result<(Workflow, R)>
    where
        F: FnMut(&mut Workflow) -> Result<R> + Send,
        R: Send,
    {
        let mut conflicts = 0;
        loop {
            let mut workflow = self.inner.store.load_workflow(id).await?;
            let out = apply(&mut workflow)?;
            match self.inner.store.save_workflow(&mut workflow).await {
                Ok(()) => return Ok((workflow, out)),
                Err(JobflowError::StaleVersion { .. }) if conflicts < MAX_CONFLICTS => {
                    conflicts += 1;
                    debug!(workflow = %id, conflicts, "concurrent workflow update; reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn actor(&self, trigger: TriggerType) -> String {
        match trigger {
            TriggerType::Manual | TriggerType::Api => OPERATOR.to_string(),
            _ => self.inner.options.instance_id.clone(),
        }
    }

    fn notify_task(&self, task: &Task, status: TaskStatus) {
        if !task.wants_notification(status) {
            return;
        }
        let notice = TaskNotice {
            tenant: task.tenant_id,
            task: task.id,
            name: task.name.clone(),
            status,
            retries: task.current_retries,
            message: task.last_result.clone(),
        };
        let notifier = Arc::clone(&self.inner.notifier);
        self.inner.pools.spawn(Pool::Notification, async move {
            if let Err(e) = notifier.notify_task_outcome(&notice).await {
                warn!(task = %notice.task, error = %e, "task notification failed");
            }
        });
    }

    fn notify_workflow(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        status: WorkflowStatus,
        progress: RunProgress,
    ) {
        let notice = WorkflowNotice {
            tenant: workflow.tenant_id,
            workflow: workflow.id,
            name: workflow.name.clone(),
            run_id,
            status,
            progress,
        };
        let notifier = Arc::clone(&self.inner.notifier);
        self.inner.pools.spawn(Pool::Notification, async move {
            if let Err(e) = notifier.notify_workflow_outcome(&notice).await {
                warn!(workflow = %notice.workflow, error = %e, "workflow notification failed");
            }
        });
    }

    fn audit(
        &self,
        tenant: TenantId,
        actor: &str,
        action: AuditAction,
        target: Target,
        detail: impl Into<String>,
    ) {
        let entry = AuditEntry {
            at: self.inner.clock.now(),
            tenant,
            actor: actor.to_string(),
            action,
            target,
            detail: detail.into(),
        };
        let sink = Arc::clone(&self.inner.audit);
        self.inner.pools.spawn(Pool::Notification, async move {
            if let Err(e) = sink.record(entry).await {
                warn!(error = %e, "audit write failed");
            }
        });
    }
}

fn edges_lock_key(workflow: WorkflowId) -> String {
    format!("{}:edges", Target::Workflow(workflow).lock_key())
}

/// Graph of the live tasks of a workflow. Edges touching deleted tasks are
/// ignored.
fn build_graph(tasks: &[Task], edges: &[DependencyEdge]) -> Result<DependencyGraph> {
    let live: Vec<TaskId> = tasks.iter().filter(|t| !t.deleted).map(|t| t.id).collect();
    DependencyGraph::from_parts(
        live.iter().copied(),
        edges
            .iter()
            .filter(|e| live.contains(&e.source) && live.contains(&e.target))
            .map(DependencyEdge::as_tuple),
    )
}
