// src/workflow/run.rs

//! Per-run workflow state machine.
//!
//! A [`WorkflowRun`] is created for every trigger of a workflow and owned by
//! the task driving that run. It never touches the store or the executor:
//! callers feed it task completions and act on the returned [`RunStep`].

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::DependencyGraph;
use crate::errors::{JobflowError, Result};
use crate::task::model::TaskStatus;
use crate::types::{ErrorPolicy, TaskId, WorkflowId};
use crate::workflow::model::{RunProgress, Workflow, WorkflowStatus};

/// What the caller has to do after feeding an event into a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStep {
    /// Tasks to dispatch now. Already counted as running by the run.
    pub dispatch: Vec<TaskId>,
    /// Subset of `dispatch` that is a re-queue under auto-retry.
    pub requeued: Vec<TaskId>,
    /// Tasks that will never run in this run.
    pub skipped: Vec<TaskId>,
    /// Running tasks that must be interrupted.
    pub cancel: Vec<TaskId>,
    /// Set when this step ended the run.
    pub finished: Option<WorkflowStatus>,
}

impl RunStep {
    fn finishing(status: WorkflowStatus, cancel: Vec<TaskId>) -> Self {
        Self {
            finished: Some(status),
            cancel,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowRun {
    run_id: Uuid,
    workflow_id: WorkflowId,
    policy: ErrorPolicy,
    max_retries: u32,
    retries_used: u32,
    graph: DependencyGraph,
    scope: BTreeSet<TaskId>,
    completed: BTreeSet<TaskId>,
    /// Terminal non-success, including skipped tasks. Only used for edge
    /// evaluation; counters are kept in `progress`.
    failed: BTreeSet<TaskId>,
    running: BTreeSet<TaskId>,
    held: BTreeSet<TaskId>,
    status: WorkflowStatus,
    progress: RunProgress,
}

impl WorkflowRun {
    /// A run over every task of the workflow.
    pub fn new(workflow: &Workflow, graph: DependencyGraph) -> Self {
        let scope = graph.tasks();
        Self::with_scope(workflow, graph, scope)
    }

    /// A run over `start` and its downstream closure.
    ///
    /// Predecessors outside the closure are not re-run. Their last known
    /// status decides whether edges out of them are satisfied: `Success`
    /// satisfies everything, any other terminal status only satisfies
    /// completion-required edges, and anything else satisfies nothing.
    pub fn from_task(
        workflow: &Workflow,
        graph: DependencyGraph,
        start: TaskId,
        prior: &BTreeMap<TaskId, TaskStatus>,
    ) -> Result<Self> {
        if !graph.contains(start) {
            return Err(JobflowError::TaskNotFound(start));
        }
        let scope = graph.downstream_closure(start);
        Ok(Self::seeded(workflow, graph, scope, prior))
    }

    /// A run over every task that did not succeed last time.
    ///
    /// Tasks whose last status is `Success` are treated as already
    /// completed, so only the failed part of the workflow is re-run.
    pub fn retrying(
        workflow: &Workflow,
        graph: DependencyGraph,
        prior: &BTreeMap<TaskId, TaskStatus>,
    ) -> Self {
        let scope = graph
            .tasks()
            .into_iter()
            .filter(|t| prior.get(t) != Some(&TaskStatus::Success))
            .collect();
        Self::seeded(workflow, graph, scope, prior)
    }

    fn seeded(
        workflow: &Workflow,
        graph: DependencyGraph,
        scope: BTreeSet<TaskId>,
        prior: &BTreeMap<TaskId, TaskStatus>,
    ) -> Self {
        let mut run = Self::with_scope(workflow, graph, scope);
        for task in run.graph.tasks() {
            if run.scope.contains(&task) {
                continue;
            }
            match prior.get(&task) {
                Some(TaskStatus::Success) => {
                    run.completed.insert(task);
                }
                Some(status) if status.is_terminal() => {
                    run.failed.insert(task);
                }
                _ => {}
            }
        }
        run
    }

    fn with_scope(workflow: &Workflow, graph: DependencyGraph, scope: BTreeSet<TaskId>) -> Self {
        let progress = RunProgress {
            total: scope.len(),
            ..RunProgress::default()
        };
        Self {
            run_id: Uuid::new_v4(),
            workflow_id: workflow.id,
            policy: workflow.error_policy,
            max_retries: workflow.retry.max_retries,
            retries_used: 0,
            graph,
            scope,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            running: BTreeSet::new(),
            held: BTreeSet::new(),
            status: WorkflowStatus::Scheduled,
            progress,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn progress(&self) -> RunProgress {
        self.progress
    }

    pub fn scope(&self) -> &BTreeSet<TaskId> {
        &self.scope
    }

    pub fn running(&self) -> &BTreeSet<TaskId> {
        &self.running
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Enter `Running` and release the tasks that are eligible right away.
    pub fn start(&mut self) -> Result<RunStep> {
        if self.status != WorkflowStatus::Scheduled {
            return Err(self.invalid("start"));
        }
        self.status = WorkflowStatus::Running;
        info!(
            workflow = %self.workflow_id,
            run_id = %self.run_id,
            tasks = self.scope.len(),
            "workflow run started"
        );

        let mut step = RunStep::default();
        self.release_eligible(&mut step);
        self.check_quiescent(&mut step);
        Ok(step)
    }

    /// Record the terminal status of a dispatched task.
    pub fn on_task_finished(&mut self, task: TaskId, status: TaskStatus) -> Result<RunStep> {
        if !self.running.remove(&task) {
            return Err(JobflowError::InvalidTransition(format!(
                "{task} finished but is not running in run {}",
                self.run_id
            )));
        }
        if !status.is_terminal() {
            return Err(JobflowError::InvalidTransition(format!(
                "{task} reported non-terminal status {status:?}"
            )));
        }

        let mut step = RunStep::default();
        if self.status == WorkflowStatus::Retry {
            self.status = WorkflowStatus::Running;
        }

        if status.is_success() {
            self.completed.insert(task);
            self.progress.completed += 1;
        } else if self.status.is_terminal() {
            // Acknowledgement from a task interrupted by the run's own end.
            self.failed.insert(task);
            self.progress.failed += 1;
            return Ok(step);
        } else {
            self.handle_failure(task, status, &mut step);
        }

        if self.status.is_terminal() {
            return Ok(step);
        }

        self.release_eligible(&mut step);
        self.check_quiescent(&mut step);
        Ok(step)
    }

    fn handle_failure(&mut self, task: TaskId, status: TaskStatus, step: &mut RunStep) {
        // A cancelled task only blocks its own success-required chain.
        if status == TaskStatus::Cancelled {
            self.failed.insert(task);
            self.progress.failed += 1;
            self.skip_blocked(task, step);
            return;
        }

        if self.policy == ErrorPolicy::AutoRetry && self.retries_used < self.max_retries {
            self.retries_used += 1;
            info!(
                workflow = %self.workflow_id,
                run_id = %self.run_id,
                %task,
                attempt = self.retries_used,
                max_retries = self.max_retries,
                "re-queueing failed task"
            );
            step.requeued.push(task);
            // A paused run keeps the re-queued task until resumed.
            if self.status == WorkflowStatus::Paused {
                self.held.insert(task);
            } else {
                self.status = WorkflowStatus::Retry;
                self.running.insert(task);
                step.dispatch.push(task);
            }
            return;
        }

        self.failed.insert(task);
        self.progress.failed += 1;

        match self.policy {
            ErrorPolicy::SkipFailed => self.skip_blocked(task, step),
            ErrorPolicy::StopOnFailure | ErrorPolicy::AutoRetry => {
                warn!(
                    workflow = %self.workflow_id,
                    run_id = %self.run_id,
                    %task,
                    ?status,
                    "task failed; stopping run"
                );
                self.status = WorkflowStatus::Failed;
                step.cancel = self.running.iter().copied().collect();
                step.finished = Some(WorkflowStatus::Failed);
            }
        }
    }

    /// Skip every in-scope task that can no longer become eligible.
    fn skip_blocked(&mut self, failed: TaskId, step: &mut RunStep) {
        let blocked = self.graph.blocked_by_failure(&self.completed, &self.failed);
        for skipped in blocked {
            if self.scope.contains(&skipped)
                && !self.running.contains(&skipped)
                && !self.failed.contains(&skipped)
            {
                self.held.remove(&skipped);
                self.failed.insert(skipped);
                self.progress.skipped += 1;
                step.skipped.push(skipped);
            }
        }
        if !step.skipped.is_empty() {
            debug!(
                workflow = %self.workflow_id,
                %failed,
                skipped = ?step.skipped,
                "skipping tasks behind failed task"
            );
        }
    }

    fn release_eligible(&mut self, step: &mut RunStep) {
        let eligible: Vec<TaskId> = self
            .graph
            .eligible_tasks(&self.completed, &self.failed)
            .into_iter()
            .filter(|t| self.scope.contains(t))
            .filter(|t| !self.running.contains(t) && !self.held.contains(t))
            .collect();

        for task in eligible {
            if self.status == WorkflowStatus::Paused {
                self.held.insert(task);
            } else {
                self.running.insert(task);
                step.dispatch.push(task);
            }
        }
    }

    /// Decide the final status once nothing is running or waiting.
    fn check_quiescent(&mut self, step: &mut RunStep) {
        if !self.running.is_empty() || !self.held.is_empty() || self.status.is_terminal() {
            return;
        }

        let unfinished = self
            .scope
            .iter()
            .filter(|t| !self.completed.contains(t) && !self.failed.contains(t))
            .count();

        let final_status = if unfinished > 0 {
            warn!(
                workflow = %self.workflow_id,
                run_id = %self.run_id,
                unfinished,
                "no task can make progress; failing run"
            );
            WorkflowStatus::Failed
        } else if self.progress.failed == 0 || self.policy == ErrorPolicy::SkipFailed {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };

        self.status = final_status;
        step.finished = Some(final_status);
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Running {
            return Err(self.invalid("pause"));
        }
        self.status = WorkflowStatus::Paused;
        info!(workflow = %self.workflow_id, run_id = %self.run_id, "workflow run paused");
        Ok(())
    }

    /// Back to `Running`; held tasks are dispatched.
    pub fn resume(&mut self) -> Result<RunStep> {
        if self.status != WorkflowStatus::Paused {
            return Err(self.invalid("resume"));
        }
        self.status = WorkflowStatus::Running;
        info!(workflow = %self.workflow_id, run_id = %self.run_id, "workflow run resumed");

        let mut step = RunStep::default();
        for task in std::mem::take(&mut self.held) {
            self.running.insert(task);
            step.dispatch.push(task);
        }
        self.check_quiescent(&mut step);
        Ok(step)
    }

    /// Operator cancellation. Returns the running tasks to interrupt.
    pub fn cancel(&mut self) -> Result<RunStep> {
        self.finish_early(WorkflowStatus::Cancelled, "cancel")
    }

    /// Workflow-level timeout.
    pub fn time_out(&mut self) -> Result<RunStep> {
        self.finish_early(WorkflowStatus::Timeout, "time out")
    }

    /// The run lost its lock or hit a backend error.
    pub fn abort(&mut self) -> Result<RunStep> {
        self.finish_early(WorkflowStatus::Failed, "abort")
    }

    fn finish_early(&mut self, status: WorkflowStatus, action: &str) -> Result<RunStep> {
        if self.status.is_terminal() {
            return Err(self.invalid(action));
        }
        self.status = status;
        self.held.clear();
        info!(
            workflow = %self.workflow_id,
            run_id = %self.run_id,
            ?status,
            running = self.running.len(),
            "workflow run ended early"
        );
        Ok(RunStep::finishing(
            status,
            self.running.iter().copied().collect(),
        ))
    }

    fn invalid(&self, action: &str) -> JobflowError {
        JobflowError::InvalidTransition(format!(
            "cannot {action} run {} of {} while {:?}",
            self.run_id, self.workflow_id, self.status
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::RetryPolicy;
    use crate::types::{DependencyType, TenantId};

    const S: DependencyType = DependencyType::SuccessRequired;
    const C: DependencyType = DependencyType::CompletionRequired;

    fn t(n: u64) -> TaskId {
        TaskId(n)
    }

    fn workflow(policy: ErrorPolicy) -> Workflow {
        let mut wf = Workflow::new(WorkflowId(1), TenantId(1), "wf");
        wf.error_policy = policy;
        wf
    }

    fn graph(tasks: &[u64], edges: &[(u64, u64, DependencyType)]) -> DependencyGraph {
        DependencyGraph::from_parts(
            tasks.iter().copied().map(TaskId),
            edges.iter().map(|(s, d, k)| (TaskId(*s), TaskId(*d), *k)),
        )
        .unwrap()
    }

    /// A=1, B=2, C=3 with A -> B, A -> C.
    fn fan_out(policy: ErrorPolicy) -> WorkflowRun {
        WorkflowRun::new(&workflow(policy), graph(&[1, 2, 3], &[(1, 2, S), (1, 3, S)]))
    }

    #[test]
    fn success_of_root_releases_both_children_together() {
        let mut run = fan_out(ErrorPolicy::StopOnFailure);
        let step = run.start().unwrap();
        assert_eq!(step.dispatch, vec![t(1)]);

        let step = run.on_task_finished(t(1), TaskStatus::Success).unwrap();
        assert_eq!(step.dispatch, vec![t(2), t(3)]);
        assert_eq!(step.finished, None);

        run.on_task_finished(t(2), TaskStatus::Success).unwrap();
        let step = run.on_task_finished(t(3), TaskStatus::Success).unwrap();
        assert_eq!(step.finished, Some(WorkflowStatus::Completed));
        assert_eq!(
            run.progress(),
            RunProgress {
                total: 3,
                completed: 3,
                failed: 0,
                skipped: 0
            }
        );
    }

    #[test]
    fn stop_on_failure_never_dispatches_children() {
        let mut run = fan_out(ErrorPolicy::StopOnFailure);
        run.start().unwrap();

        let step = run.on_task_finished(t(1), TaskStatus::Failed).unwrap();
        assert!(step.dispatch.is_empty());
        assert_eq!(step.finished, Some(WorkflowStatus::Failed));
        assert_eq!(run.status(), WorkflowStatus::Failed);
        assert_eq!(run.progress().failed, 1);
        assert_eq!(run.progress().completed, 0);
    }

    #[test]
    fn stop_on_failure_cancels_siblings_in_flight() {
        let mut run = WorkflowRun::new(
            &workflow(ErrorPolicy::StopOnFailure),
            graph(&[1, 2, 3], &[]),
        );
        let step = run.start().unwrap();
        assert_eq!(step.dispatch, vec![t(1), t(2), t(3)]);

        let step = run.on_task_finished(t(2), TaskStatus::Timeout).unwrap();
        assert_eq!(step.cancel, vec![t(1), t(3)]);

        // Late acknowledgements only update the counters.
        let step = run.on_task_finished(t(1), TaskStatus::Cancelled).unwrap();
        assert_eq!(step, RunStep::default());
        run.on_task_finished(t(3), TaskStatus::Success).unwrap();
        assert!(run.running().is_empty());
        assert_eq!(run.status(), WorkflowStatus::Failed);
    }

    #[test]
    fn skip_failed_runs_completion_dependents_and_skips_success_chains() {
        // 1 -S-> 2 -S-> 4, 1 -C-> 3
        let mut run = WorkflowRun::new(
            &workflow(ErrorPolicy::SkipFailed),
            graph(&[1, 2, 3, 4], &[(1, 2, S), (2, 4, S), (1, 3, C)]),
        );
        run.start().unwrap();

        let step = run.on_task_finished(t(1), TaskStatus::Failed).unwrap();
        assert_eq!(step.skipped, vec![t(2), t(4)]);
        assert_eq!(step.dispatch, vec![t(3)]);

        let step = run.on_task_finished(t(3), TaskStatus::Success).unwrap();
        assert_eq!(step.finished, Some(WorkflowStatus::Completed));
        let progress = run.progress();
        assert_eq!((progress.completed, progress.failed, progress.skipped), (1, 1, 2));
    }

    #[test]
    fn auto_retry_requeues_until_budget_is_spent() {
        let mut wf = workflow(ErrorPolicy::AutoRetry);
        wf.retry = RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        };
        let mut run = WorkflowRun::new(&wf, graph(&[1, 2], &[(1, 2, S)]));
        run.start().unwrap();

        let step = run.on_task_finished(t(1), TaskStatus::Failed).unwrap();
        assert_eq!(step.requeued, vec![t(1)]);
        assert_eq!(step.dispatch, vec![t(1)]);
        assert_eq!(run.status(), WorkflowStatus::Retry);

        let step = run.on_task_finished(t(1), TaskStatus::Failed).unwrap();
        assert!(step.requeued.is_empty());
        assert_eq!(step.finished, Some(WorkflowStatus::Failed));
    }

    #[test]
    fn auto_retry_while_paused_stays_paused() {
        let mut wf = workflow(ErrorPolicy::AutoRetry);
        wf.retry.max_retries = 2;
        let mut run = WorkflowRun::new(&wf, graph(&[1, 2, 3], &[(1, 3, S), (2, 3, S)]));
        assert_eq!(run.start().unwrap().dispatch, vec![t(1), t(2)]);
        run.pause().unwrap();

        let step = run.on_task_finished(t(1), TaskStatus::Failed).unwrap();
        assert_eq!(step.requeued, vec![t(1)]);
        assert!(step.dispatch.is_empty());
        assert_eq!(run.status(), WorkflowStatus::Paused);

        let step = run.on_task_finished(t(2), TaskStatus::Success).unwrap();
        assert!(step.dispatch.is_empty());
        assert_eq!(step.finished, None);
        assert_eq!(run.status(), WorkflowStatus::Paused);

        let step = run.resume().unwrap();
        assert_eq!(step.dispatch, vec![t(1)]);
        assert_eq!(run.status(), WorkflowStatus::Running);

        let step = run.on_task_finished(t(1), TaskStatus::Success).unwrap();
        assert_eq!(step.dispatch, vec![t(3)]);
        let step = run.on_task_finished(t(3), TaskStatus::Success).unwrap();
        assert_eq!(step.finished, Some(WorkflowStatus::Completed));
    }

    #[test]
    fn auto_retry_does_not_retry_cancelled_tasks() {
        let mut wf = workflow(ErrorPolicy::AutoRetry);
        wf.retry.max_retries = 3;
        let mut run = WorkflowRun::new(&wf, graph(&[1], &[]));
        run.start().unwrap();
        let step = run.on_task_finished(t(1), TaskStatus::Cancelled).unwrap();
        assert!(step.requeued.is_empty());
        assert_eq!(step.finished, Some(WorkflowStatus::Failed));
    }

    #[test]
    fn cancelled_task_leaves_siblings_running() {
        // 1 -S-> 3, 2 -C-> 4 ; cancel 1 while 2 is still running.
        let mut run = WorkflowRun::new(
            &workflow(ErrorPolicy::StopOnFailure),
            graph(&[1, 2, 3, 4], &[(1, 3, S), (2, 4, C)]),
        );
        run.start().unwrap();

        let step = run.on_task_finished(t(1), TaskStatus::Cancelled).unwrap();
        assert!(step.cancel.is_empty());
        assert_eq!(step.skipped, vec![t(3)]);
        assert_eq!(step.finished, None);

        let step = run.on_task_finished(t(2), TaskStatus::Success).unwrap();
        assert_eq!(step.dispatch, vec![t(4)]);
        let step = run.on_task_finished(t(4), TaskStatus::Success).unwrap();
        assert_eq!(step.finished, Some(WorkflowStatus::Failed));
    }

    #[test]
    fn retrying_reruns_only_unsuccessful_tasks() {
        let g = graph(&[1, 2, 3], &[(1, 2, S), (2, 3, S)]);
        let prior = BTreeMap::from([
            (t(1), TaskStatus::Success),
            (t(2), TaskStatus::Failed),
            (t(3), TaskStatus::Pending),
        ]);
        let mut run = WorkflowRun::retrying(&workflow(ErrorPolicy::StopOnFailure), g, &prior);
        assert_eq!(run.scope(), &BTreeSet::from([t(2), t(3)]));

        let step = run.start().unwrap();
        assert_eq!(step.dispatch, vec![t(2)]);
    }

    #[test]
    fn pause_holds_newly_eligible_tasks_until_resume() {
        let mut run = fan_out(ErrorPolicy::StopOnFailure);
        run.start().unwrap();
        run.pause().unwrap();

        let step = run.on_task_finished(t(1), TaskStatus::Success).unwrap();
        assert!(step.dispatch.is_empty());
        assert_eq!(step.finished, None);
        assert_eq!(run.status(), WorkflowStatus::Paused);

        let step = run.resume().unwrap();
        assert_eq!(step.dispatch, vec![t(2), t(3)]);
        assert!(run.resume().is_err());
    }

    #[test]
    fn cancel_returns_running_tasks() {
        let mut run = fan_out(ErrorPolicy::StopOnFailure);
        run.start().unwrap();
        run.on_task_finished(t(1), TaskStatus::Success).unwrap();

        let step = run.cancel().unwrap();
        assert_eq!(step.finished, Some(WorkflowStatus::Cancelled));
        assert_eq!(step.cancel, vec![t(2), t(3)]);
        assert!(run.cancel().is_err());
    }

    #[test]
    fn partial_run_starts_from_task_and_uses_prior_status() {
        // 1 -> 2 -> 3, 4 -> 3 ; start from 2 with 1 and 4 already successful.
        let g = graph(&[1, 2, 3, 4], &[(1, 2, S), (2, 3, S), (4, 3, S)]);
        let prior = BTreeMap::from([(t(1), TaskStatus::Success), (t(4), TaskStatus::Success)]);
        let mut run =
            WorkflowRun::from_task(&workflow(ErrorPolicy::StopOnFailure), g, t(2), &prior).unwrap();

        assert_eq!(run.progress().total, 2);
        let step = run.start().unwrap();
        assert_eq!(step.dispatch, vec![t(2)]);
        let step = run.on_task_finished(t(2), TaskStatus::Success).unwrap();
        assert_eq!(step.dispatch, vec![t(3)]);
        let step = run.on_task_finished(t(3), TaskStatus::Success).unwrap();
        assert_eq!(step.finished, Some(WorkflowStatus::Completed));
    }

    #[test]
    fn partial_run_with_unsatisfied_outside_predecessor_fails_when_stuck() {
        let g = graph(&[1, 2, 3, 4], &[(1, 2, S), (2, 3, S), (4, 3, S)]);
        let prior = BTreeMap::from([(t(1), TaskStatus::Success), (t(4), TaskStatus::Failed)]);
        let mut run =
            WorkflowRun::from_task(&workflow(ErrorPolicy::StopOnFailure), g, t(2), &prior).unwrap();
        run.start().unwrap();
        let step = run.on_task_finished(t(2), TaskStatus::Success).unwrap();
        assert!(step.dispatch.is_empty());
        assert_eq!(step.finished, Some(WorkflowStatus::Failed));
    }

    #[test]
    fn empty_workflow_completes_on_start() {
        let mut run = WorkflowRun::new(&workflow(ErrorPolicy::StopOnFailure), graph(&[], &[]));
        let step = run.start().unwrap();
        assert_eq!(step.finished, Some(WorkflowStatus::Completed));
    }

    #[test]
    fn unknown_completion_is_rejected() {
        let mut run = fan_out(ErrorPolicy::StopOnFailure);
        run.start().unwrap();
        assert!(run.on_task_finished(t(3), TaskStatus::Success).is_err());
    }
}
