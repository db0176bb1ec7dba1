// src/task/state.rs

//! Task execution state machine.
//!
//! ```text
//! Created ─▶ Pending ─▶ Running ─┬▶ Success
//!              ▲                 ├▶ Failed  ─┐
//!              │                 ├▶ Timeout ─┤ (retries left)
//!              │                 └▶ Cancelled│
//!              └──────── Retry ◀─────────────┘
//! ```
//!
//! All transitions are methods on [`Task`] that validate the current status
//! and return [`JobflowError::InvalidTransition`] otherwise. Outcomes of the
//! dispatched action arrive as plain [`ActionOutcome`] values; nothing in
//! here depends on errors unwinding out of the executor.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::{add_duration, duration_until};
use crate::errors::{JobflowError, Result};
use crate::task::model::{Task, TaskStatus};

/// Result of one dispatched attempt, produced at the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded { output: String },
    Failed { error: String },
    /// The action did not finish within the task's timeout and was
    /// interrupted.
    TimedOut { after: Duration },
    /// The action was interrupted by an external cancellation.
    Cancelled,
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Succeeded { .. })
    }

    fn summary(&self) -> String {
        match self {
            ActionOutcome::Succeeded { output } => output.clone(),
            ActionOutcome::Failed { error } => error.clone(),
            ActionOutcome::TimedOut { after } => format!("timed out after {after:?}"),
            ActionOutcome::Cancelled => "cancelled".to_string(),
        }
    }
}

/// A status change applied by [`Task::record_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub retry_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether a scheduler may dispatch this task right now.
    ///
    /// Necessary but not sufficient: the `task:{id}` lock is the
    /// authoritative guard across processes.
    pub fn is_executable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.deleted && self.window.contains(now) && !self.status.is_active()
    }

    /// Enabled and inside its window, regardless of status.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.deleted && self.window.contains(now)
    }

    /// Fresh trigger: move to `Pending` with a full retry budget.
    ///
    /// A task left `Pending` by an earlier run that stopped before reaching
    /// it is picked up as is.
    pub fn begin_run(&mut self) -> Result<()> {
        match self.status {
            TaskStatus::Created
            | TaskStatus::Pending
            | TaskStatus::Success
            | TaskStatus::Failed
            | TaskStatus::Timeout
            | TaskStatus::Cancelled => {
                self.set_status(TaskStatus::Pending);
                self.current_retries = 0;
                self.next_retry_at = None;
                Ok(())
            }
            other => Err(self.invalid(other, TaskStatus::Pending)),
        }
    }

    /// `Retry -> Pending`, keeping the retry counter.
    pub fn prepare_retry(&mut self) -> Result<()> {
        match self.status {
            TaskStatus::Retry => {
                self.set_status(TaskStatus::Pending);
                Ok(())
            }
            other => Err(self.invalid(other, TaskStatus::Pending)),
        }
    }

    /// `Pending -> Running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            TaskStatus::Pending => {
                self.set_status(TaskStatus::Running);
                self.last_execution = Some(now);
                self.next_retry_at = None;
                Ok(())
            }
            other => Err(self.invalid(other, TaskStatus::Running)),
        }
    }

    /// Apply the outcome of the attempt that is currently `Running`.
    ///
    /// Failures and timeouts consume one retry. Once the counter reaches
    /// `max_retries` the failure is terminal; otherwise the task waits in
    /// `Retry` until `now + interval`.
    pub fn record_outcome(
        &mut self,
        outcome: &ActionOutcome,
        now: DateTime<Utc>,
    ) -> Result<TaskTransition> {
        let from = self.status;
        if from != TaskStatus::Running {
            return Err(JobflowError::InvalidTransition(format!(
                "{}: cannot record an outcome while {:?}",
                self.id, from
            )));
        }

        self.last_result = Some(outcome.summary());
        self.last_duration = self.last_execution.map(|started| duration_until(started, now));

        let (to, retry_at) = match outcome {
            ActionOutcome::Succeeded { .. } => {
                self.current_retries = 0;
                (TaskStatus::Success, None)
            }
            ActionOutcome::Cancelled => (TaskStatus::Cancelled, None),
            ActionOutcome::Failed { .. } | ActionOutcome::TimedOut { .. } => {
                let terminal = if matches!(outcome, ActionOutcome::TimedOut { .. }) {
                    TaskStatus::Timeout
                } else {
                    TaskStatus::Failed
                };

                if self.current_retries < self.retry.max_retries {
                    self.current_retries += 1;
                }

                if self.retries_exhausted() {
                    warn!(
                        task = %self.id,
                        retries = self.current_retries,
                        max_retries = self.retry.max_retries,
                        "retries exhausted; task is terminal"
                    );
                    (terminal, None)
                } else {
                    let at = add_duration(now, self.retry.interval);
                    (TaskStatus::Retry, Some(at))
                }
            }
        };

        self.next_retry_at = retry_at;
        self.set_status(to);

        Ok(TaskTransition { from, to, retry_at })
    }

    /// External cancellation. Allowed while pending, running or waiting to
    /// retry; never retried afterwards.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Retry => {
                if self.status == TaskStatus::Running {
                    self.last_duration = self
                        .last_execution
                        .map(|started| duration_until(started, now));
                }
                self.next_retry_at = None;
                self.last_result = Some("cancelled".to_string());
                self.set_status(TaskStatus::Cancelled);
                Ok(())
            }
            other => Err(self.invalid(other, TaskStatus::Cancelled)),
        }
    }

    /// Check whether an operator-requested retry is allowed.
    pub fn ensure_retryable(&self) -> Result<()> {
        match self.status {
            TaskStatus::Retry => Ok(()),
            TaskStatus::Cancelled => Err(JobflowError::Cancelled(format!(
                "{} was cancelled and is not retried",
                self.id
            ))),
            TaskStatus::Failed | TaskStatus::Timeout => Err(JobflowError::RetriesExhausted(
                format!(
                    "{} used {}/{} retries",
                    self.id, self.current_retries, self.retry.max_retries
                ),
            )),
            other => Err(JobflowError::InvalidTransition(format!(
                "{}: nothing to retry while {:?}",
                self.id, other
            ))),
        }
    }

    /// Drop an attempt left `Running` or `Retry` by an owner that no longer
    /// holds the task lock. Returns whether anything was reset.
    pub fn recover_stale(&mut self) -> bool {
        if !matches!(self.status, TaskStatus::Running | TaskStatus::Retry) {
            return false;
        }
        warn!(task = %self.id, status = ?self.status, "recovering abandoned attempt");
        self.next_retry_at = None;
        self.set_status(TaskStatus::Pending);
        true
    }

    fn set_status(&mut self, to: TaskStatus) {
        if self.status != to {
            debug!(task = %self.id, from = ?self.status, to = ?to, "task status change");
            if to.is_terminal() {
                info!(task = %self.id, status = ?to, "task reached terminal state");
            }
        }
        self.status = to;
    }

    fn invalid(&self, from: TaskStatus, to: TaskStatus) -> JobflowError {
        JobflowError::InvalidTransition(format!("{}: {:?} -> {:?}", self.id, from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::{RetryPolicy, ScheduleWindow, TaskKind};
    use crate::types::{TaskId, TenantId};

    fn task(max_retries: u32) -> Task {
        let mut t = Task::new(
            TaskId(1),
            TenantId(1),
            "t",
            TaskKind::Shell {
                command: "true".into(),
            },
        );
        t.retry = RetryPolicy {
            max_retries,
            interval: Duration::from_secs(30),
        };
        t
    }

    fn fail() -> ActionOutcome {
        ActionOutcome::Failed {
            error: "boom".into(),
        }
    }

    fn run_attempt(t: &mut Task, outcome: ActionOutcome, now: DateTime<Utc>) -> TaskTransition {
        if t.status == TaskStatus::Retry {
            t.prepare_retry().unwrap();
        } else {
            t.begin_run().unwrap();
        }
        t.start(now).unwrap();
        t.record_outcome(&outcome, now).unwrap()
    }

    #[test]
    fn two_failures_with_two_retries_end_failed() {
        let now = Utc::now();
        let mut t = task(2);

        let first = run_attempt(&mut t, fail(), now);
        assert_eq!(first.to, TaskStatus::Retry);
        assert_eq!(t.current_retries, 1);
        assert_eq!(first.retry_at, Some(now + chrono::Duration::seconds(30)));

        let second = run_attempt(&mut t, fail(), now);
        assert_eq!(second.to, TaskStatus::Failed);
        assert_eq!(t.current_retries, 2);
        assert_eq!(t.next_retry_at, None);
    }

    #[test]
    fn retry_counter_never_exceeds_max() {
        let now = Utc::now();
        let mut t = task(0);
        let tr = run_attempt(&mut t, fail(), now);
        assert_eq!(tr.to, TaskStatus::Failed);
        assert_eq!(t.current_retries, 0);

        // A terminal failure cannot be retried by an operator.
        assert!(matches!(
            t.ensure_retryable(),
            Err(JobflowError::RetriesExhausted(_))
        ));
    }

    #[test]
    fn timeout_consumes_a_retry_but_stays_distinct_from_failure() {
        let now = Utc::now();
        let mut t = task(1);
        let tr = run_attempt(
            &mut t,
            ActionOutcome::TimedOut {
                after: Duration::from_secs(1),
            },
            now,
        );
        assert_eq!(tr.to, TaskStatus::Timeout);
        assert_eq!(t.current_retries, 1);
    }

    #[test]
    fn success_resets_the_counter() {
        let now = Utc::now();
        let mut t = task(3);
        run_attempt(&mut t, fail(), now);
        assert_eq!(t.current_retries, 1);

        let tr = run_attempt(&mut t, ActionOutcome::Succeeded { output: "ok".into() }, now);
        assert_eq!(tr.to, TaskStatus::Success);
        assert_eq!(t.current_retries, 0);
        assert_eq!(t.last_result.as_deref(), Some("ok"));
    }

    #[test]
    fn cancellation_is_terminal_and_not_retried() {
        let now = Utc::now();
        let mut t = task(5);
        t.begin_run().unwrap();
        t.start(now).unwrap();
        t.cancel(now).unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(matches!(t.ensure_retryable(), Err(JobflowError::Cancelled(_))));
        assert!(t.cancel(now).is_err());
    }

    #[test]
    fn active_tasks_and_closed_windows_are_not_executable() {
        let now = Utc::now();
        let mut t = task(0);
        assert!(t.is_executable(now));

        t.begin_run().unwrap();
        assert!(!t.is_executable(now), "pending task must not be dispatched twice");
        t.start(now).unwrap();
        assert!(!t.is_executable(now));

        let mut later = task(0);
        later.window = ScheduleWindow {
            start: Some(now + chrono::Duration::hours(1)),
            end: None,
        };
        assert!(!later.is_executable(now));

        let mut disabled = task(0);
        disabled.enabled = false;
        assert!(!disabled.is_executable(now));
    }

    #[test]
    fn outcome_requires_running() {
        let mut t = task(0);
        let err = t
            .record_outcome(&ActionOutcome::Cancelled, Utc::now())
            .unwrap_err();
        assert!(matches!(err, JobflowError::InvalidTransition(_)));
    }
}
