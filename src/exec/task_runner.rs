// src/exec/task_runner.rs

//! Bounded, cancellable execution of a single task attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::exec::backend::ExecutorBackend;
use crate::task::model::Task;
use crate::task::state::ActionOutcome;

/// Run the action of `task` on `backend` and turn whatever happens into an
/// [`ActionOutcome`].
///
/// - The action runs in its own Tokio task, so a panic becomes `Failed`.
/// - If `task.timeout` elapses first, the action's token is cancelled and
///   its task aborted (shell children are killed on drop): `TimedOut`.
/// - If `cancel` fires first, the same teardown happens: `Cancelled`.
///
/// Nothing here returns an error; the outcome is the result.
pub async fn run_action(
    backend: Arc<dyn ExecutorBackend>,
    task: Task,
    cancel: CancellationToken,
) -> ActionOutcome {
    let action_token = cancel.child_token();
    let timeout = task.timeout.max(Duration::from_millis(1));
    let task_id = task.id;

    let handle = {
        let backend = Arc::clone(&backend);
        let token = action_token.clone();
        tokio::spawn(async move { backend.execute(&task, token).await })
    };
    let abort = handle.abort_handle();

    // Cancellation is checked first: a cooperative backend returns an error
    // as soon as its token fires, and that must not read as a failure.
    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            info!(task = %task_id, "cancellation requested; interrupting action");
            abort.abort();
            ActionOutcome::Cancelled
        }

        joined = handle => match joined {
            _ if cancel.is_cancelled() => {
                info!(task = %task_id, "action ended after cancellation");
                ActionOutcome::Cancelled
            }
            Ok(Ok(output)) => ActionOutcome::Succeeded { output },
            Ok(Err(err)) => {
                warn!(task = %task_id, error = %format!("{err:#}"), "task action failed");
                ActionOutcome::Failed { error: format!("{err:#}") }
            }
            Err(join_err) if join_err.is_panic() => {
                error!(task = %task_id, "task action panicked");
                ActionOutcome::Failed { error: "action panicked".to_string() }
            }
            Err(join_err) => ActionOutcome::Failed { error: join_err.to_string() },
        },

        _ = sleep(timeout) => {
            warn!(task = %task_id, ?timeout, "task timed out; interrupting action");
            action_token.cancel();
            abort.abort();
            ActionOutcome::TimedOut { after: timeout }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use super::*;
    use crate::exec::backend::ActionResult;
    use crate::task::model::TaskKind;
    use crate::types::{TaskId, TenantId};

    /// Behaviour keyed on the procedure name.
    struct Canned;

    impl ExecutorBackend for Canned {
        fn execute<'a>(
            &'a self,
            task: &'a Task,
            cancel: CancellationToken,
        ) -> Pin<Box<dyn Future<Output = ActionResult> + Send + 'a>> {
            Box::pin(async move {
                match &task.kind {
                    TaskKind::Procedure { name, .. } if name == "ok" => Ok("done".to_string()),
                    TaskKind::Procedure { name, .. } if name == "hang" => {
                        sleep(Duration::from_secs(3600)).await;
                        Ok(String::new())
                    }
                    TaskKind::Procedure { name, .. } if name == "panic" => {
                        panic!("boom")
                    }
                    TaskKind::Procedure { name, .. } if name == "cooperative" => {
                        cancel.cancelled().await;
                        Err(anyhow::anyhow!("interrupted"))
                    }
                    _ => Err(anyhow::anyhow!("bad task")),
                }
            })
        }
    }

    fn task(proc_name: &str, timeout: Duration) -> Task {
        let mut t = Task::new(
            TaskId(1),
            TenantId(1),
            proc_name,
            TaskKind::Procedure {
                name: proc_name.into(),
                args: vec![],
            },
        );
        t.timeout = timeout;
        t
    }

    #[tokio::test]
    async fn outcomes_are_values() {
        let backend: Arc<dyn ExecutorBackend> = Arc::new(Canned);
        let long = Duration::from_secs(5);

        let ok = run_action(backend.clone(), task("ok", long), CancellationToken::new()).await;
        assert_eq!(ok, ActionOutcome::Succeeded { output: "done".into() });

        let failed = run_action(backend.clone(), task("other", long), CancellationToken::new()).await;
        assert!(matches!(failed, ActionOutcome::Failed { .. }));

        let panicked = run_action(backend, task("panic", long), CancellationToken::new()).await;
        assert_eq!(
            panicked,
            ActionOutcome::Failed {
                error: "action panicked".into()
            }
        );
    }

    #[tokio::test]
    async fn hanging_action_times_out() {
        let backend: Arc<dyn ExecutorBackend> = Arc::new(Canned);
        let outcome = run_action(
            backend,
            task("hang", Duration::from_millis(50)),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(
            outcome,
            ActionOutcome::TimedOut {
                after: Duration::from_millis(50)
            }
        );
    }

    #[tokio::test]
    async fn external_cancel_interrupts() {
        let backend: Arc<dyn ExecutorBackend> = Arc::new(Canned);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = run_action(backend, task("hang", Duration::from_secs(10)), token).await;
        assert_eq!(outcome, ActionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cooperative_action_stopping_on_cancel_is_cancelled() {
        let backend: Arc<dyn ExecutorBackend> = Arc::new(Canned);
        for _ in 0..50 {
            let token = CancellationToken::new();
            let trigger = token.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                trigger.cancel();
            });

            let outcome =
                run_action(backend.clone(), task("cooperative", Duration::from_secs(10)), token).await;
            assert_eq!(outcome, ActionOutcome::Cancelled);
        }
    }

    #[tokio::test]
    async fn already_cancelled_token_never_reports_failure() {
        let backend: Arc<dyn ExecutorBackend> = Arc::new(Canned);
        let token = CancellationToken::new();
        token.cancel();
        let outcome = run_action(backend, task("other", Duration::from_secs(10)), token).await;
        assert_eq!(outcome, ActionOutcome::Cancelled);
    }
}
