use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use jobflow::exec::{ActionResult, ExecutorBackend};
use jobflow::task::model::Task;
use jobflow::types::TaskId;

/// What one attempt of a task does.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(String),
    /// Sleep, then succeed.
    Sleep(Duration),
    /// Block until the attempt is cancelled or times out.
    Hang,
    /// Block until the gate is notified, then succeed.
    Gate(Arc<Notify>),
}

/// A scripted executor that:
/// - records which tasks were run, in start order
/// - plays back a per-task queue of [`Step`]s, succeeding once a queue is empty
#[derive(Debug, Default)]
pub struct FakeExecutor {
    scripts: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    executed: Mutex<Vec<TaskId>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `steps` for the next attempts of `task`.
    pub fn script(&self, task: TaskId, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(task)
            .or_default()
            .extend(steps);
    }

    pub fn executed(&self) -> Vec<TaskId> {
        self.executed.lock().unwrap().clone()
    }

    pub fn runs_of(&self, task: TaskId) -> usize {
        self.executed().iter().filter(|t| **t == task).count()
    }

    fn next_step(&self, task: TaskId) -> Step {
        self.executed.lock().unwrap().push(task);
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&task)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }
}

impl ExecutorBackend for FakeExecutor {
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ActionResult> + Send + 'a>> {
        let step = self.next_step(task.id);
        let name = task.name.clone();

        Box::pin(async move {
            match step {
                Step::Succeed => Ok(format!("{name} ok")),
                Step::Fail(msg) => Err(anyhow!(msg)),
                Step::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(format!("{name} ok"))
                }
                Step::Hang => {
                    cancel.cancelled().await;
                    Err(anyhow!("{name} interrupted"))
                }
                Step::Gate(gate) => {
                    gate.notified().await;
                    Ok(format!("{name} ok"))
                }
            }
        })
    }
}
