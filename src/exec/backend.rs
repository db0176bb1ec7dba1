// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The orchestrator talks to an `ExecutorBackend` instead of spawning work
//! itself, so tests can swap in a scripted executor while production uses
//! [`ActionExecutor`].
//!
//! A backend only performs the action. Timeouts, cancellation and panic
//! capture are layered on top by [`crate::exec::task_runner::run_action`].

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exec::procedure::ProcedureRegistry;
use crate::task::model::{Task, TaskKind};

/// Text kept from an action's output.
const MAX_OUTPUT: usize = 4096;

/// Output of an action that finished on its own, or why it failed.
pub type ActionResult = anyhow::Result<String>;

/// Trait abstracting how a task's action is run.
pub trait ExecutorBackend: Send + Sync {
    /// Run the action of `task` to completion.
    ///
    /// `cancel` fires on timeout or external cancellation. Implementations
    /// may watch it to stop early; the caller drops the future either way.
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ActionResult> + Send + 'a>>;
}

/// Production backend: shell commands, HTTP calls and registered
/// procedures.
#[derive(Clone)]
pub struct ActionExecutor {
    http: reqwest::Client,
    procedures: Arc<ProcedureRegistry>,
}

impl ActionExecutor {
    pub fn new(procedures: ProcedureRegistry) -> Self {
        Self {
            http: reqwest::Client::new(),
            procedures: Arc::new(procedures),
        }
    }

    async fn run_shell(&self, task: &Task, command: &str) -> ActionResult {
        info!(task = %task.id, cmd = %command, "starting task process");

        // Build a shell command appropriate for the platform.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning process for task '{}'", task.name))?;

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("waiting for process of task '{}'", task.name))?;

        let code = output.status.code().unwrap_or(-1);
        debug!(task = %task.id, exit_code = code, "task process exited");

        if output.status.success() {
            Ok(tail(&String::from_utf8_lossy(&output.stdout)))
        } else {
            bail!(
                "exit code {code}: {}",
                tail(&String::from_utf8_lossy(&output.stderr))
            )
        }
    }

    async fn run_http(
        &self,
        task: &Task,
        method: &str,
        url: &str,
        body: Option<&str>,
    ) -> ActionResult {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| anyhow!("invalid HTTP method '{method}'"))?;
        info!(task = %task.id, %method, %url, "sending HTTP request");

        let mut request = self
            .http
            .request(method, url)
            .timeout(task.timeout.max(Duration::from_millis(1)));
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            Ok(tail(&text))
        } else {
            bail!("HTTP {status}: {}", tail(&text))
        }
    }
}

impl ExecutorBackend for ActionExecutor {
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ActionResult> + Send + 'a>> {
        Box::pin(async move {
            match &task.kind {
                TaskKind::Shell { command } => self.run_shell(task, command).await,
                TaskKind::Http { method, url, body } => {
                    self.run_http(task, method, url, body.as_deref()).await
                }
                TaskKind::Procedure { name, args } => {
                    self.procedures.call(name, args.clone(), cancel).await
                }
            }
        })
    }
}

/// Last `MAX_OUTPUT` bytes of `text`, trimmed, on a char boundary.
fn tail(text: &str) -> String {
    let text = text.trim();
    if text.len() <= MAX_OUTPUT {
        return text.to_string();
    }
    let mut start = text.len() - MAX_OUTPUT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
