// src/exec/procedure.rs

//! Named procedures callable from `TaskKind::Procedure`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio_util::sync::CancellationToken;

use crate::exec::backend::ActionResult;

pub type ProcedureFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;

type ProcedureFn = Arc<dyn Fn(Vec<String>, CancellationToken) -> ProcedureFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<String, ProcedureFn>,
}

impl std::fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.procedures.keys().collect();
        names.sort();
        f.debug_struct("ProcedureRegistry")
            .field("procedures", &names)
            .finish()
    }
}

impl ProcedureRegistry {
    /// Registry with the built-in procedures:
    ///
    /// - `noop`: succeeds with empty output.
    /// - `echo`: succeeds with its arguments joined by spaces.
    /// - `sleep <millis>`: waits, stopping early on cancellation.
    /// - `fail`: fails with its arguments as the message.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("noop", |_, _| Box::pin(noop()));
        registry.register("echo", |args, _| Box::pin(echo(args)));
        registry.register("sleep", |args, cancel| Box::pin(sleep(args, cancel)));
        registry.register("fail", |args, _| Box::pin(fail(args)));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<String>, CancellationToken) -> ProcedureFuture + Send + Sync + 'static,
    {
        self.procedures.insert(name.into(), Arc::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    pub async fn call(&self, name: &str, args: Vec<String>, cancel: CancellationToken) -> ActionResult {
        let procedure = self
            .procedures
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown procedure '{name}'"))?;
        procedure(args, cancel).await
    }
}

async fn noop() -> ActionResult {
    Ok(String::new())
}

async fn echo(args: Vec<String>) -> ActionResult {
    Ok(args.join(" "))
}

async fn sleep(args: Vec<String>, cancel: CancellationToken) -> ActionResult {
    let millis: u64 = args
        .first()
        .ok_or_else(|| anyhow!("sleep needs a duration in milliseconds"))?
        .parse()
        .map_err(|e| anyhow!("sleep: {e}"))?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(format!("slept {millis}ms")),
        _ = cancel.cancelled() => bail!("sleep interrupted"),
    }
}

async fn fail(args: Vec<String>) -> ActionResult {
    bail!("{}", args.join(" "))
}
