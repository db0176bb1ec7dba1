// src/exec/mod.rs

//! Action execution layer.
//!
//! - [`backend`] provides the `ExecutorBackend` trait and the production
//!   `ActionExecutor` (shell, HTTP, procedures). Tests swap in a fake.
//! - [`procedure`] holds the registry of named procedures.
//! - [`task_runner`] bounds one attempt by its timeout and cancellation and
//!   converts everything into an `ActionOutcome`.

pub mod backend;
pub mod procedure;
pub mod task_runner;

pub use backend::{ActionExecutor, ActionResult, ExecutorBackend};
pub use procedure::ProcedureRegistry;
pub use task_runner::run_action;
