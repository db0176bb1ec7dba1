// src/workflow/mod.rs

//! Workflow definitions and the per-run workflow state machine.

pub mod model;
pub mod run;

pub use model::{DependencyEdge, RunProgress, Workflow, WorkflowStatus};
pub use run::{RunStep, WorkflowRun};
