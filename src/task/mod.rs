// src/task/mod.rs

//! Task definitions and the per-task execution state machine.
//!
//! - [`model`] holds the persisted [`Task`] entity and its value types.
//! - [`state`] implements lifecycle transitions on top of it.

pub mod model;
pub mod state;

pub use model::{RetryPolicy, ScheduleWindow, Task, TaskKind, TaskStatus};
pub use state::{ActionOutcome, TaskTransition};
