// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::types::{TaskId, WorkflowId};

#[derive(Error, Debug)]
pub enum JobflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    /// Lock acquisition failed or the lock backend errored. Never treated
    /// as success; the trigger is retried at a later cycle.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// An edge mutation would have introduced a cycle. The graph is left
    /// unchanged.
    #[error("Cycle detected in DAG: {0}")]
    CycleDetected(String),

    #[error("Invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Not executable: {0}")]
    NotExecutable(String),

    #[error("Retries exhausted: {0}")]
    RetriesExhausted(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Stale version for {entity}: expected {expected}, found {found}")]
    StaleVersion {
        entity: String,
        expected: u64,
        found: u64,
    },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<tokio_rusqlite::Error> for JobflowError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        JobflowError::Backend(err.to_string())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, JobflowError>;
