// src/types.rs

//! Identifiers and small shared enums used across the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identity of a task definition.
    TaskId,
    "task"
);
id_type!(
    /// Identity of a workflow definition.
    WorkflowId,
    "wf"
);
id_type!(TenantId, "tenant");
id_type!(
    /// Identity of a dependency edge inside a workflow.
    EdgeId,
    "edge"
);

/// What an API call or lock key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Task(TaskId),
    Workflow(WorkflowId),
}

impl Target {
    /// Lock key guarding execution of this target.
    pub fn lock_key(&self) -> String {
        match self {
            Target::Task(id) => format!("task:{}", id.0),
            Target::Workflow(id) => format!("workflow:{}", id.0),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Task(id) => id.fmt(f),
            Target::Workflow(id) => id.fmt(f),
        }
    }
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Operator asked for it (CLI or admin action).
    Manual,
    /// A cron fire or schedule window opened.
    Scheduled,
    /// External API call.
    Api,
    /// An upstream workflow completed successfully.
    UpstreamWorkflow,
    /// Some other external event.
    Event,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Api => "api",
            TriggerType::UpstreamWorkflow => "upstream_workflow",
            TriggerType::Event => "event",
        };
        f.write_str(s)
    }
}

/// Scheduling priority of a task or workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Dependency condition carried by a workflow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Target runs only if the source succeeded.
    #[default]
    SuccessRequired,
    /// Target runs once the source reached any terminal state.
    CompletionRequired,
}

/// How a workflow run reacts to a task that failed terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    StopOnFailure,
    SkipFailed,
    AutoRetry,
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "stop_on_failure" => Ok(ErrorPolicy::StopOnFailure),
            "skip_failed" => Ok(ErrorPolicy::SkipFailed),
            "auto_retry" => Ok(ErrorPolicy::AutoRetry),
            other => Err(format!(
                "invalid error_handling: {other} (expected \"stop_on_failure\", \"skip_failed\" or \"auto_retry\")"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_namespaced_by_kind() {
        assert_eq!(Target::Task(TaskId(7)).lock_key(), "task:7");
        assert_eq!(Target::Workflow(WorkflowId(7)).lock_key(), "workflow:7");
    }

    #[test]
    fn error_policy_parses_both_spellings() {
        assert_eq!("skip-failed".parse::<ErrorPolicy>(), Ok(ErrorPolicy::SkipFailed));
        assert_eq!("AUTO_RETRY".parse::<ErrorPolicy>(), Ok(ErrorPolicy::AutoRetry));
        assert!("sometimes".parse::<ErrorPolicy>().is_err());
    }
}
