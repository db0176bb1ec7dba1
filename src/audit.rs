// src/audit.rs

//! Best-effort audit trail of operator and engine actions.

use std::fmt::{self, Debug};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::errors::Result;
use crate::types::{Target, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Schedule,
    Execute,
    Cancel,
    Retry,
    Pause,
    Resume,
    AddDependency,
    RemoveDependency,
    /// An attempt or run reached a final state.
    Finish,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::Schedule => "schedule",
            AuditAction::Execute => "execute",
            AuditAction::Cancel => "cancel",
            AuditAction::Retry => "retry",
            AuditAction::Pause => "pause",
            AuditAction::Resume => "resume",
            AuditAction::AddDependency => "add_dependency",
            AuditAction::RemoveDependency => "remove_dependency",
            AuditAction::Finish => "finish",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub tenant: TenantId,
    pub actor: String,
    pub action: AuditAction,
    pub target: Target,
    pub detail: String,
}

#[async_trait]
pub trait AuditSink: Send + Sync + Debug {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// Emits entries on the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        info!(
            target: "audit",
            at = %entry.at,
            tenant = %entry.tenant,
            actor = %entry.actor,
            action = %entry.action,
            target_id = %entry.target,
            detail = %entry.detail,
            "audit entry"
        );
        Ok(())
    }
}
