//! Append-only trail of run status and flag changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{RunFlag, RunId, RunStatus};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunChange {
    Started,
    Status { from: RunStatus, to: RunStatus },
    Flag { flag: RunFlag },
}

impl RunChange {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Status { .. } => "status",
            Self::Flag { .. } => "flag",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAuditEntry {
    pub id: String,
    pub run_id: RunId,
    pub change: RunChange,
    pub reason: Option<String>,
    pub actor: String,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl RunAuditEntry {
    pub fn new(
        run_id: RunId,
        change: RunChange,
        actor: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id,
            change,
            reason: None,
            actor: actor.into(),
            correlation_id: correlation_id.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
