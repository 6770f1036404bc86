use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::run::{AgentRun, RunId, RunStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RunKilled,
    LoopDetected,
    BudgetExceeded,
    RunCompleted,
    RunFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunKilled => "run_killed",
            Self::LoopDetected => "loop_detected",
            Self::BudgetExceeded => "budget_exceeded",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    RunKilled { run_id: RunId, reason: String, total_cost: Decimal },
    LoopDetected { run_id: RunId, step_count: u32, total_cost: Decimal },
    BudgetExceeded { run_id: RunId, spent: Decimal, budget: Option<Decimal> },
    RunCompleted { run_id: RunId, step_count: u32, total_cost: Decimal, total_latency_ms: u64 },
    RunFailed { run_id: RunId, error: String },
}

impl AlertEvent {
    pub fn kind(&self) -> AlertKind {
        match self {
            Self::RunKilled { .. } => AlertKind::RunKilled,
            Self::LoopDetected { .. } => AlertKind::LoopDetected,
            Self::BudgetExceeded { .. } => AlertKind::BudgetExceeded,
            Self::RunCompleted { .. } => AlertKind::RunCompleted,
            Self::RunFailed { .. } => AlertKind::RunFailed,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunKilled { run_id, .. }
            | Self::LoopDetected { run_id, .. }
            | Self::BudgetExceeded { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }

    /// Alert for a run that just entered a terminal status.
    pub fn for_terminal(run: &AgentRun) -> Option<Self> {
        let run_id = run.run_id.clone();
        match run.status {
            RunStatus::Running => None,
            RunStatus::Killed => Some(Self::RunKilled {
                run_id,
                reason: run.kill_reason.clone().unwrap_or_else(|| "unknown".to_owned()),
                total_cost: run.total_cost,
            }),
            RunStatus::Completed => Some(Self::RunCompleted {
                run_id,
                step_count: run.step_count,
                total_cost: run.total_cost,
                total_latency_ms: run.total_latency_ms,
            }),
            RunStatus::Failed => Some(Self::RunFailed {
                run_id,
                error: run.error_message().unwrap_or("Unknown error").to_owned(),
            }),
        }
    }

    /// Alert for a loop flag that was just raised.
    pub fn loop_detected(run: &AgentRun) -> Self {
        Self::LoopDetected {
            run_id: run.run_id.clone(),
            step_count: run.step_count,
            total_cost: run.total_cost,
        }
    }

    /// Alert for a budget flag that was just raised. `spent` is the amount
    /// compared against `budget`, which may be a tenant total rather than the
    /// run's own cost.
    pub fn budget_exceeded(run: &AgentRun, spent: Decimal, budget: Option<Decimal>) -> Self {
        Self::BudgetExceeded { run_id: run.run_id.clone(), spent, budget }
    }
}

/// Receives every run status change and every newly raised flag exactly once.
/// Implementations must not block the caller.
pub trait AlertSink: Send + Sync {
    fn notify(&self, event: AlertEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAlertSink;

impl AlertSink for NoopAlertSink {
    fn notify(&self, _event: AlertEvent) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedAlert {
    pub event: AlertEvent,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct InMemoryAlertSink {
    alerts: Arc<Mutex<Vec<RecordedAlert>>>,
}

impl InMemoryAlertSink {
    pub fn events(&self) -> Vec<AlertEvent> {
        self.recorded().into_iter().map(|alert| alert.event).collect()
    }

    pub fn recorded(&self) -> Vec<RecordedAlert> {
        match self.alerts.lock() {
            Ok(alerts) => alerts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count_of(&self, kind: AlertKind) -> usize {
        self.recorded().iter().filter(|alert| alert.event.kind() == kind).count()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn notify(&self, event: AlertEvent) {
        let alert = RecordedAlert { event, recorded_at: Utc::now() };
        match self.alerts.lock() {
            Ok(mut alerts) => alerts.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}
