//! Agent run state machine.
//!
//! `running` is the only non-terminal state. Every run reaches at most one of
//! `completed`, `failed` or `killed`, and never leaves it. Killing is the only
//! idempotent command: repeating it against a terminal run is a no-op.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::run::{RunId, RunStatus};
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KillOrigin {
    Policy,
    Dashboard,
    LoopDetector,
}

impl KillOrigin {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Dashboard => "dashboard",
            Self::LoopDetector => "loop-detector",
        }
    }

    fn from_prefix(value: &str) -> Option<Self> {
        match value {
            "policy" => Some(Self::Policy),
            "dashboard" => Some(Self::Dashboard),
            "loop-detector" => Some(Self::LoopDetector),
            _ => None,
        }
    }
}

/// A kill reason tagged with where the kill originated, rendered as
/// `origin:detail` (for example `policy:EXCEEDED_DAILY`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KillReason {
    origin: KillOrigin,
    detail: String,
}

impl KillReason {
    pub fn new(origin: KillOrigin, detail: impl Into<String>) -> Result<Self, DomainError> {
        let detail = detail.into().trim().to_owned();
        if detail.is_empty() {
            return Err(DomainError::KillReasonRequired);
        }
        Ok(Self { origin, detail })
    }

    pub fn policy(detail: impl Into<String>) -> Result<Self, DomainError> {
        Self::new(KillOrigin::Policy, detail)
    }

    pub fn dashboard(detail: impl Into<String>) -> Result<Self, DomainError> {
        Self::new(KillOrigin::Dashboard, detail)
    }

    pub fn loop_detector(detail: impl Into<String>) -> Result<Self, DomainError> {
        Self::new(KillOrigin::LoopDetector, detail)
    }

    /// Parses operator input. Text that already names an operator origin keeps
    /// it; anything else is attributed to the dashboard. `policy:` is only ever
    /// minted by enforcement and is refused here.
    pub fn from_operator_input(raw: &str) -> Result<Self, DomainError> {
        let raw = raw.trim();
        if let Some((prefix, detail)) = raw.split_once(':') {
            match KillOrigin::from_prefix(prefix.trim()) {
                Some(KillOrigin::Policy) => {
                    return Err(DomainError::ReservedKillOrigin(KillOrigin::Policy.prefix()))
                }
                Some(origin) => return Self::new(origin, detail),
                None => {}
            }
        }
        Self::dashboard(raw)
    }

    pub fn origin(&self) -> KillOrigin {
        self.origin
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin.prefix(), self.detail)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunCommand {
    Complete,
    Fail { error: String },
    Kill { reason: KillReason },
}

impl RunCommand {
    pub fn target(&self) -> RunStatus {
        match self {
            Self::Complete => RunStatus::Completed,
            Self::Fail { .. } => RunStatus::Failed,
            Self::Kill { .. } => RunStatus::Killed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionDecision {
    Apply { from: RunStatus, to: RunStatus },
    AlreadyTerminal { status: RunStatus },
}

pub fn decide(
    run_id: &RunId,
    current: RunStatus,
    command: &RunCommand,
) -> Result<TransitionDecision, DomainError> {
    let target = command.target();
    match (current, command) {
        (RunStatus::Running, _) => Ok(TransitionDecision::Apply { from: current, to: target }),
        (status, RunCommand::Kill { .. }) => Ok(TransitionDecision::AlreadyTerminal { status }),
        (status, _) => Err(DomainError::RunNotActive { run_id: run_id.clone(), status }),
    }
}
