use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::credential::CredentialId;
use crate::domain::team::TeamId;
use crate::errors::DomainError;

pub const MAX_RUN_ID_LEN: usize = 50;

/// Public run identifier, distinct from the internal storage key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run_{}", Uuid::new_v4().simple()))
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_RUN_ID_LEN {
            return Err(DomainError::InvariantViolation(format!(
                "run_id must be 1..={MAX_RUN_ID_LEN} characters"
            )));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Annotations that may be raised while a run is still running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFlag {
    LoopDetected,
    BudgetExceeded,
}

impl RunFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoopDetected => "loop_detected",
            Self::BudgetExceeded => "budget_exceeded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "loop_detected" => Some(Self::LoopDetected),
            "budget_exceeded" => Some(Self::BudgetExceeded),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRun {
    #[serde(skip)]
    pub internal_id: i64,
    pub run_id: RunId,
    pub team_id: TeamId,
    pub credential_id: Option<CredentialId>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub model: Option<String>,
    pub step_count: u32,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub total_latency_ms: u64,
    pub status: RunStatus,
    pub kill_reason: Option<String>,
    pub loop_detected: bool,
    pub budget_exceeded: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRun {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn flag(&self, flag: RunFlag) -> bool {
        match flag {
            RunFlag::LoopDetected => self.loop_detected,
            RunFlag::BudgetExceeded => self.budget_exceeded,
        }
    }

    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.ended_at.unwrap_or(now) - self.started_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }

    /// Checks the structural rules every persisted run must satisfy.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        match (self.status.is_terminal(), self.ended_at) {
            (true, None) => {
                return Err(DomainError::InvariantViolation(format!(
                    "run `{}` is {} but has no ended_at",
                    self.run_id,
                    self.status.as_str()
                )))
            }
            (false, Some(_)) => {
                return Err(DomainError::InvariantViolation(format!(
                    "run `{}` is running but has ended_at",
                    self.run_id
                )))
            }
            _ => {}
        }

        let killed = self.status == RunStatus::Killed;
        let has_reason = self.kill_reason.as_deref().is_some_and(|reason| !reason.is_empty());
        if killed != has_reason {
            return Err(DomainError::InvariantViolation(format!(
                "run `{}` kill_reason must be present exactly when killed",
                self.run_id
            )));
        }

        if self.total_cost < Decimal::ZERO {
            return Err(DomainError::InvariantViolation(format!(
                "run `{}` has negative total_cost",
                self.run_id
            )));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAgentRun {
    pub run_id: Option<RunId>,
    pub team_id: TeamId,
    pub credential_id: Option<CredentialId>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Counter deltas for one or more completed LLM calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    #[serde(default)]
    pub steps: u32,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub latency_ms: u64,
}

impl RunProgress {
    pub fn single_call(tokens: u64, cost: Decimal, latency_ms: u64) -> Self {
        Self { steps: 1, tokens, cost, latency_ms }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.cost < Decimal::ZERO {
            return Err(DomainError::InvalidProgress("cost delta must not be negative".to_owned()));
        }
        if i64::try_from(self.tokens).is_err() || i64::try_from(self.latency_ms).is_err() {
            return Err(DomainError::InvalidProgress("counter delta is out of range".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use serde_json::Map;

    use super::{AgentRun, RunId, RunProgress, RunStatus};
    use crate::domain::team::TeamId;

    fn running() -> AgentRun {
        let now = Utc::now();
        AgentRun {
            internal_id: 1,
            run_id: RunId("run_test".to_owned()),
            team_id: TeamId(1),
            credential_id: None,
            agent_id: None,
            agent_name: None,
            model: Some("gpt-4o-mini".to_owned()),
            step_count: 0,
            total_tokens: 0,
            total_cost: Decimal::ZERO,
            total_latency_ms: 0,
            status: RunStatus::Running,
            kill_reason: None,
            loop_detected: false,
            budget_exceeded: false,
            started_at: now,
            ended_at: None,
            metadata: Map::new(),
            updated_at: now,
        }
    }

    #[test]
    fn generated_run_ids_are_prefixed_and_fit_storage() {
        let id = RunId::generate();
        assert!(id.as_str().starts_with("run_"));
        assert!(id.as_str().len() <= 50);
        assert_ne!(id, RunId::generate());
    }

    #[test]
    fn run_id_parse_rejects_oversized_values() {
        assert!(RunId::parse(&"x".repeat(51)).is_err());
        assert!(RunId::parse("  ").is_err());
        assert_eq!(RunId::parse(" run_a ").expect("valid").as_str(), "run_a");
    }

    #[test]
    fn status_round_trips_through_storage_encoding() {
        for status in
            [RunStatus::Running, RunStatus::Completed, RunStatus::Failed, RunStatus::Killed]
        {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Killed.is_terminal());
    }

    #[test]
    fn killed_run_without_reason_violates_invariants() {
        let mut run = running();
        assert!(run.check_invariants().is_ok());

        run.status = RunStatus::Killed;
        run.ended_at = Some(Utc::now());
        assert!(run.check_invariants().is_err());

        run.kill_reason = Some("dashboard:operator".to_owned());
        assert!(run.check_invariants().is_ok());
    }

    #[test]
    fn terminal_run_requires_ended_at() {
        let mut run = running();
        run.status = RunStatus::Completed;
        assert!(run.check_invariants().is_err());
    }

    #[test]
    fn duration_uses_now_until_the_run_ends() {
        let mut run = running();
        run.started_at = Utc::now() - Duration::seconds(30);
        let now = run.started_at + Duration::seconds(30);
        assert_eq!(run.duration(now), Duration::seconds(30));

        run.ended_at = Some(run.started_at + Duration::seconds(5));
        assert_eq!(run.duration(now), Duration::seconds(5));
    }

    #[test]
    fn negative_cost_delta_is_rejected() {
        let progress = RunProgress::single_call(10, Decimal::new(-1, 2), 5);
        assert!(progress.validate().is_err());
        assert!(RunProgress::single_call(10, Decimal::new(1, 2), 5).validate().is_ok());
    }
}
