use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::team::{Team, TeamId};
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub i64);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Spend limits for a tenant. An unset limit leaves that dimension ungoverned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub id: PolicyId,
    pub team_id: TeamId,
    pub name: String,
    pub description: Option<String>,
    pub per_run_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub alert_threshold: Option<Decimal>,
    pub auto_kill_enabled: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBudgetPolicy {
    pub team_id: TeamId,
    pub name: String,
    pub description: Option<String>,
    pub per_run_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub alert_threshold: Option<Decimal>,
    pub auto_kill_enabled: bool,
}

impl NewBudgetPolicy {
    pub fn new(team_id: TeamId, name: impl Into<String>) -> Self {
        Self {
            team_id,
            name: name.into(),
            description: None,
            per_run_limit: None,
            daily_limit: None,
            monthly_limit: None,
            alert_threshold: None,
            auto_kill_enabled: true,
        }
    }

    /// Fills unset daily/monthly limits from the tenant's defaults.
    pub fn with_team_defaults(mut self, team: &Team) -> Self {
        self.daily_limit = self.daily_limit.or(team.default_daily_budget);
        self.monthly_limit = self.monthly_limit.or(team.default_monthly_budget);
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvariantViolation("policy name is required".to_owned()));
        }

        let limits = [
            ("per_run_limit", self.per_run_limit),
            ("daily_limit", self.daily_limit),
            ("monthly_limit", self.monthly_limit),
            ("alert_threshold", self.alert_threshold),
        ];
        for (field, value) in limits {
            if value.is_some_and(|amount| amount < Decimal::ZERO) {
                return Err(DomainError::InvariantViolation(format!(
                    "policy {field} must not be negative"
                )));
            }
        }

        if let (Some(daily), Some(monthly)) = (self.daily_limit, self.monthly_limit) {
            if daily > monthly {
                return Err(DomainError::InvariantViolation(
                    "policy daily_limit must not exceed monthly_limit".to_owned(),
                ));
            }
        }

        Ok(())
    }
}
