use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

pub const DEFAULT_MAX_STEPS_PER_RUN: u32 = 30;
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 120;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TeamId(pub i64);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant. Every credential, policy and run is scoped to exactly one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub slug: String,
    /// Fallback limits for policies created without their own.
    pub default_daily_budget: Option<Decimal>,
    pub default_monthly_budget: Option<Decimal>,
    pub max_steps_per_run: u32,
    pub timeout_seconds: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Team {
    pub fn run_timeout(&self) -> Duration {
        Duration::seconds(i64::from(self.timeout_seconds))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTeam {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub default_daily_budget: Option<Decimal>,
    #[serde(default)]
    pub default_monthly_budget: Option<Decimal>,
    pub max_steps_per_run: u32,
    pub timeout_seconds: u32,
}

impl NewTeam {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            default_daily_budget: None,
            default_monthly_budget: None,
            max_steps_per_run: DEFAULT_MAX_STEPS_PER_RUN,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvariantViolation("team name is required".to_owned()));
        }
        let slug_ok = !self.slug.is_empty()
            && self.slug.chars().all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
        if !slug_ok {
            return Err(DomainError::InvariantViolation(format!(
                "team slug `{}` must be lowercase alphanumerics and dashes",
                self.slug
            )));
        }
        let budgets = [
            ("default_daily_budget", self.default_daily_budget),
            ("default_monthly_budget", self.default_monthly_budget),
        ];
        for (field, value) in budgets {
            if value.is_some_and(|amount| amount < Decimal::ZERO) {
                return Err(DomainError::InvariantViolation(format!(
                    "{field} must not be negative"
                )));
            }
        }
        if self.max_steps_per_run == 0 {
            return Err(DomainError::InvariantViolation(
                "max_steps_per_run must be greater than zero".to_owned(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(DomainError::InvariantViolation(
                "timeout_seconds must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}
