use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::team::TeamId;
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialId(pub i64);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant-scoped API key. The plaintext secret is never stored; only the
/// display prefix and a one-way hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub team_id: TeamId,
    pub user_id: Option<i64>,
    pub name: String,
    pub key_prefix: String,
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    pub daily_budget: Option<Decimal>,
    pub max_steps_per_run: Option<u32>,
    pub allowed_models: Vec<String>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a credential is unusable. Kept internal to logs; callers only ever see
/// `DomainError::InvalidCredential`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialRejection {
    Inactive,
    Expired,
    OverDailyBudget,
}

impl CredentialRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Expired => "expired",
            Self::OverDailyBudget => "over_daily_budget",
        }
    }
}

impl Credential {
    pub fn masked_key(&self) -> String {
        format!("{}...********", self.key_prefix)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn check_usable(
        &self,
        now: DateTime<Utc>,
        spent_today: Decimal,
    ) -> Result<(), CredentialRejection> {
        if !self.is_active {
            return Err(CredentialRejection::Inactive);
        }
        if self.is_expired(now) {
            return Err(CredentialRejection::Expired);
        }
        if self.daily_budget.is_some_and(|budget| spent_today >= budget) {
            return Err(CredentialRejection::OverDailyBudget);
        }
        Ok(())
    }

    pub fn is_valid(&self, now: DateTime<Utc>, spent_today: Decimal) -> bool {
        self.check_usable(now, spent_today).is_ok()
    }

    /// An empty allow-list permits every model.
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|allowed| allowed == model)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCredential {
    pub team_id: TeamId,
    pub user_id: Option<i64>,
    pub name: String,
    pub daily_budget: Option<Decimal>,
    pub max_steps_per_run: Option<u32>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewCredential {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvariantViolation("credential name is required".to_owned()));
        }
        if self.daily_budget.is_some_and(|budget| budget < Decimal::ZERO) {
            return Err(DomainError::InvariantViolation(
                "credential daily_budget must not be negative".to_owned(),
            ));
        }
        if self.max_steps_per_run == Some(0) {
            return Err(DomainError::InvariantViolation(
                "credential max_steps_per_run must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}
