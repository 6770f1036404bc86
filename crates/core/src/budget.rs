//! Budget evaluation.
//!
//! Resolution folds the tenant's active policies (and an optional credential
//! override) into one effective policy; evaluation compares a spend snapshot
//! against it. Both are pure so callers decide what to do with the verdict.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::credential::Credential;
use crate::domain::policy::{BudgetPolicy, PolicyId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Ok,
    Alert,
    ExceededPerRun,
    ExceededDaily,
    ExceededMonthly,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Alert => "ALERT",
            Self::ExceededPerRun => "EXCEEDED_PER_RUN",
            Self::ExceededDaily => "EXCEEDED_DAILY",
            Self::ExceededMonthly => "EXCEEDED_MONTHLY",
        }
    }

    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::ExceededPerRun | Self::ExceededDaily | Self::ExceededMonthly)
    }
}

/// Whether a verdict came from real limits or from the absence of any policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Governance {
    Governed,
    Unconfigured,
}

/// Whose spend the daily limit is measured against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendScope {
    Tenant,
    Credential,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    pub policy_ids: Vec<PolicyId>,
    pub per_run_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub daily_scope: SpendScope,
    pub monthly_limit: Option<Decimal>,
    pub alert_threshold: Option<Decimal>,
    pub auto_kill: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "governance", rename_all = "snake_case")]
pub enum PolicyResolution {
    Governed(ResolvedPolicy),
    Unconfigured,
}

impl PolicyResolution {
    /// Combines every active policy by taking the most restrictive value per
    /// dimension. Auto-kill applies if any active policy enables it. A
    /// credential daily budget then replaces the daily limit and is measured
    /// against that credential's own spend.
    pub fn resolve(policies: &[BudgetPolicy], credential: Option<&Credential>) -> Self {
        let active: Vec<&BudgetPolicy> = policies.iter().filter(|policy| policy.is_active).collect();
        if active.is_empty() {
            return Self::Unconfigured;
        }

        let mut policy_ids: Vec<PolicyId> = active.iter().map(|policy| policy.id).collect();
        policy_ids.sort();

        let mut resolved = ResolvedPolicy {
            policy_ids,
            per_run_limit: tightest(active.iter().map(|policy| policy.per_run_limit)),
            daily_limit: tightest(active.iter().map(|policy| policy.daily_limit)),
            daily_scope: SpendScope::Tenant,
            monthly_limit: tightest(active.iter().map(|policy| policy.monthly_limit)),
            alert_threshold: tightest(active.iter().map(|policy| policy.alert_threshold)),
            auto_kill: active.iter().any(|policy| policy.auto_kill_enabled),
        };

        if let Some(budget) = credential.and_then(|credential| credential.daily_budget) {
            resolved.daily_limit = Some(budget);
            resolved.daily_scope = SpendScope::Credential;
        }

        Self::Governed(resolved)
    }

    pub fn governance(&self) -> Governance {
        match self {
            Self::Governed(_) => Governance::Governed,
            Self::Unconfigured => Governance::Unconfigured,
        }
    }
}

fn tightest(values: impl Iterator<Item = Option<Decimal>>) -> Option<Decimal> {
    values.flatten().min()
}

/// Spend totals as of the moment of evaluation, including the latest call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendSnapshot {
    pub run_cost: Decimal,
    pub tenant_daily: Decimal,
    pub tenant_monthly: Decimal,
    pub credential_daily: Decimal,
}

impl SpendSnapshot {
    fn daily(&self, scope: SpendScope) -> Decimal {
        match scope {
            SpendScope::Tenant => self.tenant_daily,
            SpendScope::Credential => self.credential_daily,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub governance: Governance,
    /// The limit that produced the verdict, if any.
    pub limit: Option<Decimal>,
    /// The spend compared against `limit`.
    pub spent: Decimal,
    pub auto_kill: bool,
}

impl Evaluation {
    fn ok(governance: Governance, spent: Decimal, auto_kill: bool) -> Self {
        Self { verdict: Verdict::Ok, governance, limit: None, spent, auto_kill }
    }

    pub fn should_kill(&self) -> bool {
        self.verdict.is_exceeded() && self.auto_kill
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingBudget {
    pub governance: Governance,
    pub per_run: Option<Decimal>,
    pub daily: Option<Decimal>,
    pub monthly: Option<Decimal>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BudgetEvaluator;

impl BudgetEvaluator {
    /// Limits are exceeded only when spend is strictly greater than them.
    /// Checks run per-run, daily, monthly, then the alert threshold.
    pub fn evaluate(&self, resolution: &PolicyResolution, spend: &SpendSnapshot) -> Evaluation {
        let PolicyResolution::Governed(policy) = resolution else {
            return Evaluation::ok(Governance::Unconfigured, spend.run_cost, false);
        };

        let checks = [
            (Verdict::ExceededPerRun, policy.per_run_limit, spend.run_cost),
            (Verdict::ExceededDaily, policy.daily_limit, spend.daily(policy.daily_scope)),
            (Verdict::ExceededMonthly, policy.monthly_limit, spend.tenant_monthly),
            (Verdict::Alert, policy.alert_threshold, spend.run_cost),
        ];

        for (verdict, limit, spent) in checks {
            if let Some(limit) = limit {
                if spent > limit {
                    return Evaluation {
                        verdict,
                        governance: Governance::Governed,
                        limit: Some(limit),
                        spent,
                        auto_kill: policy.auto_kill,
                    };
                }
            }
        }

        Evaluation::ok(Governance::Governed, spend.run_cost, policy.auto_kill)
    }

    pub fn remaining(&self, resolution: &PolicyResolution, spend: &SpendSnapshot) -> RemainingBudget {
        let PolicyResolution::Governed(policy) = resolution else {
            return RemainingBudget {
                governance: Governance::Unconfigured,
                per_run: None,
                daily: None,
                monthly: None,
            };
        };

        let left = |limit: Option<Decimal>, spent: Decimal| {
            limit.map(|limit| (limit - spent).max(Decimal::ZERO))
        };

        RemainingBudget {
            governance: Governance::Governed,
            per_run: left(policy.per_run_limit, spend.run_cost),
            daily: left(policy.daily_limit, spend.daily(policy.daily_scope)),
            monthly: left(policy.monthly_limit, spend.tenant_monthly),
        }
    }
}
