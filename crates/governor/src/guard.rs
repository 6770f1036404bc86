use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use runwarden_core::budget::{
    BudgetEvaluator, Evaluation, Governance, PolicyResolution, RemainingBudget, SpendSnapshot,
    Verdict,
};
use runwarden_core::domain::credential::Credential;
use runwarden_core::domain::run::AgentRun;
use runwarden_core::domain::team::Team;
use runwarden_core::errors::ApplicationError;
use runwarden_db::repositories::{CredentialRepository, SpendRepository};

use crate::error::persistence;
use crate::policy_store::PolicyStore;

/// Everything needed to judge one run: its tenant, originating credential
/// and the resolved policy.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub team: Team,
    pub credential: Option<Credential>,
    pub resolution: PolicyResolution,
}

impl RunContext {
    /// The credential override wins over the tenant default.
    pub fn max_steps(&self) -> u32 {
        self.credential
            .as_ref()
            .and_then(|credential| credential.max_steps_per_run)
            .unwrap_or(self.team.max_steps_per_run)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BudgetReport {
    pub evaluation: Evaluation,
    pub remaining: RemainingBudget,
    pub spend: SpendSnapshot,
}

/// Wires the pure evaluator to live spend totals and logs the outcomes
/// operators need to see.
#[derive(Clone)]
pub struct BudgetGuard {
    policies: PolicyStore,
    credentials: Arc<dyn CredentialRepository>,
    spend: Arc<dyn SpendRepository>,
    evaluator: BudgetEvaluator,
}

impl BudgetGuard {
    pub fn new(
        policies: PolicyStore,
        credentials: Arc<dyn CredentialRepository>,
        spend: Arc<dyn SpendRepository>,
    ) -> Self {
        Self { policies, credentials, spend, evaluator: BudgetEvaluator }
    }

    pub async fn context(&self, run: &AgentRun) -> Result<RunContext, ApplicationError> {
        let team = self.policies.find_team(run.team_id).await?;
        let credential = match run.credential_id {
            Some(id) => self.credentials.find_by_id(id).await.map_err(persistence)?,
            None => None,
        };
        let resolution = self.policies.resolve(run.team_id, credential.as_ref()).await?;
        Ok(RunContext { team, credential, resolution })
    }

    pub fn evaluate(
        &self,
        run: &AgentRun,
        context: &RunContext,
        spend: &SpendSnapshot,
    ) -> Evaluation {
        let evaluation = self.evaluator.evaluate(&context.resolution, spend);
        match (evaluation.governance, evaluation.verdict) {
            (Governance::Unconfigured, _) => warn!(
                event_name = "governance.policy.unconfigured",
                run_id = %run.run_id,
                team_id = %run.team_id,
                run_cost = %spend.run_cost,
                "no active budget policy; spend is ungoverned"
            ),
            (Governance::Governed, Verdict::Ok) => debug!(
                event_name = "governance.budget.ok",
                run_id = %run.run_id,
                run_cost = %spend.run_cost,
                "budget ok"
            ),
            (Governance::Governed, verdict) => warn!(
                event_name = "governance.budget.verdict",
                run_id = %run.run_id,
                team_id = %run.team_id,
                verdict = verdict.as_str(),
                spent = %evaluation.spent,
                limit = ?evaluation.limit,
                auto_kill = evaluation.auto_kill,
                "budget threshold crossed"
            ),
        }
        evaluation
    }

    /// Current verdict and remaining amounts for a run without recording
    /// any spend.
    pub async fn report(
        &self,
        run: &AgentRun,
        at: DateTime<Utc>,
    ) -> Result<BudgetReport, ApplicationError> {
        let context = self.context(run).await?;
        let spend = self
            .spend
            .snapshot(run.team_id, run.credential_id, run.total_cost, at)
            .await
            .map_err(persistence)?;
        let evaluation = self.evaluate(run, &context, &spend);
        let remaining = self.evaluator.remaining(&context.resolution, &spend);
        Ok(BudgetReport { evaluation, remaining, spend })
    }
}
