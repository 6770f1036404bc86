use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use runwarden_core::budget::PolicyResolution;
use runwarden_core::domain::credential::Credential;
use runwarden_core::domain::policy::{BudgetPolicy, NewBudgetPolicy, PolicyId};
use runwarden_core::domain::team::{NewTeam, Team, TeamId};
use runwarden_core::errors::{ApplicationError, DomainError};
use runwarden_db::repositories::{PolicyRepository, TeamRepository};

use crate::error::{not_found, persistence};

/// Tenants and their budget policies.
#[derive(Clone)]
pub struct PolicyStore {
    teams: Arc<dyn TeamRepository>,
    policies: Arc<dyn PolicyRepository>,
}

impl PolicyStore {
    pub fn new(teams: Arc<dyn TeamRepository>, policies: Arc<dyn PolicyRepository>) -> Self {
        Self { teams, policies }
    }

    pub async fn create_team(&self, team: NewTeam) -> Result<Team, ApplicationError> {
        team.validate()?;
        let team = self.teams.insert(team, Utc::now()).await.map_err(persistence)?;
        info!(event_name = "governance.team.created", team_id = %team.id, slug = %team.slug, "team created");
        Ok(team)
    }

    pub async fn find_team(&self, team_id: TeamId) -> Result<Team, ApplicationError> {
        self.teams
            .find_by_id(team_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| not_found("team", team_id))
    }

    pub async fn list_teams(&self) -> Result<Vec<Team>, ApplicationError> {
        self.teams.list().await.map_err(persistence)
    }

    /// The tenant, provided it exists and is active.
    pub async fn active_team(&self, team_id: TeamId) -> Result<Team, ApplicationError> {
        match self.teams.find_by_id(team_id).await.map_err(persistence)? {
            Some(team) if team.is_active => Ok(team),
            _ => Err(DomainError::InvalidTenant(team_id.to_string()).into()),
        }
    }

    /// New runs are refused afterwards; runs already in flight continue.
    pub async fn deactivate_team(&self, team_id: TeamId) -> Result<Team, ApplicationError> {
        let team = self
            .teams
            .set_active(team_id, false, Utc::now())
            .await
            .map_err(persistence)?
            .ok_or_else(|| not_found("team", team_id))?;
        info!(event_name = "governance.team.deactivated", team_id = %team_id, "team deactivated");
        Ok(team)
    }

    /// Creates a policy, filling unset daily/monthly limits from the tenant's
    /// default budgets.
    pub async fn create_policy(
        &self,
        policy: NewBudgetPolicy,
    ) -> Result<BudgetPolicy, ApplicationError> {
        let team = self.find_team(policy.team_id).await?;
        let policy = policy.with_team_defaults(&team);
        policy.validate()?;

        let stored = self.policies.insert(policy, Utc::now()).await.map_err(persistence)?;
        info!(
            event_name = "governance.policy.created",
            team_id = %stored.team_id,
            policy_id = %stored.id,
            auto_kill = stored.auto_kill_enabled,
            "budget policy created"
        );
        Ok(stored)
    }

    pub async fn set_policy_active(
        &self,
        policy_id: PolicyId,
        active: bool,
    ) -> Result<BudgetPolicy, ApplicationError> {
        self.policies
            .set_active(policy_id, active, Utc::now())
            .await
            .map_err(persistence)?
            .ok_or_else(|| not_found("policy", policy_id))
    }

    pub async fn policies_for(&self, team_id: TeamId) -> Result<Vec<BudgetPolicy>, ApplicationError> {
        self.policies.list_for_team(team_id).await.map_err(persistence)
    }

    /// Combines the tenant's active policies with an optional credential
    /// override.
    pub async fn resolve(
        &self,
        team_id: TeamId,
        credential: Option<&Credential>,
    ) -> Result<PolicyResolution, ApplicationError> {
        let policies = self.policies_for(team_id).await?;
        Ok(PolicyResolution::resolve(&policies, credential))
    }
}
