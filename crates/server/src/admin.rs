//! Tenant, policy and credential administration.
//!
//! - `POST /api/v1/teams`
//! - `POST /api/v1/teams/{team_id}/deactivate`
//! - `POST /api/v1/teams/{team_id}/policies`
//! - `POST /api/v1/teams/{team_id}/credentials`   secret returned once
//! - `POST /api/v1/credentials/{id}/regenerate`   secret returned once
//! - `POST /api/v1/credentials/verify`

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use runwarden_core::domain::credential::{Credential, CredentialId, NewCredential};
use runwarden_core::domain::policy::{BudgetPolicy, NewBudgetPolicy};
use runwarden_core::domain::team::{NewTeam, Team, TeamId};
use runwarden_governor::IssuedCredential;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{ApiError, ApiJson, AppState, Internal};

#[derive(Debug, Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
    pub slug: String,
    pub default_daily_budget: Option<Decimal>,
    pub default_monthly_budget: Option<Decimal>,
    pub max_steps_per_run: Option<u32>,
    pub timeout_seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    pub name: String,
    pub description: Option<String>,
    pub per_run_limit: Option<Decimal>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub alert_threshold: Option<Decimal>,
    pub auto_kill_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct IssueCredentialRequest {
    pub name: String,
    pub user_id: Option<i64>,
    pub daily_budget: Option<Decimal>,
    pub max_steps_per_run: Option<u32>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub api_key: String,
}

/// A credential for display: never the hash, only the masked key.
#[derive(Debug, Serialize)]
pub struct CredentialView {
    #[serde(flatten)]
    pub credential: Credential,
    pub masked_key: String,
}

impl From<Credential> for CredentialView {
    fn from(credential: Credential) -> Self {
        let masked_key = credential.masked_key();
        Self { credential, masked_key }
    }
}

#[derive(Debug, Serialize)]
pub struct IssuedResponse {
    pub credential: CredentialView,
    /// Shown once; only its hash is stored.
    pub api_key: String,
}

impl From<IssuedCredential> for IssuedResponse {
    fn from(issued: IssuedCredential) -> Self {
        Self {
            api_key: issued.secret.expose_secret().to_string(),
            credential: issued.credential.into(),
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/teams", post(create_team))
        .route("/api/v1/teams/{team_id}/deactivate", post(deactivate_team))
        .route("/api/v1/teams/{team_id}/policies", post(create_policy))
        .route("/api/v1/teams/{team_id}/credentials", post(issue_credential))
        .route("/api/v1/credentials/{id}/regenerate", post(regenerate_credential))
        .route("/api/v1/credentials/verify", post(verify_credential))
}

async fn create_team(
    internal: Internal,
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateTeamRequest>,
) -> Result<(StatusCode, Json<Team>), ApiError> {
    let mut team = NewTeam::new(request.name, request.slug);
    team.default_daily_budget = request.default_daily_budget;
    team.default_monthly_budget = request.default_monthly_budget;
    if let Some(max_steps) = request.max_steps_per_run {
        team.max_steps_per_run = max_steps;
    }
    if let Some(timeout) = request.timeout_seconds {
        team.timeout_seconds = timeout;
    }

    let team = state.governor.policies.create_team(team).await.map_err(|error| internal.fail(error))?;
    info!(
        event_name = "admin.team.created",
        team_id = %team.id,
        correlation_id = %internal.correlation_id,
        "team created"
    );
    Ok((StatusCode::CREATED, Json(team)))
}

async fn deactivate_team(
    internal: Internal,
    State(state): State<AppState>,
    Path(team_id): Path<i64>,
) -> Result<Json<Team>, ApiError> {
    let team = state
        .governor
        .policies
        .deactivate_team(TeamId(team_id))
        .await
        .map_err(|error| internal.fail(error))?;
    info!(
        event_name = "admin.team.deactivated",
        team_id = %team.id,
        correlation_id = %internal.correlation_id,
        "team deactivated"
    );
    Ok(Json(team))
}

async fn create_policy(
    internal: Internal,
    State(state): State<AppState>,
    Path(team_id): Path<i64>,
    ApiJson(request): ApiJson<CreatePolicyRequest>,
) -> Result<(StatusCode, Json<BudgetPolicy>), ApiError> {
    let mut policy = NewBudgetPolicy::new(TeamId(team_id), request.name);
    policy.description = request.description;
    policy.per_run_limit = request.per_run_limit;
    policy.daily_limit = request.daily_limit;
    policy.monthly_limit = request.monthly_limit;
    policy.alert_threshold = request.alert_threshold;
    if let Some(auto_kill) = request.auto_kill_enabled {
        policy.auto_kill_enabled = auto_kill;
    }

    let policy =
        state.governor.policies.create_policy(policy).await.map_err(|error| internal.fail(error))?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn issue_credential(
    internal: Internal,
    State(state): State<AppState>,
    Path(team_id): Path<i64>,
    ApiJson(request): ApiJson<IssueCredentialRequest>,
) -> Result<(StatusCode, Json<IssuedResponse>), ApiError> {
    let credential = NewCredential {
        team_id: TeamId(team_id),
        user_id: request.user_id,
        name: request.name,
        daily_budget: request.daily_budget,
        max_steps_per_run: request.max_steps_per_run,
        allowed_models: request.allowed_models,
        expires_at: request.expires_at,
    };
    let issued =
        state.governor.credentials.issue(credential).await.map_err(|error| internal.fail(error))?;
    Ok((StatusCode::CREATED, Json(issued.into())))
}

async fn regenerate_credential(
    internal: Internal,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<IssuedResponse>, ApiError> {
    let issued = state
        .governor
        .credentials
        .regenerate(CredentialId(id))
        .await
        .map_err(|error| internal.fail(error))?;
    Ok(Json(issued.into()))
}

async fn verify_credential(
    internal: Internal,
    State(state): State<AppState>,
    ApiJson(request): ApiJson<VerifyRequest>,
) -> Result<Json<CredentialView>, ApiError> {
    let credential = state
        .governor
        .credentials
        .verify(&request.api_key)
        .await
        .map_err(|error| internal.fail(error))?;
    Ok(Json(credential.into()))
}
