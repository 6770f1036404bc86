//! Agent run management API.
//!
//! - `POST /api/v1/runs`                     start a run
//! - `GET  /api/v1/runs/{run_id}`            show a run
//! - `POST /api/v1/runs/{run_id}/progress`   record progress and enforce the budget
//! - `POST /api/v1/runs/{run_id}/complete`   optional `?actor=`
//! - `POST /api/v1/runs/{run_id}/fail`
//! - `POST /api/v1/runs/{run_id}/kill`       idempotent
//! - `POST /api/v1/runs/{run_id}/flags`
//! - `GET  /api/v1/runs/{run_id}/budget`     verdict and remaining amounts

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use runwarden_core::audit::RunAuditEntry;
use runwarden_core::domain::run::{AgentRun, RunFlag, RunId, RunProgress};
use runwarden_core::domain::team::TeamId;
use runwarden_core::lifecycle::KillReason;
use runwarden_governor::{BudgetReport, ProgressReport, StartRun};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{ApiError, ApiJson, AppState, Internal};

pub const DASHBOARD_ACTOR: &str = "dashboard";

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub team_id: i64,
    pub model: String,
    pub run_id: Option<String>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    #[serde(default = "one_step")]
    pub steps: u32,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub latency_ms: u64,
}

fn one_step() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
pub struct ActorRequest {
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub error: Option<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KillRequest {
    #[serde(default)]
    pub reason: String,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FlagRequest {
    pub flag: RunFlag,
    pub actor: Option<String>,
}

/// A run as returned by the API, with its derived duration.
#[derive(Debug, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: AgentRun,
    pub duration_seconds: i64,
}

impl From<AgentRun> for RunView {
    fn from(run: AgentRun) -> Self {
        let duration_seconds = run.duration(Utc::now()).num_seconds().max(0);
        Self { run, duration_seconds }
    }
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    pub run: RunView,
    pub transitions: Vec<RunAuditEntry>,
}

#[derive(Debug, Serialize)]
pub struct AppliedResponse {
    pub run: RunView,
    pub changed: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/runs", post(start_run))
        .route("/api/v1/runs/{run_id}", get(show_run))
        .route("/api/v1/runs/{run_id}/progress", post(record_progress))
        .route("/api/v1/runs/{run_id}/complete", post(complete_run))
        .route("/api/v1/runs/{run_id}/fail", post(fail_run))
        .route("/api/v1/runs/{run_id}/kill", post(kill_run))
        .route("/api/v1/runs/{run_id}/flags", post(raise_flag))
        .route("/api/v1/runs/{run_id}/budget", get(budget))
}

fn actor(actor: Option<String>) -> String {
    actor
        .map(|actor| actor.trim().to_string())
        .filter(|actor| !actor.is_empty())
        .unwrap_or_else(|| DASHBOARD_ACTOR.to_string())
}

async fn start_run(
    internal: Internal,
    State(state): State<AppState>,
    ApiJson(request): ApiJson<StartRunRequest>,
) -> Result<(StatusCode, Json<RunView>), ApiError> {
    let start = StartRun {
        team_id: TeamId(request.team_id),
        model: request.model,
        run_id: request.run_id,
        agent_id: request.agent_id,
        agent_name: request.agent_name,
        api_key: request.api_key.map(SecretString::from),
        metadata: request.metadata,
    };
    let run = state
        .governor
        .runs
        .start(start, &internal.correlation_id)
        .await
        .map_err(|error| internal.fail(error))?;
    Ok((StatusCode::CREATED, Json(run.into())))
}

async fn show_run(
    internal: Internal,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    let run_id = RunId(run_id);
    let run = state.governor.runs.find(&run_id).await.map_err(|error| internal.fail(error))?;
    let transitions =
        state.governor.runs.transitions(&run_id).await.map_err(|error| internal.fail(error))?;
    Ok(Json(RunDetail { run: run.into(), transitions }))
}

async fn record_progress(
    internal: Internal,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    ApiJson(request): ApiJson<ProgressRequest>,
) -> Result<Json<ProgressReport>, ApiError> {
    let progress = RunProgress {
        steps: request.steps,
        tokens: request.tokens,
        cost: request.cost,
        latency_ms: request.latency_ms,
    };
    let report = state
        .governor
        .runs
        .record_progress(&RunId(run_id), progress, &internal.correlation_id)
        .await
        .map_err(|error| internal.fail(error))?;
    Ok(Json(report))
}

async fn complete_run(
    internal: Internal,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(request): Query<ActorRequest>,
) -> Result<Json<RunView>, ApiError> {
    let run = state
        .governor
        .runs
        .complete(&RunId(run_id), &actor(request.actor), &internal.correlation_id)
        .await
        .map_err(|error| internal.fail(error))?;
    Ok(Json(run.into()))
}

async fn fail_run(
    internal: Internal,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    ApiJson(request): ApiJson<FailRequest>,
) -> Result<Json<RunView>, ApiError> {
    let error = request.error.unwrap_or_default();
    let run = state
        .governor
        .runs
        .fail(&RunId(run_id), &error, &actor(request.actor), &internal.correlation_id)
        .await
        .map_err(|error| internal.fail(error))?;
    Ok(Json(run.into()))
}

async fn kill_run(
    internal: Internal,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    ApiJson(request): ApiJson<KillRequest>,
) -> Result<Json<AppliedResponse>, ApiError> {
    let reason =
        KillReason::from_operator_input(&request.reason).map_err(|error| internal.fail(error.into()))?;
    let applied = state
        .governor
        .runs
        .kill(&RunId(run_id), reason, &actor(request.actor), &internal.correlation_id)
        .await
        .map_err(|error| internal.fail(error))?;
    Ok(Json(AppliedResponse { run: applied.run.into(), changed: applied.changed }))
}

async fn raise_flag(
    internal: Internal,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    ApiJson(request): ApiJson<FlagRequest>,
) -> Result<Json<AppliedResponse>, ApiError> {
    let applied = state
        .governor
        .runs
        .raise_flag(&RunId(run_id), request.flag, &actor(request.actor), &internal.correlation_id)
        .await
        .map_err(|error| internal.fail(error))?;
    Ok(Json(AppliedResponse { run: applied.run.into(), changed: applied.changed }))
}

async fn budget(
    internal: Internal,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<BudgetReport>, ApiError> {
    let report =
        state.governor.runs.budget(&RunId(run_id)).await.map_err(|error| internal.fail(error))?;
    Ok(Json(report))
}
