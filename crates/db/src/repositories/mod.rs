use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use runwarden_core::audit::RunAuditEntry;
use runwarden_core::budget::SpendSnapshot;
use runwarden_core::domain::credential::{Credential, CredentialId, NewCredential};
use runwarden_core::domain::policy::{BudgetPolicy, NewBudgetPolicy, PolicyId};
use runwarden_core::domain::request_log::{NewRequestLog, RequestLog};
use runwarden_core::domain::run::{AgentRun, NewAgentRun, RunFlag, RunId, RunProgress, RunStatus};
use runwarden_core::domain::team::{NewTeam, Team, TeamId};
use runwarden_core::lifecycle::RunCommand;

mod codec;
pub mod credential;
pub mod policy;
pub mod request_log;
pub mod run;
pub mod spend;
pub mod team;

pub use credential::SqlCredentialRepository;
pub use policy::SqlPolicyRepository;
pub use request_log::SqlRequestLogRepository;
pub use run::SqlRunRepository;
pub use spend::{SpendPeriod, SpendSubject, SpendTotal, SqlSpendRepository};
pub use team::SqlTeamRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Result of applying a progress delta to a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Counters were updated; `spend` holds the accumulator totals written in
    /// the same transaction, with `run_cost` set to the run's new total.
    Applied { run: AgentRun, spend: SpendSnapshot },
    NotActive(RunStatus),
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishOutcome {
    Applied(AgentRun),
    AlreadyTerminal(AgentRun),
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlagOutcome {
    Raised(AgentRun),
    AlreadySet(AgentRun),
    NotActive(AgentRun),
    NotFound,
}

#[async_trait]
pub trait TeamRepository: Send + Sync {
    async fn insert(&self, team: NewTeam, at: DateTime<Utc>) -> Result<Team, RepositoryError>;
    async fn find_by_id(&self, id: TeamId) -> Result<Option<Team>, RepositoryError>;
    async fn list(&self) -> Result<Vec<Team>, RepositoryError>;
    async fn set_active(
        &self,
        id: TeamId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Team>, RepositoryError>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn insert(
        &self,
        credential: NewCredential,
        key_prefix: &str,
        key_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<Credential, RepositoryError>;
    async fn find_by_id(&self, id: CredentialId) -> Result<Option<Credential>, RepositoryError>;
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, RepositoryError>;
    async fn list_for_team(&self, team_id: TeamId) -> Result<Vec<Credential>, RepositoryError>;
    /// Swaps the stored prefix and hash in one statement; the previous hash
    /// stops matching as soon as this returns.
    async fn replace_secret(
        &self,
        id: CredentialId,
        key_prefix: &str,
        key_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Credential>, RepositoryError>;
    async fn touch_last_used(
        &self,
        id: CredentialId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
    async fn set_active(
        &self,
        id: CredentialId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Credential>, RepositoryError>;
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn insert(
        &self,
        policy: NewBudgetPolicy,
        at: DateTime<Utc>,
    ) -> Result<BudgetPolicy, RepositoryError>;
    async fn find_by_id(&self, id: PolicyId) -> Result<Option<BudgetPolicy>, RepositoryError>;
    async fn list_for_team(&self, team_id: TeamId) -> Result<Vec<BudgetPolicy>, RepositoryError>;
    async fn set_active(
        &self,
        id: PolicyId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<BudgetPolicy>, RepositoryError>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn insert(
        &self,
        run_id: RunId,
        run: NewAgentRun,
        audit: RunAuditEntry,
        at: DateTime<Utc>,
    ) -> Result<AgentRun, RepositoryError>;
    async fn find_by_run_id(&self, run_id: &RunId) -> Result<Option<AgentRun>, RepositoryError>;
    async fn list_running(&self) -> Result<Vec<AgentRun>, RepositoryError>;
    async fn record_progress(
        &self,
        run_id: &RunId,
        progress: RunProgress,
        at: DateTime<Utc>,
    ) -> Result<ProgressOutcome, RepositoryError>;
    async fn finish(
        &self,
        run_id: &RunId,
        command: &RunCommand,
        audit: RunAuditEntry,
        at: DateTime<Utc>,
    ) -> Result<FinishOutcome, RepositoryError>;
    async fn raise_flag(
        &self,
        run_id: &RunId,
        flag: RunFlag,
        audit: RunAuditEntry,
        at: DateTime<Utc>,
    ) -> Result<FlagOutcome, RepositoryError>;
    async fn list_transitions(&self, run_id: &RunId)
        -> Result<Vec<RunAuditEntry>, RepositoryError>;
}

#[async_trait]
pub trait SpendRepository: Send + Sync {
    async fn total(
        &self,
        subject: SpendSubject,
        period: SpendPeriod,
    ) -> Result<SpendTotal, RepositoryError>;

    /// Current tenant and credential totals around a run cost, for reads that
    /// do not record progress.
    async fn snapshot(
        &self,
        team_id: TeamId,
        credential_id: Option<CredentialId>,
        run_cost: Decimal,
        at: DateTime<Utc>,
    ) -> Result<SpendSnapshot, RepositoryError>;
}

#[async_trait]
pub trait RequestLogRepository: Send + Sync {
    /// Appends one row. A duplicate `request_id` is a `Conflict`.
    async fn insert(
        &self,
        entry: NewRequestLog,
        at: DateTime<Utc>,
    ) -> Result<RequestLog, RepositoryError>;
    async fn find_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<RequestLog>, RepositoryError>;
    /// Sum of `cost_usd` and row count for a tenant in `[from, to)`.
    async fn cost_for_team_between(
        &self,
        team_id: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(Decimal, u64), RepositoryError>;
}
