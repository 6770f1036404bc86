//! Runwarden core: the pure governance model.
//!
//! Everything here is free of I/O so the rules can be exercised without a
//! database or network:
//! - **Domain** (`domain`) - tenants, credentials, budget policies, agent runs, request logs
//! - **Budget** (`budget`) - policy resolution and the spend verdict
//! - **Lifecycle** (`lifecycle`) - the agent run state machine and kill reasons
//! - **Alerts** (`alerts`) - alert events and the sink seam the dispatcher implements
//! - **Config** (`config`) - layered configuration with secret redaction

pub mod alerts;
pub mod audit;
pub mod budget;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod money;
pub mod secrets;

pub use alerts::{AlertEvent, AlertKind, AlertSink, InMemoryAlertSink, NoopAlertSink};
pub use budget::{
    BudgetEvaluator, Evaluation, Governance, PolicyResolution, RemainingBudget, ResolvedPolicy,
    SpendScope, SpendSnapshot, Verdict,
};
pub use domain::credential::{Credential, CredentialId, NewCredential};
pub use domain::policy::{BudgetPolicy, NewBudgetPolicy, PolicyId};
pub use domain::request_log::{NewRequestLog, RequestLog, TelemetryRecord};
pub use domain::run::{AgentRun, NewAgentRun, RunFlag, RunId, RunProgress, RunStatus};
pub use domain::team::{NewTeam, Team, TeamId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::{KillOrigin, KillReason, RunCommand, TransitionDecision};
