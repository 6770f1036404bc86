use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use runwarden_core::alerts::{AlertEvent, AlertSink};
use runwarden_core::audit::{RunAuditEntry, RunChange};
use runwarden_core::domain::run::{AgentRun, RunFlag, RunId, RunStatus};
use runwarden_core::errors::{ApplicationError, DomainError};
use runwarden_core::lifecycle::{decide, RunCommand, TransitionDecision};
use runwarden_db::repositories::{FinishOutcome, FlagOutcome, RunRepository};

use crate::error::{not_found, persistence};
use crate::timeouts::Timers;

/// Result of a status or flag write: the run as stored afterwards and whether
/// this call was the one that changed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub run: AgentRun,
    pub changed: bool,
}

/// The only path that changes a run's status or flags. The alert for a change
/// is emitted here, after the write commits, and only by the caller whose
/// conditional update won.
#[derive(Clone)]
pub struct RunTransitions {
    runs: Arc<dyn RunRepository>,
    alerts: Arc<dyn AlertSink>,
    timers: Timers,
}

impl RunTransitions {
    pub fn new(runs: Arc<dyn RunRepository>, alerts: Arc<dyn AlertSink>, timers: Timers) -> Self {
        Self { runs, alerts, timers }
    }

    pub async fn finish(
        &self,
        run_id: &RunId,
        command: RunCommand,
        actor: &str,
        correlation_id: &str,
    ) -> Result<Applied, ApplicationError> {
        let change = RunChange::Status { from: RunStatus::Running, to: command.target() };
        let audit = RunAuditEntry::new(run_id.clone(), change, actor, correlation_id);
        let audit = match &command {
            RunCommand::Complete => audit,
            RunCommand::Fail { error } => audit.with_reason(error.as_str()),
            RunCommand::Kill { reason } => audit.with_reason(reason.to_string()),
        };

        let outcome =
            self.runs.finish(run_id, &command, audit, Utc::now()).await.map_err(persistence)?;
        match outcome {
            FinishOutcome::Applied(run) => {
                self.timers.disarm(run_id);
                info!(
                    event_name = "governance.run.finished",
                    run_id = %run_id,
                    team_id = %run.team_id,
                    status = run.status.as_str(),
                    reason = run.kill_reason.as_deref().unwrap_or(""),
                    actor,
                    correlation_id,
                    "run reached terminal status"
                );
                if let Some(event) = AlertEvent::for_terminal(&run) {
                    self.alerts.notify(event);
                }
                Ok(Applied { run, changed: true })
            }
            FinishOutcome::AlreadyTerminal(run) => match decide(run_id, run.status, &command)? {
                TransitionDecision::AlreadyTerminal { status } => {
                    debug!(
                        event_name = "governance.run.already_terminal",
                        run_id = %run_id,
                        status = status.as_str(),
                        actor,
                        correlation_id,
                        "terminal command ignored"
                    );
                    Ok(Applied { run, changed: false })
                }
                TransitionDecision::Apply { from, to } => Err(DomainError::InvariantViolation(
                    format!("run `{run_id}` refused {from:?} -> {to:?} while still running"),
                )
                .into()),
            },
            FinishOutcome::NotFound => Err(not_found("run", run_id)),
        }
    }

    /// Raises a flag on a running run. `event` builds the alert from the
    /// stored run and is called only when this call set the flag.
    pub async fn raise_flag(
        &self,
        run_id: &RunId,
        flag: RunFlag,
        actor: &str,
        correlation_id: &str,
        reason: Option<String>,
        event: impl FnOnce(&AgentRun) -> AlertEvent + Send,
    ) -> Result<Applied, ApplicationError> {
        match self.write_flag(run_id, flag, actor, correlation_id, reason, event).await? {
            FlagWrite::Applied(applied) => Ok(applied),
            FlagWrite::NotActive(run) => {
                Err(DomainError::RunNotActive { run_id: run_id.clone(), status: run.status }.into())
            }
        }
    }

    /// Like `raise_flag`, for annotations that follow already committed
    /// progress. A run that ended in between is returned unchanged.
    pub(crate) async fn annotate(
        &self,
        run_id: &RunId,
        flag: RunFlag,
        actor: &str,
        correlation_id: &str,
        reason: Option<String>,
        event: impl FnOnce(&AgentRun) -> AlertEvent + Send,
    ) -> Result<Applied, ApplicationError> {
        match self.write_flag(run_id, flag, actor, correlation_id, reason, event).await? {
            FlagWrite::Applied(applied) => Ok(applied),
            FlagWrite::NotActive(run) => {
                debug!(
                    event_name = "governance.run.annotation_skipped",
                    run_id = %run_id,
                    flag = flag.as_str(),
                    status = run.status.as_str(),
                    correlation_id,
                    "run ended before it could be flagged"
                );
                Ok(Applied { run, changed: false })
            }
        }
    }

    async fn write_flag(
        &self,
        run_id: &RunId,
        flag: RunFlag,
        actor: &str,
        correlation_id: &str,
        reason: Option<String>,
        event: impl FnOnce(&AgentRun) -> AlertEvent + Send,
    ) -> Result<FlagWrite, ApplicationError> {
        let mut audit =
            RunAuditEntry::new(run_id.clone(), RunChange::Flag { flag }, actor, correlation_id);
        if let Some(reason) = reason {
            audit = audit.with_reason(reason);
        }

        let outcome =
            self.runs.raise_flag(run_id, flag, audit, Utc::now()).await.map_err(persistence)?;
        match outcome {
            FlagOutcome::Raised(run) => {
                info!(
                    event_name = "governance.run.flagged",
                    run_id = %run_id,
                    flag = flag.as_str(),
                    actor,
                    correlation_id,
                    "run flag raised"
                );
                self.alerts.notify(event(&run));
                Ok(FlagWrite::Applied(Applied { run, changed: true }))
            }
            FlagOutcome::AlreadySet(run) => Ok(FlagWrite::Applied(Applied { run, changed: false })),
            FlagOutcome::NotActive(run) => Ok(FlagWrite::NotActive(run)),
            FlagOutcome::NotFound => Err(not_found("run", run_id)),
        }
    }
}

enum FlagWrite {
    Applied(Applied),
    NotActive(AgentRun),
}
