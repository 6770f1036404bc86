use tracing::{info, warn};

use runwarden_core::alerts::AlertEvent;
use runwarden_core::budget::Evaluation;
use runwarden_core::domain::run::{AgentRun, RunFlag, RunId};
use runwarden_core::errors::ApplicationError;
use runwarden_core::lifecycle::{KillReason, RunCommand};

use crate::locks::RunLocks;
use crate::transitions::{Applied, RunTransitions};

pub const POLICY_ACTOR: &str = "kill-switch";
pub const STEP_LIMIT_DETAIL: &str = "STEP_LIMIT_EXCEEDED";

/// Forces runs into `killed`. Every kill is idempotent: a run that is already
/// terminal is returned as it is, without error, whoever got there first.
#[derive(Clone)]
pub struct KillSwitch {
    transitions: RunTransitions,
    locks: RunLocks,
}

impl KillSwitch {
    pub fn new(transitions: RunTransitions, locks: RunLocks) -> Self {
        Self { transitions, locks }
    }

    pub async fn kill(
        &self,
        run_id: &RunId,
        reason: KillReason,
        actor: &str,
        correlation_id: &str,
    ) -> Result<Applied, ApplicationError> {
        let _guard = self.locks.acquire(run_id).await;
        self.kill_locked(run_id, reason, actor, correlation_id).await
    }

    /// Same as `kill` for callers that already hold the run's lock.
    pub(crate) async fn kill_locked(
        &self,
        run_id: &RunId,
        reason: KillReason,
        actor: &str,
        correlation_id: &str,
    ) -> Result<Applied, ApplicationError> {
        let origin = reason.origin().prefix();
        let applied = self
            .transitions
            .finish(run_id, RunCommand::Kill { reason }, actor, correlation_id)
            .await?;
        if applied.changed {
            info!(
                event_name = "governance.run.killed",
                run_id = %run_id,
                origin,
                actor,
                correlation_id,
                "run killed"
            );
        }
        Ok(applied)
    }

    /// Applies an exceeded verdict to a running run: the budget flag is always
    /// raised; the run is killed only when the resolved policy auto-kills.
    /// Returns the run as it stands afterwards, or `None` when the verdict
    /// required nothing. A run ended by someone else after the progress
    /// committed is returned as stored. Callers must hold the run's lock.
    pub(crate) async fn enforce(
        &self,
        run: &AgentRun,
        evaluation: &Evaluation,
        correlation_id: &str,
    ) -> Result<Option<AgentRun>, ApplicationError> {
        if !evaluation.verdict.is_exceeded() {
            return Ok(None);
        }

        let verdict = evaluation.verdict.as_str();
        let (spent, limit) = (evaluation.spent, evaluation.limit);
        let flagged = self
            .transitions
            .annotate(
                &run.run_id,
                RunFlag::BudgetExceeded,
                POLICY_ACTOR,
                correlation_id,
                Some(verdict.to_owned()),
                |run| AlertEvent::budget_exceeded(run, spent, limit),
            )
            .await?;
        if !flagged.run.is_running() {
            return Ok(Some(flagged.run));
        }

        if !evaluation.should_kill() {
            warn!(
                event_name = "governance.budget.exceeded_without_kill",
                run_id = %run.run_id,
                verdict,
                "budget exceeded; auto-kill disabled, run continues"
            );
            return Ok(Some(flagged.run));
        }

        let reason = KillReason::policy(verdict)?;
        let killed = self.kill_locked(&run.run_id, reason, POLICY_ACTOR, correlation_id).await?;
        Ok(Some(killed.run))
    }

    /// Kills a run that has gone past its step allowance.
    pub(crate) async fn enforce_step_limit(
        &self,
        run: &AgentRun,
        max_steps: u32,
        correlation_id: &str,
    ) -> Result<Option<AgentRun>, ApplicationError> {
        if !run.is_running() || run.step_count <= max_steps {
            return Ok(None);
        }
        warn!(
            event_name = "governance.run.step_limit",
            run_id = %run.run_id,
            step_count = run.step_count,
            max_steps,
            "run exceeded its step limit"
        );
        let reason = KillReason::policy(STEP_LIMIT_DETAIL)?;
        let killed = self.kill_locked(&run.run_id, reason, POLICY_ACTOR, correlation_id).await?;
        Ok(Some(killed.run))
    }
}
