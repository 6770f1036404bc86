use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use runwarden_core::alerts::AlertEvent;
use runwarden_core::audit::{RunAuditEntry, RunChange};
use runwarden_core::budget::Evaluation;
use runwarden_core::domain::run::{AgentRun, NewAgentRun, RunFlag, RunId, RunProgress};
use runwarden_core::domain::team::TeamId;
use runwarden_core::errors::{ApplicationError, DomainError};
use runwarden_core::lifecycle::{KillReason, RunCommand};
use runwarden_db::repositories::{ProgressOutcome, RunRepository};

use crate::credentials::CredentialRegistry;
use crate::error::{not_found, persistence};
use crate::guard::{BudgetGuard, BudgetReport};
use crate::kill_switch::KillSwitch;
use crate::locks::RunLocks;
use crate::policy_store::PolicyStore;
use crate::timeouts::TimeoutScheduler;
use crate::transitions::{Applied, RunTransitions};

pub const REGISTRY_ACTOR: &str = "run-registry";

/// Request to open a new run.
#[derive(Clone, Debug, Default)]
pub struct StartRun {
    pub team_id: TeamId,
    pub model: String,
    pub run_id: Option<String>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    /// Presented credential secret; verified and bound to the run.
    pub api_key: Option<SecretString>,
    pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub run: AgentRun,
    pub evaluation: Evaluation,
}

/// System of record for agent runs. All mutations for one run are serialized
/// through its lock.
#[derive(Clone)]
pub struct RunRegistry {
    policies: PolicyStore,
    credentials: CredentialRegistry,
    runs: Arc<dyn RunRepository>,
    guard: BudgetGuard,
    transitions: RunTransitions,
    kill_switch: KillSwitch,
    timeouts: TimeoutScheduler,
    locks: RunLocks,
}

impl RunRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: PolicyStore,
        credentials: CredentialRegistry,
        runs: Arc<dyn RunRepository>,
        guard: BudgetGuard,
        transitions: RunTransitions,
        kill_switch: KillSwitch,
        timeouts: TimeoutScheduler,
        locks: RunLocks,
    ) -> Self {
        Self { policies, credentials, runs, guard, transitions, kill_switch, timeouts, locks }
    }

    pub async fn start(
        &self,
        request: StartRun,
        correlation_id: &str,
    ) -> Result<AgentRun, ApplicationError> {
        let team = self.policies.active_team(request.team_id).await?;

        let model = request.model.trim().to_owned();
        if model.is_empty() {
            return Err(DomainError::InvariantViolation("model is required".to_owned()).into());
        }

        let credential = match &request.api_key {
            Some(secret) => {
                let credential = self.credentials.verify(secret.expose_secret()).await?;
                if credential.team_id != team.id {
                    return Err(DomainError::InvalidCredential.into());
                }
                if !credential.allows_model(&model) {
                    return Err(DomainError::ModelNotAllowed(model).into());
                }
                Some(credential)
            }
            None => None,
        };

        let run_id = match request.run_id.as_deref() {
            Some(raw) => RunId::parse(raw)?,
            None => RunId::generate(),
        };
        let new_run = NewAgentRun {
            run_id: Some(run_id.clone()),
            team_id: team.id,
            credential_id: credential.as_ref().map(|credential| credential.id),
            agent_id: request.agent_id,
            agent_name: request.agent_name,
            model: Some(model),
            metadata: request.metadata,
        };
        let audit =
            RunAuditEntry::new(run_id.clone(), RunChange::Started, REGISTRY_ACTOR, correlation_id);
        let run = self
            .runs
            .insert(run_id.clone(), new_run, audit, Utc::now())
            .await
            .map_err(persistence)?;

        self.timeouts.arm(&run.run_id, run.started_at + team.run_timeout());
        info!(
            event_name = "governance.run.started",
            run_id = %run.run_id,
            team_id = %run.team_id,
            credential_id = ?run.credential_id.map(|id| id.0),
            model = run.model.as_deref().unwrap_or(""),
            correlation_id,
            "run started"
        );
        Ok(run)
    }

    /// Adds a progress delta, evaluates the budget against the totals written
    /// in the same transaction, and enforces the result.
    pub async fn record_progress(
        &self,
        run_id: &RunId,
        progress: RunProgress,
        correlation_id: &str,
    ) -> Result<ProgressReport, ApplicationError> {
        progress.validate()?;
        let _guard = self.locks.acquire(run_id).await;

        let outcome = self
            .runs
            .record_progress(run_id, progress, Utc::now())
            .await
            .map_err(persistence)?;
        let (run, spend) = match outcome {
            ProgressOutcome::Applied { run, spend } => (run, spend),
            ProgressOutcome::NotActive(status) => {
                return Err(DomainError::RunNotActive { run_id: run_id.clone(), status }.into())
            }
            ProgressOutcome::NotFound => return Err(not_found("run", run_id)),
        };

        let context = self.guard.context(&run).await?;
        let evaluation = self.guard.evaluate(&run, &context, &spend);

        let mut current = run;
        if let Some(updated) = self.kill_switch.enforce(&current, &evaluation, correlation_id).await? {
            current = updated;
        }
        if let Some(updated) = self
            .kill_switch
            .enforce_step_limit(&current, context.max_steps(), correlation_id)
            .await?
        {
            current = updated;
        }

        Ok(ProgressReport { run: current, evaluation })
    }

    /// Re-evaluates a running run against current spend and enforces the
    /// verdict without recording any new progress.
    pub async fn auto_kill_if_needed(
        &self,
        run_id: &RunId,
        correlation_id: &str,
    ) -> Result<ProgressReport, ApplicationError> {
        let _guard = self.locks.acquire(run_id).await;
        let run = self.find(run_id).await?;
        if !run.is_running() {
            return Err(DomainError::RunNotActive { run_id: run_id.clone(), status: run.status }.into());
        }

        let report = self.guard.report(&run, Utc::now()).await?;
        let current = self
            .kill_switch
            .enforce(&run, &report.evaluation, correlation_id)
            .await?
            .unwrap_or(run);
        Ok(ProgressReport { run: current, evaluation: report.evaluation })
    }

    pub async fn complete(
        &self,
        run_id: &RunId,
        actor: &str,
        correlation_id: &str,
    ) -> Result<AgentRun, ApplicationError> {
        let _guard = self.locks.acquire(run_id).await;
        let applied =
            self.transitions.finish(run_id, RunCommand::Complete, actor, correlation_id).await?;
        Ok(applied.run)
    }

    pub async fn fail(
        &self,
        run_id: &RunId,
        error: &str,
        actor: &str,
        correlation_id: &str,
    ) -> Result<AgentRun, ApplicationError> {
        let error = error.trim();
        let error = if error.is_empty() { "Unknown error" } else { error };
        let _guard = self.locks.acquire(run_id).await;
        let command = RunCommand::Fail { error: error.to_owned() };
        let applied = self.transitions.finish(run_id, command, actor, correlation_id).await?;
        Ok(applied.run)
    }

    /// Idempotent: killing a terminal run returns it unchanged.
    pub async fn kill(
        &self,
        run_id: &RunId,
        reason: KillReason,
        actor: &str,
        correlation_id: &str,
    ) -> Result<Applied, ApplicationError> {
        self.kill_switch.kill(run_id, reason, actor, correlation_id).await
    }

    /// Raises an annotation flag on a running run. Raising a flag that is
    /// already set is a no-op.
    pub async fn raise_flag(
        &self,
        run_id: &RunId,
        flag: RunFlag,
        actor: &str,
        correlation_id: &str,
    ) -> Result<Applied, ApplicationError> {
        let _guard = self.locks.acquire(run_id).await;
        self.transitions
            .raise_flag(run_id, flag, actor, correlation_id, None, |run| match flag {
                RunFlag::LoopDetected => AlertEvent::loop_detected(run),
                RunFlag::BudgetExceeded => {
                    AlertEvent::budget_exceeded(run, run.total_cost, metadata_budget(run))
                }
            })
            .await
    }

    pub async fn find(&self, run_id: &RunId) -> Result<AgentRun, ApplicationError> {
        self.runs
            .find_by_run_id(run_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| not_found("run", run_id))
    }

    pub async fn budget(&self, run_id: &RunId) -> Result<BudgetReport, ApplicationError> {
        let run = self.find(run_id).await?;
        self.guard.report(&run, Utc::now()).await
    }

    pub async fn transitions(&self, run_id: &RunId) -> Result<Vec<RunAuditEntry>, ApplicationError> {
        self.runs.list_transitions(run_id).await.map_err(persistence)
    }

    pub async fn list_running(&self) -> Result<Vec<AgentRun>, ApplicationError> {
        self.runs.list_running().await.map_err(persistence)
    }
}

/// A `budget` amount carried in run metadata, as a number or string.
fn metadata_budget(run: &AgentRun) -> Option<Decimal> {
    match run.metadata.get("budget")? {
        Value::String(raw) => raw.trim().parse().ok(),
        Value::Number(number) => number.to_string().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use secrecy::{ExposeSecret, SecretString};
    use serde_json::json;

    use runwarden_core::alerts::{AlertEvent, AlertKind};
    use runwarden_core::audit::RunChange;
    use runwarden_core::budget::{Governance, Verdict};
    use runwarden_core::domain::credential::NewCredential;
    use runwarden_core::domain::policy::NewBudgetPolicy;
    use runwarden_core::domain::run::{RunFlag, RunId, RunProgress, RunStatus};
    use runwarden_core::domain::team::{NewTeam, Team};
    use runwarden_core::errors::{ApplicationError, DomainError};
    use runwarden_core::lifecycle::KillReason;

    use super::StartRun;
    use crate::testing::{file_governor, governor};
    use crate::Governor;

    fn dollars(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    fn spend(cost: Decimal) -> RunProgress {
        RunProgress::single_call(100, cost, 250)
    }

    async fn team(governor: &Governor, slug: &str) -> Team {
        governor.policies.create_team(NewTeam::new(slug, slug)).await.expect("team")
    }

    async fn start(governor: &Governor, team: &Team, run_id: &str) -> RunId {
        governor
            .runs
            .start(
                StartRun {
                    team_id: team.id,
                    model: "gpt-4o-mini".to_owned(),
                    run_id: Some(run_id.to_owned()),
                    ..StartRun::default()
                },
                "corr-start",
            )
            .await
            .expect("start")
            .run_id
    }

    async fn daily_policy(governor: &Governor, team: &Team, auto_kill: bool) {
        let mut policy = NewBudgetPolicy::new(team.id, "daily");
        policy.daily_limit = Some(dollars(10));
        policy.alert_threshold = Some(dollars(5));
        policy.auto_kill_enabled = auto_kill;
        governor.policies.create_policy(policy).await.expect("policy");
    }

    #[tokio::test]
    async fn daily_limit_scenario_alerts_then_kills_once() {
        let (governor, alerts) = governor().await;
        let team = team(&governor, "platform").await;
        daily_policy(&governor, &team, true).await;
        let run_id = start(&governor, &team, "run_scenario").await;

        let first = governor.runs.record_progress(&run_id, spend(dollars(4)), "c1").await.expect("first");
        assert_eq!(first.evaluation.verdict, Verdict::Ok);

        let second =
            governor.runs.record_progress(&run_id, spend(dollars(4)), "c2").await.expect("second");
        assert_eq!(second.evaluation.verdict, Verdict::Alert);
        assert_eq!(second.run.status, RunStatus::Running);

        let third = governor.runs.record_progress(&run_id, spend(dollars(4)), "c3").await.expect("third");
        assert_eq!(third.evaluation.verdict, Verdict::ExceededDaily);
        assert_eq!(third.run.status, RunStatus::Killed);
        assert_eq!(third.run.kill_reason.as_deref(), Some("policy:EXCEEDED_DAILY"));
        assert!(third.run.ended_at.is_some());
        assert!(third.run.budget_exceeded);

        assert_eq!(alerts.count_of(AlertKind::RunKilled), 1);
        assert_eq!(alerts.count_of(AlertKind::BudgetExceeded), 1);
        assert!(alerts.events().contains(&AlertEvent::RunKilled {
            run_id: run_id.clone(),
            reason: "policy:EXCEEDED_DAILY".to_owned(),
            total_cost: dollars(12),
        }));

        let error = governor
            .runs
            .record_progress(&run_id, spend(dollars(1)), "c4")
            .await
            .expect_err("terminal");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::RunNotActive { status: RunStatus::Killed, .. })
        ));
        let stored = governor.runs.find(&run_id).await.expect("find");
        assert_eq!(stored.total_cost, dollars(12));
        assert_eq!(stored.step_count, 3);
    }

    #[tokio::test]
    async fn exceeded_without_auto_kill_only_flags_the_run() {
        let (governor, alerts) = governor().await;
        let team = team(&governor, "platform").await;
        daily_policy(&governor, &team, false).await;
        let run_id = start(&governor, &team, "run_flag_only").await;

        let report =
            governor.runs.record_progress(&run_id, spend(dollars(11)), "c1").await.expect("progress");
        assert_eq!(report.evaluation.verdict, Verdict::ExceededDaily);
        assert_eq!(report.run.status, RunStatus::Running);
        assert!(report.run.budget_exceeded);

        governor.runs.record_progress(&run_id, spend(dollars(1)), "c2").await.expect("progress");
        assert_eq!(alerts.count_of(AlertKind::BudgetExceeded), 1);
        assert_eq!(alerts.count_of(AlertKind::RunKilled), 0);
    }

    #[tokio::test]
    async fn next_run_over_the_daily_total_is_exceeded() {
        let (governor, _alerts) = governor().await;
        let team = team(&governor, "platform").await;
        daily_policy(&governor, &team, true).await;

        for index in 0..5 {
            let run_id = start(&governor, &team, &format!("run_{index}")).await;
            let report =
                governor.runs.record_progress(&run_id, spend(dollars(2)), "c").await.expect("spend");
            assert!(!report.evaluation.verdict.is_exceeded());
            governor.runs.complete(&run_id, "agent", "c").await.expect("complete");
        }

        let run_id = start(&governor, &team, "run_over").await;
        let report = governor
            .runs
            .record_progress(&run_id, spend(Decimal::new(1, 2)), "c")
            .await
            .expect("spend");
        assert_eq!(report.evaluation.verdict, Verdict::ExceededDaily);
        assert_eq!(report.run.status, RunStatus::Killed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_cannot_slip_past_the_daily_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (governor, _alerts) = file_governor(&dir).await;
        let team = team(&governor, "platform").await;
        daily_policy(&governor, &team, true).await;

        let mut run_ids = Vec::new();
        for index in 0..6 {
            run_ids.push(start(&governor, &team, &format!("run_par_{index}")).await);
        }

        let governor = Arc::new(governor);
        let mut tasks = Vec::new();
        for run_id in run_ids {
            let governor = governor.clone();
            tasks.push(tokio::spawn(async move {
                governor.runs.record_progress(&run_id, spend(dollars(2)), "c").await
            }));
        }

        let mut exceeded = 0;
        for task in tasks {
            let report = task.await.expect("join").expect("progress");
            if report.evaluation.verdict == Verdict::ExceededDaily {
                exceeded += 1;
            }
        }
        // $12 against a $10 limit: exactly the call that crossed $10 sees it.
        assert_eq!(exceeded, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_kills_yield_one_terminal_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (governor, alerts) = file_governor(&dir).await;
        let team = team(&governor, "platform").await;
        let run_id = start(&governor, &team, "run_race").await;

        let governor = Arc::new(governor);
        let mut tasks = Vec::new();
        let reasons = [
            KillReason::dashboard("operator").expect("reason"),
            KillReason::policy("EXCEEDED_DAILY").expect("reason"),
        ];
        for (index, reason) in reasons.into_iter().enumerate() {
            let (governor, run_id) = (governor.clone(), run_id.clone());
            tasks.push(tokio::spawn(async move {
                governor.runs.kill(&run_id, reason, &format!("actor-{index}"), "c").await
            }));
        }

        let mut changed = 0;
        let mut reasons = Vec::new();
        for task in tasks {
            let applied = task.await.expect("join").expect("kill never errors");
            changed += usize::from(applied.changed);
            reasons.push(applied.run.kill_reason.clone());
        }

        assert_eq!(changed, 1);
        assert_eq!(reasons[0], reasons[1]);
        assert_eq!(alerts.count_of(AlertKind::RunKilled), 1);
        let stored = governor.runs.find(&run_id).await.expect("find");
        assert_eq!(stored.status, RunStatus::Killed);
        stored.check_invariants().expect("invariants");
    }

    #[tokio::test]
    async fn unconfigured_team_is_ok_but_marked_ungoverned() {
        let (governor, alerts) = governor().await;
        let team = team(&governor, "wild").await;
        let run_id = start(&governor, &team, "run_free").await;

        let report =
            governor.runs.record_progress(&run_id, spend(dollars(1_000)), "c").await.expect("spend");
        assert_eq!(report.evaluation.verdict, Verdict::Ok);
        assert_eq!(report.evaluation.governance, Governance::Unconfigured);
        assert!(alerts.events().is_empty());
    }

    #[tokio::test]
    async fn start_rejects_inactive_tenant_before_writing() {
        let (governor, _alerts) = governor().await;
        let team = team(&governor, "gone").await;
        governor.policies.deactivate_team(team.id).await.expect("deactivate");

        let error = governor
            .runs
            .start(
                StartRun {
                    team_id: team.id,
                    model: "gpt-4o".to_owned(),
                    run_id: Some("run_refused".to_owned()),
                    ..StartRun::default()
                },
                "c",
            )
            .await
            .expect_err("inactive");
        assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidTenant(_))));
        assert!(governor.runs.find(&RunId("run_refused".to_owned())).await.is_err());
    }

    #[tokio::test]
    async fn credential_allow_list_and_tenant_are_enforced_at_start() {
        let (governor, _alerts) = governor().await;
        let home = team(&governor, "platform").await;
        let other = team(&governor, "other").await;
        let issued = governor
            .credentials
            .issue(NewCredential {
                team_id: home.id,
                name: "ci".into(),
                allowed_models: vec!["gpt-4o-mini".to_owned()],
                ..NewCredential::default()
            })
            .await
            .expect("issue");
        let secret = || Some(SecretString::from(issued.secret.expose_secret().to_owned()));

        let refused = governor
            .runs
            .start(
                StartRun { team_id: home.id, model: "gpt-4o".into(), api_key: secret(), ..StartRun::default() },
                "c",
            )
            .await
            .expect_err("model");
        assert!(matches!(refused, ApplicationError::Domain(DomainError::ModelNotAllowed(_))));

        let cross_tenant = governor
            .runs
            .start(
                StartRun { team_id: other.id, model: "gpt-4o-mini".into(), api_key: secret(), ..StartRun::default() },
                "c",
            )
            .await
            .expect_err("tenant");
        assert!(matches!(cross_tenant, ApplicationError::Domain(DomainError::InvalidCredential)));

        let run = governor
            .runs
            .start(
                StartRun { team_id: home.id, model: "gpt-4o-mini".into(), api_key: secret(), ..StartRun::default() },
                "c",
            )
            .await
            .expect("allowed");
        assert_eq!(run.credential_id, Some(issued.credential.id));
    }

    #[tokio::test]
    async fn credential_budget_override_is_measured_on_the_key() {
        let (governor, _alerts) = governor().await;
        let team = team(&governor, "platform").await;
        daily_policy(&governor, &team, true).await;
        let issued = governor
            .credentials
            .issue(NewCredential {
                team_id: team.id,
                name: "tight".into(),
                daily_budget: Some(dollars(3)),
                ..NewCredential::default()
            })
            .await
            .expect("issue");

        let run = governor
            .runs
            .start(
                StartRun {
                    team_id: team.id,
                    model: "gpt-4o-mini".into(),
                    api_key: Some(SecretString::from(issued.secret.expose_secret().to_owned())),
                    ..StartRun::default()
                },
                "c",
            )
            .await
            .expect("start");

        let report =
            governor.runs.record_progress(&run.run_id, spend(dollars(4)), "c").await.expect("spend");
        assert_eq!(report.evaluation.verdict, Verdict::ExceededDaily);
        assert_eq!(report.evaluation.limit, Some(dollars(3)));
        assert_eq!(report.run.status, RunStatus::Killed);

        assert!(!governor
            .credentials
            .is_valid(&issued.credential, Utc::now())
            .await
            .expect("validity"));
    }

    #[tokio::test]
    async fn step_limit_kills_even_without_auto_kill() {
        let (governor, alerts) = governor().await;
        let mut new_team = NewTeam::new("steps", "steps");
        new_team.max_steps_per_run = 2;
        let team = governor.policies.create_team(new_team).await.expect("team");
        let run_id = start(&governor, &team, "run_steps").await;

        for _ in 0..2 {
            let report = governor
                .runs
                .record_progress(&run_id, spend(Decimal::ZERO), "c")
                .await
                .expect("step");
            assert_eq!(report.run.status, RunStatus::Running);
        }
        let report =
            governor.runs.record_progress(&run_id, spend(Decimal::ZERO), "c").await.expect("step");
        assert_eq!(report.run.status, RunStatus::Killed);
        assert_eq!(report.run.kill_reason.as_deref(), Some("policy:STEP_LIMIT_EXCEEDED"));
        assert_eq!(alerts.count_of(AlertKind::RunKilled), 1);
    }

    #[tokio::test]
    async fn complete_and_fail_emit_one_alert_and_refuse_repeats() {
        let (governor, alerts) = governor().await;
        let team = team(&governor, "platform").await;
        let done = start(&governor, &team, "run_done").await;
        let broken = start(&governor, &team, "run_broken").await;

        governor.runs.record_progress(&done, spend(dollars(1)), "c").await.expect("spend");
        let completed = governor.runs.complete(&done, "agent", "c").await.expect("complete");
        assert_eq!(completed.status, RunStatus::Completed);

        let failed =
            governor.runs.fail(&broken, "provider timeout", "agent", "c").await.expect("fail");
        assert_eq!(failed.error_message(), Some("provider timeout"));

        let again = governor.runs.complete(&done, "agent", "c").await.expect_err("terminal");
        assert!(matches!(again, ApplicationError::Domain(DomainError::RunNotActive { .. })));

        let killed = governor
            .runs
            .kill(&done, KillReason::dashboard("late").expect("reason"), "operator", "c")
            .await
            .expect("idempotent kill");
        assert!(!killed.changed);
        assert_eq!(killed.run.status, RunStatus::Completed);

        assert_eq!(alerts.count_of(AlertKind::RunCompleted), 1);
        assert_eq!(alerts.count_of(AlertKind::RunFailed), 1);
        assert_eq!(alerts.count_of(AlertKind::RunKilled), 0);
    }

    #[tokio::test]
    async fn flags_alert_once_and_are_audited() {
        let (governor, alerts) = governor().await;
        let team = team(&governor, "platform").await;
        let run_id = start(&governor, &team, "run_loop").await;

        let first = governor
            .runs
            .raise_flag(&run_id, RunFlag::LoopDetected, "loop-detector", "c")
            .await
            .expect("flag");
        let second = governor
            .runs
            .raise_flag(&run_id, RunFlag::LoopDetected, "loop-detector", "c")
            .await
            .expect("flag again");
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(alerts.count_of(AlertKind::LoopDetected), 1);

        let trail = governor.runs.transitions(&run_id).await.expect("trail");
        let kinds: Vec<&str> = trail.iter().map(|entry| entry.change.kind()).collect();
        assert_eq!(kinds, vec!["started", "flag"]);
        assert_eq!(trail[1].change, RunChange::Flag { flag: RunFlag::LoopDetected });
    }

    #[tokio::test]
    async fn manual_budget_flag_reads_budget_from_metadata() {
        let (governor, alerts) = governor().await;
        let team = team(&governor, "platform").await;
        let mut metadata = serde_json::Map::new();
        metadata.insert("budget".to_owned(), json!("7.50"));
        let run = governor
            .runs
            .start(
                StartRun {
                    team_id: team.id,
                    model: "gpt-4o".into(),
                    metadata,
                    ..StartRun::default()
                },
                "c",
            )
            .await
            .expect("start");

        governor
            .runs
            .raise_flag(&run.run_id, RunFlag::BudgetExceeded, "dashboard", "c")
            .await
            .expect("flag");
        assert_eq!(
            alerts.events(),
            vec![AlertEvent::BudgetExceeded {
                run_id: run.run_id.clone(),
                spent: Decimal::ZERO,
                budget: Some(Decimal::new(750, 2)),
            }]
        );
    }

    #[tokio::test]
    async fn budget_report_lists_remaining_amounts() {
        let (governor, _alerts) = governor().await;
        let team = team(&governor, "platform").await;
        let mut policy = NewBudgetPolicy::new(team.id, "limits");
        policy.per_run_limit = Some(dollars(5));
        policy.daily_limit = Some(dollars(10));
        policy.monthly_limit = Some(dollars(100));
        governor.policies.create_policy(policy).await.expect("policy");
        let run_id = start(&governor, &team, "run_budget").await;

        governor.runs.record_progress(&run_id, spend(dollars(3)), "c").await.expect("spend");
        let report = governor.runs.budget(&run_id).await.expect("budget");

        assert_eq!(report.evaluation.verdict, Verdict::Ok);
        assert_eq!(report.remaining.per_run, Some(dollars(2)));
        assert_eq!(report.remaining.daily, Some(dollars(7)));
        assert_eq!(report.remaining.monthly, Some(dollars(97)));
    }

    #[tokio::test]
    async fn auto_kill_if_needed_applies_a_tightened_policy() {
        let (governor, alerts) = governor().await;
        let team = team(&governor, "platform").await;
        let run_id = start(&governor, &team, "run_tighten").await;
        governor.runs.record_progress(&run_id, spend(dollars(6)), "c").await.expect("spend");

        let mut policy = NewBudgetPolicy::new(team.id, "per-run");
        policy.per_run_limit = Some(dollars(5));
        governor.policies.create_policy(policy).await.expect("policy");

        let report = governor.runs.auto_kill_if_needed(&run_id, "c").await.expect("enforce");
        assert_eq!(report.evaluation.verdict, Verdict::ExceededPerRun);
        assert_eq!(report.run.kill_reason.as_deref(), Some("policy:EXCEEDED_PER_RUN"));
        assert_eq!(alerts.count_of(AlertKind::RunKilled), 1);
    }

    /// Runs whose status changes between the progress commit and the budget
    /// annotation that follows it.
    mod ended_after_progress {
        use std::sync::Arc;

        use async_trait::async_trait;
        use chrono::{DateTime, Utc};

        use runwarden_core::alerts::{AlertKind, InMemoryAlertSink};
        use runwarden_core::audit::{RunAuditEntry, RunChange};
        use runwarden_core::domain::policy::NewBudgetPolicy;
        use runwarden_core::domain::run::{
            AgentRun, NewAgentRun, RunFlag, RunId, RunProgress, RunStatus,
        };
        use runwarden_core::domain::team::NewTeam;
        use runwarden_core::lifecycle::{KillReason, RunCommand};
        use runwarden_db::repositories::{
            FinishOutcome, FlagOutcome, ProgressOutcome, RepositoryError, RunRepository,
        };

        use super::{dollars, spend};
        use crate::registry::StartRun;
        use crate::testing::{memory_stores, settings};
        use crate::Governor;

        /// Lets an operator kill land right after each progress commit.
        struct OperatorKillsAfterProgress {
            inner: Arc<dyn RunRepository>,
        }

        #[async_trait]
        impl RunRepository for OperatorKillsAfterProgress {
            async fn insert(
                &self,
                run_id: RunId,
                run: NewAgentRun,
                audit: RunAuditEntry,
                at: DateTime<Utc>,
            ) -> Result<AgentRun, RepositoryError> {
                self.inner.insert(run_id, run, audit, at).await
            }

            async fn find_by_run_id(
                &self,
                run_id: &RunId,
            ) -> Result<Option<AgentRun>, RepositoryError> {
                self.inner.find_by_run_id(run_id).await
            }

            async fn list_running(&self) -> Result<Vec<AgentRun>, RepositoryError> {
                self.inner.list_running().await
            }

            async fn record_progress(
                &self,
                run_id: &RunId,
                progress: RunProgress,
                at: DateTime<Utc>,
            ) -> Result<ProgressOutcome, RepositoryError> {
                let outcome = self.inner.record_progress(run_id, progress, at).await?;
                if matches!(outcome, ProgressOutcome::Applied { .. }) {
                    let reason = KillReason::dashboard("operator stop").expect("reason");
                    let change = RunChange::Status { from: RunStatus::Running, to: RunStatus::Killed };
                    let audit = RunAuditEntry::new(run_id.clone(), change, "operator", "c")
                        .with_reason(reason.to_string());
                    self.inner.finish(run_id, &RunCommand::Kill { reason }, audit, Utc::now()).await?;
                }
                Ok(outcome)
            }

            async fn finish(
                &self,
                run_id: &RunId,
                command: &RunCommand,
                audit: RunAuditEntry,
                at: DateTime<Utc>,
            ) -> Result<FinishOutcome, RepositoryError> {
                self.inner.finish(run_id, command, audit, at).await
            }

            async fn raise_flag(
                &self,
                run_id: &RunId,
                flag: RunFlag,
                audit: RunAuditEntry,
                at: DateTime<Utc>,
            ) -> Result<FlagOutcome, RepositoryError> {
                self.inner.raise_flag(run_id, flag, audit, at).await
            }

            async fn list_transitions(
                &self,
                run_id: &RunId,
            ) -> Result<Vec<RunAuditEntry>, RepositoryError> {
                self.inner.list_transitions(run_id).await
            }
        }

        async fn governor() -> (Governor, InMemoryAlertSink) {
            let mut stores = memory_stores().await;
            stores.runs = Arc::new(OperatorKillsAfterProgress { inner: stores.runs.clone() });
            let alerts = InMemoryAlertSink::default();
            let governor = Governor::new(stores, Arc::new(alerts.clone()), &settings());
            (governor, alerts)
        }

        #[tokio::test]
        async fn committed_progress_is_reported_even_when_the_run_ends_before_enforcement() {
            let (governor, alerts) = governor().await;
            let team = governor
                .policies
                .create_team(NewTeam::new("Platform", "platform"))
                .await
                .expect("team");
            let mut policy = NewBudgetPolicy::new(team.id, "per-run");
            policy.per_run_limit = Some(dollars(2));
            governor.policies.create_policy(policy).await.expect("policy");
            let run = governor
                .runs
                .start(
                    StartRun { team_id: team.id, model: "gpt-4o".into(), ..StartRun::default() },
                    "c",
                )
                .await
                .expect("start");

            let report = governor
                .runs
                .record_progress(&run.run_id, spend(dollars(5)), "c")
                .await
                .expect("committed progress is not reported as rejected");

            assert_eq!(report.run.status, RunStatus::Killed);
            assert_eq!(report.run.kill_reason.as_deref(), Some("dashboard:operator stop"));
            assert_eq!(report.run.total_cost, dollars(5));
            assert_eq!(report.run.step_count, 1);
            assert!(!report.run.budget_exceeded);
            assert_eq!(alerts.count_of(AlertKind::BudgetExceeded), 0);
            assert_eq!(alerts.count_of(AlertKind::RunKilled), 0);

            let stored = governor.runs.find(&run.run_id).await.expect("find");
            assert_eq!(stored, report.run);
        }
    }
}
