//! Agent run persistence.
//!
//! Every mutation is a single conditional `UPDATE ... WHERE status = 'running'`
//! so concurrent writers cannot overwrite a terminal run. Progress updates and
//! their spend accumulators commit together; status and flag changes commit
//! together with their audit entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use runwarden_core::audit::{RunAuditEntry, RunChange};
use runwarden_core::budget::SpendSnapshot;
use runwarden_core::domain::credential::CredentialId;
use runwarden_core::domain::run::{AgentRun, NewAgentRun, RunFlag, RunId, RunProgress, RunStatus};
use runwarden_core::domain::team::TeamId;
use runwarden_core::lifecycle::RunCommand;

use super::codec::{
    decode_money, encode_i64, encode_money, format_timestamp, is_unique_violation,
    parse_optional_timestamp, parse_timestamp, parse_u32, parse_u64,
};
use super::spend::{accumulate, SpendPeriod, SpendSubject};
use super::{FinishOutcome, FlagOutcome, ProgressOutcome, RepositoryError, RunRepository};
use crate::DbPool;

const RUN_COLUMNS: &str = "id, run_id, team_id, api_key_id, agent_id, agent_name, model,
    step_count, total_tokens, total_cost_micros, total_latency_ms, status, kill_reason,
    loop_detected, budget_exceeded, started_at, ended_at, metadata_json, updated_at";

pub struct SqlRunRepository {
    pool: DbPool,
}

impl SqlRunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for SqlRunRepository {
    async fn insert(
        &self,
        run_id: RunId,
        run: NewAgentRun,
        audit: RunAuditEntry,
        at: DateTime<Utc>,
    ) -> Result<AgentRun, RepositoryError> {
        let metadata = serde_json::to_string(&run.metadata)
            .map_err(|error| RepositoryError::Encode(format!("metadata: {error}")))?;
        let stamp = format_timestamp(at);

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO agent_run (
                run_id,
                team_id,
                api_key_id,
                agent_id,
                agent_name,
                model,
                status,
                started_at,
                ended_at,
                metadata_json,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, 'running', ?, NULL, ?, ?, ?)
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id.as_str())
        .bind(run.team_id.0)
        .bind(run.credential_id.map(|id| id.0))
        .bind(run.agent_id.as_deref())
        .bind(run.agent_name.as_deref())
        .bind(run.model.as_deref())
        .bind(&stamp)
        .bind(metadata)
        .bind(&stamp)
        .bind(&stamp)
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                RepositoryError::Conflict(format!("run `{run_id}` already exists"))
            } else {
                RepositoryError::Database(error)
            }
        })?;
        let stored = run_from_row(&row)?;

        insert_audit(&mut tx, &audit).await?;
        tx.commit().await?;

        Ok(stored)
    }

    async fn find_by_run_id(&self, run_id: &RunId) -> Result<Option<AgentRun>, RepositoryError> {
        find_run(&self.pool, run_id).await
    }

    async fn list_running(&self) -> Result<Vec<AgentRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM agent_run WHERE status = 'running' ORDER BY started_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn record_progress(
        &self,
        run_id: &RunId,
        progress: RunProgress,
        at: DateTime<Utc>,
    ) -> Result<ProgressOutcome, RepositoryError> {
        let cost_micros = encode_money("cost", progress.cost)?;
        let tokens = encode_i64("tokens", progress.tokens)?;
        let latency_ms = encode_i64("latency_ms", progress.latency_ms)?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE agent_run
             SET step_count = step_count + ?,
                 total_tokens = total_tokens + ?,
                 total_cost_micros = total_cost_micros + ?,
                 total_latency_ms = total_latency_ms + ?,
                 updated_at = ?
             WHERE run_id = ? AND status = 'running'
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(i64::from(progress.steps))
        .bind(tokens)
        .bind(cost_micros)
        .bind(latency_ms)
        .bind(format_timestamp(at))
        .bind(run_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let status = find_status(&mut tx, run_id).await?;
            tx.rollback().await?;
            return Ok(match status {
                Some(status) => ProgressOutcome::NotActive(status),
                None => ProgressOutcome::NotFound,
            });
        };
        let run = run_from_row(&row)?;

        let team = SpendSubject::Team(run.team_id);
        let tenant_daily =
            accumulate(&mut tx, team, SpendPeriod::day_of(at), cost_micros, at).await?;
        let tenant_monthly =
            accumulate(&mut tx, team, SpendPeriod::month_of(at), cost_micros, at).await?;
        let credential_daily = match run.credential_id {
            Some(id) => {
                accumulate(
                    &mut tx,
                    SpendSubject::Credential(id),
                    SpendPeriod::day_of(at),
                    cost_micros,
                    at,
                )
                .await?
            }
            None => rust_decimal::Decimal::ZERO,
        };
        tx.commit().await?;

        let spend =
            SpendSnapshot { run_cost: run.total_cost, tenant_daily, tenant_monthly, credential_daily };
        Ok(ProgressOutcome::Applied { run, spend })
    }

    async fn finish(
        &self,
        run_id: &RunId,
        command: &RunCommand,
        audit: RunAuditEntry,
        at: DateTime<Utc>,
    ) -> Result<FinishOutcome, RepositoryError> {
        let stamp = format_timestamp(at);
        let (kill_reason, error) = match command {
            RunCommand::Complete => (None, None),
            RunCommand::Fail { error } => (None, Some(error.as_str())),
            RunCommand::Kill { reason } => (Some(reason.to_string()), None),
        };

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE agent_run
             SET status = ?,
                 kill_reason = ?,
                 ended_at = ?,
                 metadata_json = CASE
                     WHEN ? IS NULL THEN metadata_json
                     ELSE json_set(metadata_json, '$.error', ?)
                 END,
                 updated_at = ?
             WHERE run_id = ? AND status = 'running'
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(command.target().as_str())
        .bind(kill_reason)
        .bind(&stamp)
        .bind(error)
        .bind(error)
        .bind(&stamp)
        .bind(run_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(match find_run(&self.pool, run_id).await? {
                Some(run) => FinishOutcome::AlreadyTerminal(run),
                None => FinishOutcome::NotFound,
            });
        };
        let run = run_from_row(&row)?;

        insert_audit(&mut tx, &audit).await?;
        tx.commit().await?;

        Ok(FinishOutcome::Applied(run))
    }

    async fn raise_flag(
        &self,
        run_id: &RunId,
        flag: RunFlag,
        audit: RunAuditEntry,
        at: DateTime<Utc>,
    ) -> Result<FlagOutcome, RepositoryError> {
        let column = flag_column(flag);

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE agent_run
             SET {column} = 1, updated_at = ?
             WHERE run_id = ? AND status = 'running' AND {column} = 0
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(format_timestamp(at))
        .bind(run_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(match find_run(&self.pool, run_id).await? {
                Some(run) if !run.is_running() => FlagOutcome::NotActive(run),
                Some(run) => FlagOutcome::AlreadySet(run),
                None => FlagOutcome::NotFound,
            });
        };
        let run = run_from_row(&row)?;

        insert_audit(&mut tx, &audit).await?;
        tx.commit().await?;

        Ok(FlagOutcome::Raised(run))
    }

    async fn list_transitions(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<RunAuditEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                run_id,
                change_kind,
                from_status,
                to_status,
                flag,
                reason,
                actor,
                correlation_id,
                occurred_at
             FROM agent_run_transition
             WHERE run_id = ?
             ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }
}

fn flag_column(flag: RunFlag) -> &'static str {
    match flag {
        RunFlag::LoopDetected => "loop_detected",
        RunFlag::BudgetExceeded => "budget_exceeded",
    }
}

async fn find_run(pool: &DbPool, run_id: &RunId) -> Result<Option<AgentRun>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM agent_run WHERE run_id = ?"))
        .bind(run_id.as_str())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(run_from_row).transpose()
}

async fn find_status(
    conn: &mut SqliteConnection,
    run_id: &RunId,
) -> Result<Option<RunStatus>, RepositoryError> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM agent_run WHERE run_id = ?")
        .bind(run_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    status.map(|raw| parse_status(&raw)).transpose()
}

async fn insert_audit(
    conn: &mut SqliteConnection,
    entry: &RunAuditEntry,
) -> Result<(), RepositoryError> {
    let (from_status, to_status, flag) = match &entry.change {
        RunChange::Started => (None, Some(RunStatus::Running.as_str()), None),
        RunChange::Status { from, to } => (Some(from.as_str()), Some(to.as_str()), None),
        RunChange::Flag { flag } => (None, None, Some(flag.as_str())),
    };

    sqlx::query(
        "INSERT INTO agent_run_transition (
            id,
            run_id,
            change_kind,
            from_status,
            to_status,
            flag,
            reason,
            actor,
            correlation_id,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(entry.run_id.as_str())
    .bind(entry.change.kind())
    .bind(from_status)
    .bind(to_status)
    .bind(flag)
    .bind(entry.reason.as_deref())
    .bind(&entry.actor)
    .bind(&entry.correlation_id)
    .bind(format_timestamp(entry.occurred_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn parse_status(raw: &str) -> Result<RunStatus, RepositoryError> {
    RunStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown run status `{raw}`")))
}

fn run_from_row(row: &SqliteRow) -> Result<AgentRun, RepositoryError> {
    let metadata_raw: String = row.try_get("metadata_json")?;
    let metadata = serde_json::from_str(&metadata_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid metadata_json `{metadata_raw}`: {error}"))
    })?;
    let status_raw: String = row.try_get("status")?;

    Ok(AgentRun {
        internal_id: row.try_get("id")?,
        run_id: RunId(row.try_get("run_id")?),
        team_id: TeamId(row.try_get("team_id")?),
        credential_id: row.try_get::<Option<i64>, _>("api_key_id")?.map(CredentialId),
        agent_id: row.try_get("agent_id")?,
        agent_name: row.try_get("agent_name")?,
        model: row.try_get("model")?,
        step_count: parse_u32("step_count", row.try_get("step_count")?)?,
        total_tokens: parse_u64("total_tokens", row.try_get("total_tokens")?)?,
        total_cost: decode_money(row.try_get("total_cost_micros")?),
        total_latency_ms: parse_u64("total_latency_ms", row.try_get("total_latency_ms")?)?,
        status: parse_status(&status_raw)?,
        kill_reason: row.try_get("kill_reason")?,
        loop_detected: row.try_get("loop_detected")?,
        budget_exceeded: row.try_get("budget_exceeded")?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        ended_at: parse_optional_timestamp("ended_at", row.try_get("ended_at")?)?,
        metadata,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<RunAuditEntry, RepositoryError> {
    let kind: String = row.try_get("change_kind")?;
    let change = match kind.as_str() {
        "started" => RunChange::Started,
        "status" => {
            let from: Option<String> = row.try_get("from_status")?;
            let to: Option<String> = row.try_get("to_status")?;
            match (from, to) {
                (Some(from), Some(to)) => {
                    RunChange::Status { from: parse_status(&from)?, to: parse_status(&to)? }
                }
                _ => {
                    return Err(RepositoryError::Decode(
                        "status transition is missing from/to".to_owned(),
                    ))
                }
            }
        }
        "flag" => {
            let raw: Option<String> = row.try_get("flag")?;
            let flag = raw.as_deref().and_then(RunFlag::parse).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown run flag `{}`", raw.unwrap_or_default()))
            })?;
            RunChange::Flag { flag }
        }
        other => return Err(RepositoryError::Decode(format!("unknown change kind `{other}`"))),
    };

    Ok(RunAuditEntry {
        id: row.try_get("id")?,
        run_id: RunId(row.try_get("run_id")?),
        change,
        reason: row.try_get("reason")?,
        actor: row.try_get("actor")?,
        correlation_id: row.try_get("correlation_id")?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use runwarden_core::audit::{RunAuditEntry, RunChange};
    use runwarden_core::domain::run::{NewAgentRun, RunFlag, RunId, RunProgress, RunStatus};
    use runwarden_core::domain::team::{NewTeam, TeamId};
    use runwarden_core::lifecycle::{KillReason, RunCommand};

    use super::SqlRunRepository;
    use crate::repositories::{
        FinishOutcome, FlagOutcome, ProgressOutcome, RunRepository, SqlTeamRepository,
        TeamRepository,
    };
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup() -> (DbPool, TeamId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let team = SqlTeamRepository::new(pool.clone())
            .insert(NewTeam::new("Platform", "platform"), Utc::now())
            .await
            .expect("team");
        (pool, team.id)
    }

    async fn start(repo: &SqlRunRepository, team_id: TeamId, run_id: &str) {
        let run_id = RunId(run_id.to_owned());
        let new_run = NewAgentRun {
            team_id,
            model: Some("gpt-4o-mini".to_owned()),
            ..NewAgentRun::default()
        };
        let audit = RunAuditEntry::new(run_id.clone(), RunChange::Started, "test", "corr");
        repo.insert(run_id, new_run, audit, Utc::now()).await.expect("insert run");
    }

    fn status_audit(run_id: &str, to: RunStatus) -> RunAuditEntry {
        RunAuditEntry::new(
            RunId(run_id.to_owned()),
            RunChange::Status { from: RunStatus::Running, to },
            "test",
            "corr",
        )
    }

    fn dollars(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    #[tokio::test]
    async fn progress_accumulates_counters_and_tenant_spend() {
        let (pool, team_id) = setup().await;
        let repo = SqlRunRepository::new(pool.clone());
        start(&repo, team_id, "run_a").await;
        start(&repo, team_id, "run_b").await;
        let run_a = RunId("run_a".to_owned());
        let run_b = RunId("run_b".to_owned());

        let first = repo
            .record_progress(&run_a, RunProgress::single_call(100, dollars(4), 250), Utc::now())
            .await
            .expect("progress");
        let ProgressOutcome::Applied { run, spend } = first else {
            panic!("expected applied progress");
        };
        assert_eq!(run.step_count, 1);
        assert_eq!(run.total_tokens, 100);
        assert_eq!(spend.run_cost, dollars(4));
        assert_eq!(spend.tenant_daily, dollars(4));

        let second = repo
            .record_progress(&run_b, RunProgress::single_call(50, dollars(3), 100), Utc::now())
            .await
            .expect("progress");
        let ProgressOutcome::Applied { run, spend } = second else {
            panic!("expected applied progress");
        };
        assert_eq!(run.total_cost, dollars(3));
        assert_eq!(spend.tenant_daily, dollars(7));
        assert_eq!(spend.tenant_monthly, dollars(7));
        assert_eq!(spend.credential_daily, Decimal::ZERO);

        pool.close().await;
    }

    #[tokio::test]
    async fn progress_on_terminal_run_does_not_mutate() {
        let (pool, team_id) = setup().await;
        let repo = SqlRunRepository::new(pool.clone());
        start(&repo, team_id, "run_done").await;
        let run_id = RunId("run_done".to_owned());

        repo.finish(&run_id, &RunCommand::Complete, status_audit("run_done", RunStatus::Completed), Utc::now())
            .await
            .expect("finish");
        let outcome = repo
            .record_progress(&run_id, RunProgress::single_call(10, dollars(1), 5), Utc::now())
            .await
            .expect("progress");
        assert_eq!(outcome, ProgressOutcome::NotActive(RunStatus::Completed));

        let run = repo.find_by_run_id(&run_id).await.expect("find").expect("exists");
        assert_eq!(run.step_count, 0);
        assert_eq!(run.total_cost, Decimal::ZERO);

        let missing = repo
            .record_progress(&RunId("nope".to_owned()), RunProgress::default(), Utc::now())
            .await
            .expect("progress");
        assert_eq!(missing, ProgressOutcome::NotFound);

        pool.close().await;
    }

    #[tokio::test]
    async fn kill_is_applied_once_and_audited() {
        let (pool, team_id) = setup().await;
        let repo = SqlRunRepository::new(pool.clone());
        start(&repo, team_id, "run_k").await;
        let run_id = RunId("run_k".to_owned());
        let kill = RunCommand::Kill { reason: KillReason::policy("EXCEEDED_DAILY").expect("reason") };

        let first = repo
            .finish(&run_id, &kill, status_audit("run_k", RunStatus::Killed), Utc::now())
            .await
            .expect("kill");
        let FinishOutcome::Applied(run) = first else {
            panic!("first kill should apply");
        };
        assert_eq!(run.kill_reason.as_deref(), Some("policy:EXCEEDED_DAILY"));
        assert!(run.ended_at.is_some());
        run.check_invariants().expect("invariants");

        let second = repo
            .finish(&run_id, &kill, status_audit("run_k", RunStatus::Killed), Utc::now())
            .await
            .expect("second kill");
        assert!(matches!(second, FinishOutcome::AlreadyTerminal(ref run) if run.status == RunStatus::Killed));

        let transitions = repo.list_transitions(&run_id).await.expect("transitions");
        assert_eq!(transitions.len(), 2, "start plus exactly one status change");
        assert_eq!(transitions[0].change, RunChange::Started);

        pool.close().await;
    }

    #[tokio::test]
    async fn failing_records_error_in_metadata() {
        let (pool, team_id) = setup().await;
        let repo = SqlRunRepository::new(pool.clone());
        start(&repo, team_id, "run_f").await;
        let run_id = RunId("run_f".to_owned());

        let outcome = repo
            .finish(
                &run_id,
                &RunCommand::Fail { error: "provider timeout".to_owned() },
                status_audit("run_f", RunStatus::Failed),
                Utc::now(),
            )
            .await
            .expect("fail");
        let FinishOutcome::Applied(run) = outcome else {
            panic!("fail should apply");
        };
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message(), Some("provider timeout"));
        assert!(run.kill_reason.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn flags_are_raised_once_while_running() {
        let (pool, team_id) = setup().await;
        let repo = SqlRunRepository::new(pool.clone());
        start(&repo, team_id, "run_flag").await;
        let run_id = RunId("run_flag".to_owned());
        let audit = || {
            RunAuditEntry::new(
                run_id.clone(),
                RunChange::Flag { flag: RunFlag::LoopDetected },
                "test",
                "corr",
            )
        };

        let raised = repo
            .raise_flag(&run_id, RunFlag::LoopDetected, audit(), Utc::now())
            .await
            .expect("raise");
        assert!(matches!(raised, FlagOutcome::Raised(ref run) if run.loop_detected));

        let again = repo
            .raise_flag(&run_id, RunFlag::LoopDetected, audit(), Utc::now())
            .await
            .expect("raise again");
        assert!(matches!(again, FlagOutcome::AlreadySet(_)));

        repo.finish(&run_id, &RunCommand::Complete, status_audit("run_flag", RunStatus::Completed), Utc::now())
            .await
            .expect("finish");
        let after = repo
            .raise_flag(&run_id, RunFlag::BudgetExceeded, audit(), Utc::now())
            .await
            .expect("raise after finish");
        assert!(matches!(after, FlagOutcome::NotActive(_)));

        pool.close().await;
    }

    #[tokio::test]
    async fn list_running_excludes_terminal_runs() {
        let (pool, team_id) = setup().await;
        let repo = SqlRunRepository::new(pool.clone());
        start(&repo, team_id, "run_1").await;
        start(&repo, team_id, "run_2").await;
        repo.finish(
            &RunId("run_1".to_owned()),
            &RunCommand::Complete,
            status_audit("run_1", RunStatus::Completed),
            Utc::now() + Duration::seconds(1),
        )
        .await
        .expect("finish");

        let running = repo.list_running().await.expect("list");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run_id.as_str(), "run_2");

        pool.close().await;
    }
}
