use std::sync::Arc;

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use runwarden_core::domain::team::TeamId;
use runwarden_core::errors::{ApplicationError, DomainError};
use runwarden_db::repositories::{RequestLogRepository, SpendPeriod, SpendRepository, SpendSubject};

use crate::error::persistence;

/// Accumulated tenant spend for one UTC day next to what the request log
/// recorded for the same day.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DayReconciliation {
    pub team_id: TeamId,
    pub day: NaiveDate,
    pub accumulated: Decimal,
    pub logged: Decimal,
    pub request_count: u64,
    /// `accumulated - logged`.
    pub drift: Decimal,
}

impl DayReconciliation {
    pub fn is_balanced(&self) -> bool {
        self.drift.is_zero()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    spend: Arc<dyn SpendRepository>,
    request_logs: Arc<dyn RequestLogRepository>,
}

impl Reconciler {
    pub fn new(spend: Arc<dyn SpendRepository>, request_logs: Arc<dyn RequestLogRepository>) -> Self {
        Self { spend, request_logs }
    }

    /// Drift is expected when telemetry arrives for runs that are not driven
    /// by ingestion, or when progress is reported without telemetry.
    pub async fn reconcile_team_day(
        &self,
        team_id: TeamId,
        day: NaiveDate,
    ) -> Result<DayReconciliation, ApplicationError> {
        let from = day.and_hms_opt(0, 0, 0).map(|start| start.and_utc());
        let to = day
            .checked_add_days(Days::new(1))
            .and_then(|next| next.and_hms_opt(0, 0, 0))
            .map(|end| end.and_utc());
        let (Some(from), Some(to)) = (from, to) else {
            return Err(DomainError::InvariantViolation(format!("day `{day}` is out of range")).into());
        };

        let accumulated = self
            .spend
            .total(SpendSubject::Team(team_id), SpendPeriod::Day(day))
            .await
            .map_err(persistence)?
            .cost;
        let (logged, request_count) = self
            .request_logs
            .cost_for_team_between(team_id, from, to)
            .await
            .map_err(persistence)?;

        let report = DayReconciliation {
            team_id,
            day,
            accumulated,
            logged,
            request_count,
            drift: accumulated - logged,
        };
        if report.is_balanced() {
            info!(
                event_name = "governance.reconcile.balanced",
                team_id = %team_id,
                day = %day,
                total = %accumulated,
                "daily spend matches request log"
            );
        } else {
            warn!(
                event_name = "governance.reconcile.drift",
                team_id = %team_id,
                day = %day,
                accumulated = %accumulated,
                logged = %logged,
                drift = %report.drift,
                "daily spend differs from request log"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use runwarden_core::domain::request_log::TelemetryRecord;
    use runwarden_core::domain::run::RunProgress;
    use runwarden_core::domain::team::NewTeam;

    use crate::registry::StartRun;
    use crate::testing::governor;

    #[tokio::test]
    async fn ingested_spend_reconciles_with_the_request_log() {
        let (governor, _alerts) = governor().await;
        let team = governor.policies.create_team(NewTeam::new("Ops", "ops")).await.expect("team");
        let run = governor
            .runs
            .start(
                StartRun { team_id: team.id, model: "gpt-4o".into(), ..StartRun::default() },
                "c",
            )
            .await
            .expect("start");

        for index in 0..3 {
            let record = TelemetryRecord {
                request_id: Some(format!("req_{index}")),
                run_id: Some(run.run_id.to_string()),
                team_id: Some(team.id.0),
                model: Some("gpt-4o".to_owned()),
                cost_usd: Some(Decimal::new(150, 2)),
                ..TelemetryRecord::default()
            };
            governor.ingest.ingest_one(record, "c").await.expect("ingest");
        }

        let today = Utc::now().date_naive();
        let report =
            governor.reconciler.reconcile_team_day(team.id, today).await.expect("reconcile");
        assert_eq!(report.accumulated, Decimal::new(450, 2));
        assert_eq!(report.logged, Decimal::new(450, 2));
        assert_eq!(report.request_count, 3);
        assert!(report.is_balanced());
    }

    #[tokio::test]
    async fn progress_without_telemetry_shows_as_drift() {
        let (governor, _alerts) = governor().await;
        let team = governor.policies.create_team(NewTeam::new("Ops", "ops")).await.expect("team");
        let run = governor
            .runs
            .start(
                StartRun { team_id: team.id, model: "gpt-4o".into(), ..StartRun::default() },
                "c",
            )
            .await
            .expect("start");
        governor
            .runs
            .record_progress(&run.run_id, RunProgress::single_call(10, Decimal::ONE, 5), "c")
            .await
            .expect("progress");

        let report = governor
            .reconciler
            .reconcile_team_day(team.id, Utc::now().date_naive())
            .await
            .expect("reconcile");
        assert_eq!(report.drift, Decimal::ONE);
        assert_eq!(report.request_count, 0);
    }
}
