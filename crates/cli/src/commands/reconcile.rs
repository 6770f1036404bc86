use chrono::{NaiveDate, Utc};
use runwarden_core::domain::team::TeamId;

use crate::commands::session::with_governor;
use crate::commands::CommandResult;

/// Compares a tenant's accumulated spend for one UTC day (today by default)
/// with the request log. Drift is reported, not treated as a failure.
pub fn run(team_id: i64, day: Option<NaiveDate>) -> CommandResult {
    let day = day.unwrap_or_else(|| Utc::now().date_naive());
    with_governor("reconcile", |governor| async move {
        match governor.reconciler.reconcile_team_day(TeamId(team_id), day).await {
            Ok(report) => {
                let message = if report.is_balanced() {
                    format!("team {team_id} spend for {day} matches the request log")
                } else {
                    format!("team {team_id} spend for {day} drifts by {}", report.drift)
                };
                CommandResult::success_with("reconcile", message, &report)
            }
            Err(error) => CommandResult::from_application("reconcile", error),
        }
    })
}
