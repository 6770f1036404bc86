use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use runwarden_core::domain::policy::{BudgetPolicy, NewBudgetPolicy, PolicyId};
use runwarden_core::domain::team::TeamId;

use super::codec::{decode_optional_money, encode_optional_money, format_timestamp, parse_timestamp};
use super::{PolicyRepository, RepositoryError};
use crate::DbPool;

const POLICY_COLUMNS: &str = "id, team_id, name, description, per_run_limit_micros,
    daily_limit_micros, monthly_limit_micros, alert_threshold_micros, auto_kill_enabled,
    is_active, created_at, updated_at";

pub struct SqlPolicyRepository {
    pool: DbPool,
}

impl SqlPolicyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyRepository for SqlPolicyRepository {
    async fn insert(
        &self,
        policy: NewBudgetPolicy,
        at: DateTime<Utc>,
    ) -> Result<BudgetPolicy, RepositoryError> {
        let stamp = format_timestamp(at);
        let row = sqlx::query(&format!(
            "INSERT INTO budget_policy (
                team_id,
                name,
                description,
                per_run_limit_micros,
                daily_limit_micros,
                monthly_limit_micros,
                alert_threshold_micros,
                auto_kill_enabled,
                is_active,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             RETURNING {POLICY_COLUMNS}"
        ))
        .bind(policy.team_id.0)
        .bind(&policy.name)
        .bind(policy.description.as_deref())
        .bind(encode_optional_money("per_run_limit", policy.per_run_limit)?)
        .bind(encode_optional_money("daily_limit", policy.daily_limit)?)
        .bind(encode_optional_money("monthly_limit", policy.monthly_limit)?)
        .bind(encode_optional_money("alert_threshold", policy.alert_threshold)?)
        .bind(policy.auto_kill_enabled)
        .bind(&stamp)
        .bind(&stamp)
        .fetch_one(&self.pool)
        .await?;

        policy_from_row(&row)
    }

    async fn find_by_id(&self, id: PolicyId) -> Result<Option<BudgetPolicy>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {POLICY_COLUMNS} FROM budget_policy WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(policy_from_row).transpose()
    }

    async fn list_for_team(&self, team_id: TeamId) -> Result<Vec<BudgetPolicy>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM budget_policy WHERE team_id = ? ORDER BY id ASC"
        ))
        .bind(team_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(policy_from_row).collect()
    }

    async fn set_active(
        &self,
        id: PolicyId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<BudgetPolicy>, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE budget_policy SET is_active = ?, updated_at = ? WHERE id = ?
             RETURNING {POLICY_COLUMNS}"
        ))
        .bind(active)
        .bind(format_timestamp(at))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(policy_from_row).transpose()
    }
}

fn policy_from_row(row: &SqliteRow) -> Result<BudgetPolicy, RepositoryError> {
    Ok(BudgetPolicy {
        id: PolicyId(row.try_get("id")?),
        team_id: TeamId(row.try_get("team_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        per_run_limit: decode_optional_money(row.try_get("per_run_limit_micros")?),
        daily_limit: decode_optional_money(row.try_get("daily_limit_micros")?),
        monthly_limit: decode_optional_money(row.try_get("monthly_limit_micros")?),
        alert_threshold: decode_optional_money(row.try_get("alert_threshold_micros")?),
        auto_kill_enabled: row.try_get("auto_kill_enabled")?,
        is_active: row.try_get("is_active")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use runwarden_core::domain::policy::NewBudgetPolicy;
    use runwarden_core::domain::team::NewTeam;

    use super::SqlPolicyRepository;
    use crate::repositories::{PolicyRepository, SqlTeamRepository, TeamRepository};
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn policies_are_listed_per_team_with_active_flag() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let teams = SqlTeamRepository::new(pool.clone());
        let team = teams.insert(NewTeam::new("Platform", "platform"), Utc::now()).await.expect("team");
        let other = teams.insert(NewTeam::new("Research", "research"), Utc::now()).await.expect("team");
        let repo = SqlPolicyRepository::new(pool.clone());

        let mut daily = NewBudgetPolicy::new(team.id, "daily");
        daily.daily_limit = Some(Decimal::new(10, 0));
        daily.alert_threshold = Some(Decimal::new(5, 0));
        let stored = repo.insert(daily, Utc::now()).await.expect("insert");
        repo.insert(NewBudgetPolicy::new(other.id, "other"), Utc::now()).await.expect("insert other");

        assert_eq!(stored.daily_limit, Some(Decimal::new(10, 0)));
        assert!(stored.auto_kill_enabled);
        assert_eq!(repo.list_for_team(team.id).await.expect("list"), vec![stored.clone()]);

        let disabled = repo.set_active(stored.id, false, Utc::now()).await.expect("disable");
        assert_eq!(disabled.map(|policy| policy.is_active), Some(false));

        pool.close().await;
    }
}
