use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use runwarden_core::domain::team::{NewTeam, Team, TeamId};

use super::codec::{
    decode_optional_money, encode_optional_money, format_timestamp, is_unique_violation,
    parse_timestamp, parse_u32,
};
use super::{RepositoryError, TeamRepository};
use crate::DbPool;

const TEAM_COLUMNS: &str = "id, name, slug, default_daily_budget_micros,
    default_monthly_budget_micros, max_steps_per_run, timeout_seconds, is_active, created_at,
    updated_at";

pub struct SqlTeamRepository {
    pool: DbPool,
}

impl SqlTeamRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TeamRepository for SqlTeamRepository {
    async fn insert(&self, team: NewTeam, at: DateTime<Utc>) -> Result<Team, RepositoryError> {
        let stamp = format_timestamp(at);
        let row = sqlx::query(&format!(
            "INSERT INTO team (
                name,
                slug,
                default_daily_budget_micros,
                default_monthly_budget_micros,
                max_steps_per_run,
                timeout_seconds,
                is_active,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
             RETURNING {TEAM_COLUMNS}"
        ))
        .bind(&team.name)
        .bind(&team.slug)
        .bind(encode_optional_money("default_daily_budget", team.default_daily_budget)?)
        .bind(encode_optional_money("default_monthly_budget", team.default_monthly_budget)?)
        .bind(i64::from(team.max_steps_per_run))
        .bind(i64::from(team.timeout_seconds))
        .bind(&stamp)
        .bind(&stamp)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                RepositoryError::Conflict(format!("team slug `{}` already exists", team.slug))
            } else {
                RepositoryError::Database(error)
            }
        })?;

        team_from_row(&row)
    }

    async fn find_by_id(&self, id: TeamId) -> Result<Option<Team>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TEAM_COLUMNS} FROM team WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(team_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Team>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {TEAM_COLUMNS} FROM team ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(team_from_row).collect()
    }

    async fn set_active(
        &self,
        id: TeamId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Team>, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE team SET is_active = ?, updated_at = ? WHERE id = ? RETURNING {TEAM_COLUMNS}"
        ))
        .bind(active)
        .bind(format_timestamp(at))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(team_from_row).transpose()
    }
}

fn team_from_row(row: &SqliteRow) -> Result<Team, RepositoryError> {
    Ok(Team {
        id: TeamId(row.try_get("id")?),
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        default_daily_budget: decode_optional_money(row.try_get("default_daily_budget_micros")?),
        default_monthly_budget: decode_optional_money(
            row.try_get("default_monthly_budget_micros")?,
        ),
        max_steps_per_run: parse_u32("max_steps_per_run", row.try_get("max_steps_per_run")?)?,
        timeout_seconds: parse_u32("timeout_seconds", row.try_get("timeout_seconds")?)?,
        is_active: row.try_get("is_active")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
