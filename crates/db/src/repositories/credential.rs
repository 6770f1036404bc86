use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use runwarden_core::domain::credential::{Credential, CredentialId, NewCredential};
use runwarden_core::domain::team::TeamId;

use super::codec::{
    decode_optional_money, encode_optional_money, format_timestamp, is_unique_violation,
    parse_optional_timestamp, parse_timestamp, parse_u32,
};
use super::{CredentialRepository, RepositoryError};
use crate::DbPool;

const CREDENTIAL_COLUMNS: &str = "id, team_id, user_id, name, key_prefix, key_hash,
    daily_budget_micros, max_steps_per_run, allowed_models_json, expires_at, last_used_at,
    is_active, created_at, updated_at";

pub struct SqlCredentialRepository {
    pool: DbPool,
}

impl SqlCredentialRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialRepository for SqlCredentialRepository {
    async fn insert(
        &self,
        credential: NewCredential,
        key_prefix: &str,
        key_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<Credential, RepositoryError> {
        let allowed_models = serde_json::to_string(&credential.allowed_models)
            .map_err(|error| RepositoryError::Encode(format!("allowed_models: {error}")))?;
        let stamp = format_timestamp(at);

        let row = sqlx::query(&format!(
            "INSERT INTO api_key (
                team_id,
                user_id,
                name,
                key_prefix,
                key_hash,
                daily_budget_micros,
                max_steps_per_run,
                allowed_models_json,
                expires_at,
                last_used_at,
                is_active,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 1, ?, ?)
             RETURNING {CREDENTIAL_COLUMNS}"
        ))
        .bind(credential.team_id.0)
        .bind(credential.user_id)
        .bind(&credential.name)
        .bind(key_prefix)
        .bind(key_hash)
        .bind(encode_optional_money("daily_budget", credential.daily_budget)?)
        .bind(credential.max_steps_per_run.map(i64::from))
        .bind(allowed_models)
        .bind(credential.expires_at.map(format_timestamp))
        .bind(&stamp)
        .bind(&stamp)
        .fetch_one(&self.pool)
        .await
        .map_err(map_hash_conflict)?;

        credential_from_row(&row)
    }

    async fn find_by_id(&self, id: CredentialId) -> Result<Option<Credential>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CREDENTIAL_COLUMNS} FROM api_key WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {CREDENTIAL_COLUMNS} FROM api_key WHERE key_hash = ?"))
                .bind(key_hash)
                .fetch_optional(&self.pool)
                .await?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn list_for_team(&self, team_id: TeamId) -> Result<Vec<Credential>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM api_key WHERE team_id = ? ORDER BY id ASC"
        ))
        .bind(team_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(credential_from_row).collect()
    }

    async fn replace_secret(
        &self,
        id: CredentialId,
        key_prefix: &str,
        key_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Credential>, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE api_key
             SET key_prefix = ?, key_hash = ?, updated_at = ?
             WHERE id = ?
             RETURNING {CREDENTIAL_COLUMNS}"
        ))
        .bind(key_prefix)
        .bind(key_hash)
        .bind(format_timestamp(at))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_hash_conflict)?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn touch_last_used(
        &self,
        id: CredentialId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE api_key SET last_used_at = ? WHERE id = ?")
            .bind(format_timestamp(at))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_active(
        &self,
        id: CredentialId,
        active: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Credential>, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE api_key SET is_active = ?, updated_at = ? WHERE id = ?
             RETURNING {CREDENTIAL_COLUMNS}"
        ))
        .bind(active)
        .bind(format_timestamp(at))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(credential_from_row).transpose()
    }
}

fn map_hash_conflict(error: sqlx::Error) -> RepositoryError {
    if is_unique_violation(&error) {
        RepositoryError::Conflict("credential hash already exists".to_owned())
    } else {
        RepositoryError::Database(error)
    }
}

fn credential_from_row(row: &SqliteRow) -> Result<Credential, RepositoryError> {
    let allowed_models_raw: String = row.try_get("allowed_models_json")?;
    let allowed_models: Vec<String> = serde_json::from_str(&allowed_models_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid allowed_models_json `{allowed_models_raw}`: {error}"))
    })?;

    Ok(Credential {
        id: CredentialId(row.try_get("id")?),
        team_id: TeamId(row.try_get("team_id")?),
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        key_prefix: row.try_get("key_prefix")?,
        key_hash: row.try_get("key_hash")?,
        daily_budget: decode_optional_money(row.try_get("daily_budget_micros")?),
        max_steps_per_run: row
            .try_get::<Option<i64>, _>("max_steps_per_run")?
            .map(|value| parse_u32("max_steps_per_run", value))
            .transpose()?,
        allowed_models,
        is_active: row.try_get("is_active")?,
        expires_at: parse_optional_timestamp("expires_at", row.try_get("expires_at")?)?,
        last_used_at: parse_optional_timestamp("last_used_at", row.try_get("last_used_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
