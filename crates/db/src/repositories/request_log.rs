use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use runwarden_core::domain::request_log::{NewRequestLog, RequestLog};
use runwarden_core::domain::run::RunId;
use runwarden_core::domain::team::TeamId;

use super::codec::{
    encode_i64, format_timestamp, is_unique_violation, parse_decimal, parse_timestamp, parse_u64,
};
use super::{RepositoryError, RequestLogRepository};
use crate::DbPool;

const REQUEST_LOG_COLUMNS: &str = "id, request_id, run_id, team_id, user_id, api_key_id, model,
    provider, endpoint, stream, prompt_tokens, completion_tokens, total_tokens, cost_usd,
    latency_ms, ttfb_ms, status_code, error_type, error_message, dlp_triggered, loop_detected,
    budget_exceeded, ip_address, user_agent, created_at";

pub struct SqlRequestLogRepository {
    pool: DbPool,
}

impl SqlRequestLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestLogRepository for SqlRequestLogRepository {
    async fn insert(
        &self,
        entry: NewRequestLog,
        at: DateTime<Utc>,
    ) -> Result<RequestLog, RepositoryError> {
        let row = sqlx::query(&format!(
            "INSERT INTO request_log (
                request_id,
                run_id,
                team_id,
                user_id,
                api_key_id,
                model,
                provider,
                endpoint,
                stream,
                prompt_tokens,
                completion_tokens,
                total_tokens,
                cost_usd,
                latency_ms,
                ttfb_ms,
                status_code,
                error_type,
                error_message,
                dlp_triggered,
                loop_detected,
                budget_exceeded,
                ip_address,
                user_agent,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {REQUEST_LOG_COLUMNS}"
        ))
        .bind(&entry.request_id)
        .bind(entry.run_id.as_ref().map(RunId::as_str))
        .bind(entry.team_id.map(|id| id.0))
        .bind(entry.user_id)
        .bind(entry.api_key_id.as_deref())
        .bind(&entry.model)
        .bind(&entry.provider)
        .bind(&entry.endpoint)
        .bind(entry.stream)
        .bind(encode_i64("prompt_tokens", entry.prompt_tokens)?)
        .bind(encode_i64("completion_tokens", entry.completion_tokens)?)
        .bind(encode_i64("total_tokens", entry.total_tokens)?)
        .bind(entry.cost_usd.normalize().to_string())
        .bind(encode_i64("latency_ms", entry.latency_ms)?)
        .bind(entry.ttfb_ms.map(|value| encode_i64("ttfb_ms", value)).transpose()?)
        .bind(i64::from(entry.status_code))
        .bind(entry.error_type.as_deref())
        .bind(entry.error_message.as_deref())
        .bind(entry.dlp_triggered)
        .bind(entry.loop_detected)
        .bind(entry.budget_exceeded)
        .bind(entry.ip_address.as_deref())
        .bind(entry.user_agent.as_deref())
        .bind(format_timestamp(at))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                RepositoryError::Conflict(format!(
                    "request `{}` was already logged",
                    entry.request_id
                ))
            } else {
                RepositoryError::Database(error)
            }
        })?;

        request_log_from_row(&row)
    }

    async fn find_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<RequestLog>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_LOG_COLUMNS} FROM request_log WHERE request_id = ?"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(request_log_from_row).transpose()
    }

    async fn cost_for_team_between(
        &self,
        team_id: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(Decimal, u64), RepositoryError> {
        let costs: Vec<String> = sqlx::query_scalar(
            "SELECT cost_usd FROM request_log
             WHERE team_id = ? AND created_at >= ? AND created_at < ?",
        )
        .bind(team_id.0)
        .bind(format_timestamp(from))
        .bind(format_timestamp(to))
        .fetch_all(&self.pool)
        .await?;

        let count = costs.len() as u64;
        let mut total = Decimal::ZERO;
        for cost in costs {
            total += parse_decimal("cost_usd", cost)?;
        }
        Ok((total, count))
    }
}

fn request_log_from_row(row: &SqliteRow) -> Result<RequestLog, RepositoryError> {
    let status_code: i64 = row.try_get("status_code")?;
    let status_code = u16::try_from(status_code).map_err(|_| {
        RepositoryError::Decode(format!("invalid status_code `{status_code}`"))
    })?;

    let entry = NewRequestLog {
        request_id: row.try_get("request_id")?,
        run_id: row.try_get::<Option<String>, _>("run_id")?.map(RunId),
        team_id: row.try_get::<Option<i64>, _>("team_id")?.map(TeamId),
        user_id: row.try_get("user_id")?,
        api_key_id: row.try_get("api_key_id")?,
        model: row.try_get("model")?,
        provider: row.try_get("provider")?,
        endpoint: row.try_get("endpoint")?,
        stream: row.try_get("stream")?,
        prompt_tokens: parse_u64("prompt_tokens", row.try_get("prompt_tokens")?)?,
        completion_tokens: parse_u64("completion_tokens", row.try_get("completion_tokens")?)?,
        total_tokens: parse_u64("total_tokens", row.try_get("total_tokens")?)?,
        cost_usd: parse_decimal("cost_usd", row.try_get("cost_usd")?)?,
        latency_ms: parse_u64("latency_ms", row.try_get("latency_ms")?)?,
        ttfb_ms: row
            .try_get::<Option<i64>, _>("ttfb_ms")?
            .map(|value| parse_u64("ttfb_ms", value))
            .transpose()?,
        status_code,
        error_type: row.try_get("error_type")?,
        error_message: row.try_get("error_message")?,
        dlp_triggered: row.try_get("dlp_triggered")?,
        loop_detected: row.try_get("loop_detected")?,
        budget_exceeded: row.try_get("budget_exceeded")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
    };

    Ok(RequestLog {
        id: row.try_get("id")?,
        entry,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
