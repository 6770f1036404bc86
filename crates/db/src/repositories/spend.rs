//! Incrementally maintained spend totals per tenant and credential.
//!
//! Rows are keyed by `(scope_kind, scope_id, period_key)` and only ever grow
//! through `accumulate`, which runs inside the transaction that updates the
//! run counters so totals and runs never disagree.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqliteConnection};

use runwarden_core::budget::SpendSnapshot;
use runwarden_core::domain::credential::CredentialId;
use runwarden_core::domain::team::TeamId;

use super::codec::{decode_money, format_timestamp, parse_u64};
use super::{RepositoryError, SpendRepository};
use crate::DbPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpendSubject {
    Team(TeamId),
    Credential(CredentialId),
}

impl SpendSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Team(_) => "team",
            Self::Credential(_) => "credential",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Team(id) => id.0,
            Self::Credential(id) => id.0,
        }
    }
}

/// A UTC calendar day or month.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpendPeriod {
    Day(NaiveDate),
    Month { year: i32, month: u32 },
}

impl SpendPeriod {
    pub fn day_of(at: DateTime<Utc>) -> Self {
        Self::Day(at.date_naive())
    }

    pub fn month_of(at: DateTime<Utc>) -> Self {
        Self::Month { year: at.year(), month: at.month() }
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SpendPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day(date) => write!(f, "day:{}", date.format("%Y-%m-%d")),
            Self::Month { year, month } => write!(f, "month:{year:04}-{month:02}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpendTotal {
    pub cost: Decimal,
    pub request_count: u64,
}

pub struct SqlSpendRepository {
    pool: DbPool,
}

impl SqlSpendRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SpendRepository for SqlSpendRepository {
    async fn total(
        &self,
        subject: SpendSubject,
        period: SpendPeriod,
    ) -> Result<SpendTotal, RepositoryError> {
        let row = sqlx::query(
            "SELECT cost_micros, request_count
             FROM spend_accumulator
             WHERE scope_kind = ? AND scope_id = ? AND period_key = ?",
        )
        .bind(subject.kind())
        .bind(subject.id())
        .bind(period.key())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SpendTotal::default());
        };
        Ok(SpendTotal {
            cost: decode_money(row.try_get("cost_micros")?),
            request_count: parse_u64("request_count", row.try_get("request_count")?)?,
        })
    }

    async fn snapshot(
        &self,
        team_id: TeamId,
        credential_id: Option<CredentialId>,
        run_cost: Decimal,
        at: DateTime<Utc>,
    ) -> Result<SpendSnapshot, RepositoryError> {
        let tenant_daily = self.total(SpendSubject::Team(team_id), SpendPeriod::day_of(at)).await?;
        let tenant_monthly =
            self.total(SpendSubject::Team(team_id), SpendPeriod::month_of(at)).await?;
        let credential_daily = match credential_id {
            Some(id) => self.total(SpendSubject::Credential(id), SpendPeriod::day_of(at)).await?,
            None => SpendTotal::default(),
        };

        Ok(SpendSnapshot {
            run_cost,
            tenant_daily: tenant_daily.cost,
            tenant_monthly: tenant_monthly.cost,
            credential_daily: credential_daily.cost,
        })
    }
}

/// Adds `cost_micros` to one accumulator row and returns the new total. The
/// increment and read happen in a single statement.
pub(crate) async fn accumulate(
    conn: &mut SqliteConnection,
    subject: SpendSubject,
    period: SpendPeriod,
    cost_micros: i64,
    at: DateTime<Utc>,
) -> Result<Decimal, RepositoryError> {
    let total: i64 = sqlx::query_scalar(
        "INSERT INTO spend_accumulator (
            scope_kind,
            scope_id,
            period_key,
            cost_micros,
            request_count,
            updated_at
         ) VALUES (?, ?, ?, ?, 1, ?)
         ON CONFLICT(scope_kind, scope_id, period_key) DO UPDATE SET
            cost_micros = spend_accumulator.cost_micros + excluded.cost_micros,
            request_count = spend_accumulator.request_count + 1,
            updated_at = excluded.updated_at
         RETURNING cost_micros",
    )
    .bind(subject.kind())
    .bind(subject.id())
    .bind(period.key())
    .bind(cost_micros)
    .bind(format_timestamp(at))
    .fetch_one(&mut *conn)
    .await?;

    Ok(decode_money(total))
}
