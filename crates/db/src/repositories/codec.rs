//! Column encodings shared by the SQL repositories.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use runwarden_core::money;

use super::RepositoryError;

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative integer): {value}"
        ))
    })
}

pub(crate) fn encode_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Encode(format!("`{column}` value {value} is out of range")))
}

pub(crate) fn encode_money(column: &str, amount: Decimal) -> Result<i64, RepositoryError> {
    money::to_micros(amount)
        .map_err(|error| RepositoryError::Encode(format!("`{column}`: {error}")))
}

pub(crate) fn encode_optional_money(
    column: &str,
    amount: Option<Decimal>,
) -> Result<Option<i64>, RepositoryError> {
    amount.map(|amount| encode_money(column, amount)).transpose()
}

pub(crate) fn decode_money(micros: i64) -> Decimal {
    money::from_micros(micros)
}

pub(crate) fn decode_optional_money(micros: Option<i64>) -> Option<Decimal> {
    micros.map(money::from_micros)
}

pub(crate) fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    value.parse::<Decimal>().map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(database) if database.is_unique_violation())
}
