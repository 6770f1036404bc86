use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::run::RunId;
use crate::domain::team::TeamId;
use crate::errors::DomainError;

pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "/v1/chat/completions";
pub const DEFAULT_STATUS_CODE: u16 = 200;

/// A telemetry record as submitted by the proxy, before validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub request_id: Option<String>,
    pub run_id: Option<String>,
    pub team_id: Option<i64>,
    pub user_id: Option<i64>,
    pub api_key_id: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub stream: Option<bool>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<Decimal>,
    pub latency_ms: Option<i64>,
    pub ttfb_ms: Option<i64>,
    pub status_code: Option<i64>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub dlp_triggered: Option<bool>,
    pub loop_detected: Option<bool>,
    pub budget_exceeded: Option<bool>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// A validated record ready to append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequestLog {
    pub request_id: String,
    pub run_id: Option<RunId>,
    pub team_id: Option<TeamId>,
    pub user_id: Option<i64>,
    pub api_key_id: Option<String>,
    pub model: String,
    pub provider: String,
    pub endpoint: String,
    pub stream: bool,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: Decimal,
    pub latency_ms: u64,
    pub ttfb_ms: Option<u64>,
    pub status_code: u16,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub dlp_triggered: bool,
    pub loop_detected: bool,
    pub budget_exceeded: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: i64,
    #[serde(flatten)]
    pub entry: NewRequestLog,
    pub created_at: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn validate(self) -> Result<NewRequestLog, DomainError> {
        let request_id = required_text("request_id", self.request_id, 50)?;
        let model = required_text("model", self.model, 100)?;
        let run_id = optional_text("run_id", self.run_id, 50)?.map(RunId);
        let api_key_id = optional_text("api_key_id", self.api_key_id, 50)?;
        let provider = optional_text("provider", self.provider, 50)?
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_owned());
        let endpoint = optional_text("endpoint", self.endpoint, 100)?
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());
        let ip_address = optional_text("ip_address", self.ip_address, 45)?;
        let user_agent = optional_text("user_agent", self.user_agent, 255)?;

        let prompt_tokens = non_negative("prompt_tokens", self.prompt_tokens.unwrap_or(0))?;
        let completion_tokens =
            non_negative("completion_tokens", self.completion_tokens.unwrap_or(0))?;
        let total_tokens = match self.total_tokens {
            Some(total) => non_negative("total_tokens", total)?,
            None => prompt_tokens.saturating_add(completion_tokens),
        };
        let latency_ms = non_negative("latency_ms", self.latency_ms.unwrap_or(0))?;
        let ttfb_ms = self.ttfb_ms.map(|value| non_negative("ttfb_ms", value)).transpose()?;

        let cost_usd = self.cost_usd.unwrap_or(Decimal::ZERO);
        if cost_usd < Decimal::ZERO {
            return Err(DomainError::MalformedTelemetry("cost_usd must not be negative".to_owned()));
        }

        let status_code = match self.status_code {
            Some(code) => u16::try_from(code)
                .ok()
                .filter(|code| (100..=599).contains(code))
                .ok_or_else(|| {
                    DomainError::MalformedTelemetry(format!("status_code `{code}` is out of range"))
                })?,
            None => DEFAULT_STATUS_CODE,
        };

        Ok(NewRequestLog {
            request_id,
            run_id,
            team_id: self.team_id.map(TeamId),
            user_id: self.user_id,
            api_key_id,
            model,
            provider,
            endpoint,
            stream: self.stream.unwrap_or(false),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost_usd,
            latency_ms,
            ttfb_ms,
            status_code,
            error_type: self.error_type,
            error_message: self.error_message,
            dlp_triggered: self.dlp_triggered.unwrap_or(false),
            loop_detected: self.loop_detected.unwrap_or(false),
            budget_exceeded: self.budget_exceeded.unwrap_or(false),
            ip_address,
            user_agent,
        })
    }
}

fn required_text(field: &str, value: Option<String>, max: usize) -> Result<String, DomainError> {
    optional_text(field, value, max)?
        .ok_or_else(|| DomainError::MalformedTelemetry(format!("{field} is required")))
}

fn optional_text(
    field: &str,
    value: Option<String>,
    max: usize,
) -> Result<Option<String>, DomainError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > max {
        return Err(DomainError::MalformedTelemetry(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(Some(trimmed.to_owned()))
}

fn non_negative(field: &str, value: i64) -> Result<u64, DomainError> {
    u64::try_from(value)
        .map_err(|_| DomainError::MalformedTelemetry(format!("{field} must not be negative")))
}
