use chrono::{Duration, Utc};
use runwarden_core::domain::credential::{CredentialId, NewCredential};
use runwarden_core::domain::team::TeamId;
use runwarden_governor::IssuedCredential;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use crate::commands::session::with_governor;
use crate::commands::CommandResult;

#[derive(Clone, Debug, Default)]
pub struct IssueKey {
    pub team_id: i64,
    pub name: String,
    pub user_id: Option<i64>,
    pub daily_budget: Option<Decimal>,
    pub max_steps_per_run: Option<u32>,
    pub allowed_models: Vec<String>,
    pub expires_in_days: Option<u32>,
}

pub fn issue(args: IssueKey) -> CommandResult {
    with_governor("key issue", |governor| async move {
        let credential = NewCredential {
            team_id: TeamId(args.team_id),
            user_id: args.user_id,
            name: args.name,
            daily_budget: args.daily_budget,
            max_steps_per_run: args.max_steps_per_run,
            allowed_models: args.allowed_models,
            expires_at: args.expires_in_days.map(|days| Utc::now() + Duration::days(days.into())),
        };
        match governor.credentials.issue(credential).await {
            Ok(issued) => CommandResult::success_with(
                "key issue",
                "credential issued; the api_key is shown only once",
                &issued_payload(&issued),
            ),
            Err(error) => CommandResult::from_application("key issue", error),
        }
    })
}

pub fn regenerate(id: i64) -> CommandResult {
    with_governor("key regenerate", |governor| async move {
        match governor.credentials.regenerate(CredentialId(id)).await {
            Ok(issued) => CommandResult::success_with(
                "key regenerate",
                "credential secret replaced; the previous secret no longer verifies",
                &issued_payload(&issued),
            ),
            Err(error) => CommandResult::from_application("key regenerate", error),
        }
    })
}

fn issued_payload(issued: &IssuedCredential) -> Value {
    json!({
        "id": issued.credential.id,
        "team_id": issued.credential.team_id,
        "name": issued.credential.name,
        "masked_key": issued.credential.masked_key(),
        "api_key": issued.secret.expose_secret(),
        "expires_at": issued.credential.expires_at,
    })
}
