use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use tracing::{debug, info};

use runwarden_core::domain::credential::{Credential, CredentialId, NewCredential};
use runwarden_core::domain::team::TeamId;
use runwarden_core::errors::{ApplicationError, DomainError};
use runwarden_core::secrets::{constant_time_eq, generate_secret, hash_secret};
use runwarden_db::repositories::{
    CredentialRepository, SpendPeriod, SpendRepository, SpendSubject, TeamRepository,
};

use crate::error::{not_found, persistence};

/// A credential together with its plaintext secret. Returned only from
/// `issue` and `regenerate`; the secret cannot be recovered afterwards.
#[derive(Debug)]
pub struct IssuedCredential {
    pub secret: SecretString,
    pub credential: Credential,
}

#[derive(Clone)]
pub struct CredentialRegistry {
    teams: Arc<dyn TeamRepository>,
    credentials: Arc<dyn CredentialRepository>,
    spend: Arc<dyn SpendRepository>,
}

impl CredentialRegistry {
    pub fn new(
        teams: Arc<dyn TeamRepository>,
        credentials: Arc<dyn CredentialRepository>,
        spend: Arc<dyn SpendRepository>,
    ) -> Self {
        Self { teams, credentials, spend }
    }

    pub async fn issue(&self, credential: NewCredential) -> Result<IssuedCredential, ApplicationError> {
        credential.validate()?;
        let team_id = credential.team_id;
        match self.teams.find_by_id(team_id).await.map_err(persistence)? {
            Some(team) if team.is_active => {}
            _ => return Err(DomainError::InvalidTenant(team_id.to_string()).into()),
        }

        let generated = generate_secret();
        let stored = self
            .credentials
            .insert(credential, &generated.prefix, &generated.hash, Utc::now())
            .await
            .map_err(persistence)?;

        info!(
            event_name = "governance.credential.issued",
            team_id = %stored.team_id,
            credential_id = %stored.id,
            key = %stored.masked_key(),
            "credential issued"
        );
        Ok(IssuedCredential { secret: generated.secret, credential: stored })
    }

    /// Resolves a presented secret to a usable credential.
    ///
    /// Unknown, inactive, expired and over-budget keys all fail with the same
    /// `InvalidCredential`; the specific cause is only logged.
    pub async fn verify(&self, secret: &str) -> Result<Credential, ApplicationError> {
        let presented = hash_secret(secret.trim());
        let Some(credential) =
            self.credentials.find_by_hash(&presented).await.map_err(persistence)?
        else {
            debug!(event_name = "governance.credential.rejected", cause = "unknown", "credential rejected");
            return Err(DomainError::InvalidCredential.into());
        };

        if !constant_time_eq(credential.key_hash.as_bytes(), presented.as_bytes()) {
            return Err(DomainError::InvalidCredential.into());
        }

        let now = Utc::now();
        let spent_today = self.spent_today(credential.id, now).await?;
        if let Err(rejection) = credential.check_usable(now, spent_today) {
            debug!(
                event_name = "governance.credential.rejected",
                credential_id = %credential.id,
                cause = rejection.as_str(),
                "credential rejected"
            );
            return Err(DomainError::InvalidCredential.into());
        }

        self.credentials.touch_last_used(credential.id, now).await.map_err(persistence)?;
        Ok(Credential { last_used_at: Some(now), ..credential })
    }

    pub async fn is_valid(
        &self,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<bool, ApplicationError> {
        let spent_today = self.spent_today(credential.id, now).await?;
        Ok(credential.is_valid(now, spent_today))
    }

    /// Replaces the secret of an existing credential. The old secret stops
    /// verifying as soon as this returns.
    pub async fn regenerate(&self, id: CredentialId) -> Result<IssuedCredential, ApplicationError> {
        let generated = generate_secret();
        let stored = self
            .credentials
            .replace_secret(id, &generated.prefix, &generated.hash, Utc::now())
            .await
            .map_err(persistence)?
            .ok_or_else(|| not_found("credential", id))?;

        info!(
            event_name = "governance.credential.regenerated",
            credential_id = %id,
            key = %stored.masked_key(),
            "credential secret regenerated"
        );
        Ok(IssuedCredential { secret: generated.secret, credential: stored })
    }

    pub async fn revoke(&self, id: CredentialId) -> Result<Credential, ApplicationError> {
        let stored = self
            .credentials
            .set_active(id, false, Utc::now())
            .await
            .map_err(persistence)?
            .ok_or_else(|| not_found("credential", id))?;
        info!(event_name = "governance.credential.revoked", credential_id = %id, "credential revoked");
        Ok(stored)
    }

    pub async fn find(&self, id: CredentialId) -> Result<Credential, ApplicationError> {
        self.credentials
            .find_by_id(id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| not_found("credential", id))
    }

    pub async fn list_for_team(&self, team_id: TeamId) -> Result<Vec<Credential>, ApplicationError> {
        self.credentials.list_for_team(team_id).await.map_err(persistence)
    }

    /// Spend recorded against the credential on the UTC day containing `at`.
    pub async fn spent_today(
        &self,
        id: CredentialId,
        at: DateTime<Utc>,
    ) -> Result<Decimal, ApplicationError> {
        let total = self
            .spend
            .total(SpendSubject::Credential(id), SpendPeriod::day_of(at))
            .await
            .map_err(persistence)?;
        Ok(total.cost)
    }
}
