use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use super::{
    provider::{AuthorizationGrant, ProviderUser},
    revocation::{RevocationRegistry, RevocationStoreError},
    token::{DEFAULT_ACCESS_TOKEN_TTL, Provider, Token},
};

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("generated token id `{0}` collides with a known token id")]
    JtiCollision(String),
    #[error(transparent)]
    Store(#[from] RevocationStoreError),
}

/// Provider credentials obtained from a completed sign-in.
#[derive(Debug, Clone)]
pub struct ProviderAccount {
    pub provider: Provider,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProviderAccount {
    pub fn from_grant(provider: Provider, grant: &AuthorizationGrant, now: DateTime<Utc>) -> Self {
        Self {
            provider,
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone(),
            expires_at: grant
                .expires_in
                .and_then(|ttl| now.checked_add_signed(ttl)),
        }
    }
}

fn generate_jti() -> String {
    Uuid::new_v4().to_string()
}

pub struct TokenIssuer {
    revocations: RevocationRegistry,
    jti_source: fn() -> String,
}

impl TokenIssuer {
    pub fn new(revocations: RevocationRegistry) -> Self {
        Self {
            revocations,
            jti_source: generate_jti,
        }
    }

    #[cfg(test)]
    fn with_jti_source(mut self, jti_source: fn() -> String) -> Self {
        self.jti_source = jti_source;
        self
    }

    /// Builds the initial token for a sign-in that already passed the
    /// [`SignInPolicy`](super::policy::SignInPolicy).
    ///
    /// A freshly generated id that the revocation store already knows is a
    /// fatal error; it is never retried.
    pub async fn issue(
        &self,
        account: ProviderAccount,
        user: &ProviderUser,
        now: DateTime<Utc>,
    ) -> Result<Token, IssueError> {
        let jti = (self.jti_source)();
        if self.revocations.contains(&jti).await? {
            error!(jti = %jti, provider = %account.provider, "token id collision at issuance");
            return Err(IssueError::JtiCollision(jti));
        }

        let access_token_expires_at = account
            .expires_at
            .unwrap_or(now + DEFAULT_ACCESS_TOKEN_TTL);

        info!(
            provider = %account.provider,
            subject = %user.id,
            jti = %jti,
            has_refresh_token = account.refresh_token.is_some(),
            "issued session token"
        );

        Ok(Token {
            subject_id: user.id.clone(),
            provider: account.provider,
            jti,
            access_token: account.access_token.expose_secret().to_string(),
            refresh_token: account
                .refresh_token
                .as_ref()
                .map(|token| token.expose_secret().to_string()),
            access_token_expires_at,
            issued_at: now,
            last_activity: now,
            last_refreshed: None,
            error: None,
        })
    }
}
