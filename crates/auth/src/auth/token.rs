use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute session lifetime, measured from `issued_at`.
pub const SESSION_MAX_AGE: Duration = Duration::days(30);
/// Minimum age of `last_activity` before the session cookie is rewritten.
pub const SESSION_UPDATE_AGE: Duration = Duration::hours(24);
/// Lifetime assumed for provider access tokens issued without `expires_in`.
pub const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::seconds(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Google,
    AzureAd,
    Credentials,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::AzureAd => "azure-ad",
            Provider::Credentials => "credentials",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown provider `{0}`")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "google" => Ok(Provider::Google),
            "azure-ad" | "azuread" | "azure_ad" => Ok(Provider::AzureAd),
            "credentials" => Ok(Provider::Credentials),
            _ => Err(UnknownProvider(value.to_string())),
        }
    }
}

/// Degradation marker carried by a token whose last refresh attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenError {
    #[serde(rename = "RefreshAccessTokenError")]
    RefreshAccessTokenError,
}

/// Internal session token. Reconstructed from the session cookie on every
/// request and never handed to consumers directly; see [`Session`].
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub subject_id: String,
    pub provider: Provider,
    pub jti: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub error: Option<TokenError>,
}

impl Token {
    pub fn absolute_expiry(&self) -> DateTime<Utc> {
        self.issued_at + SESSION_MAX_AGE
    }

    pub fn is_past_absolute_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.absolute_expiry()
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

// Provider secrets stay out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("subject_id", &self.subject_id)
            .field("provider", &self.provider)
            .field("jti", &self.jti)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("issued_at", &self.issued_at)
            .field("last_activity", &self.last_activity)
            .field("last_refreshed", &self.last_refreshed)
            .field("error", &self.error)
            .finish()
    }
}

/// Public view of a token, safe to hand to the UI/API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub provider: Provider,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn token(now: DateTime<Utc>, expires_in: Duration) -> Token {
        Token {
            subject_id: "user-1".to_string(),
            provider: Provider::Google,
            jti: "jti-1".to_string(),
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            access_token_expires_at: now + expires_in,
            issued_at: now,
            last_activity: now,
            last_refreshed: None,
            error: None,
        }
    }
}
