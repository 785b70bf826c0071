use std::{collections::HashSet, sync::Arc};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::{DateTime, Duration, Utc};
use cookie::{Cookie, SameSite};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::token::{Provider, Token, TokenError};

pub const SESSION_COOKIE_NAME: &str = "auth.session-token";
pub const STATE_COOKIE_NAME: &str = "auth.oauth-state";
pub const OAUTH_STATE_TTL: Duration = Duration::minutes(10);

const SESSION_AUDIENCE: &str = "session";
const STATE_AUDIENCE: &str = "oauth_state";
const DEFAULT_JWT_LEEWAY_SECONDS: u64 = 60;

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid signing secret")]
    InvalidSecret,
    #[error("encryption error")]
    EncryptionError,
    #[error("serialization error")]
    SerializationError,
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    provider: Provider,
    jti: String,
    iat: i64,
    exp: i64,
    aud: String,
    last_activity: i64,
    access_token_expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_refreshed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<TokenError>,
    provider_tokens: String, // AES-GCM sealed ProviderTokens
}

#[derive(Debug, Serialize, Deserialize)]
struct ProviderTokens {
    access_token: String,
    refresh_token: Option<String>,
}

/// CSRF state carried across the provider redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub state: String,
    pub provider: Provider,
    pub callback_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    #[serde(flatten)]
    state: OAuthState,
    exp: i64,
    aud: String,
}

/// Signs and seals tokens into cookie values and builds the cookies that
/// carry them.
#[derive(Clone)]
pub struct SessionCodec {
    secret: Arc<SecretString>,
    secure_cookies: bool,
}

impl SessionCodec {
    pub fn new(secret: SecretString, secure_cookies: bool) -> Self {
        Self {
            secret: Arc::new(secret),
            secure_cookies,
        }
    }

    pub fn encode_token(&self, token: &Token) -> Result<String, CookieError> {
        let sealed = self.seal_provider_tokens(&ProviderTokens {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
        })?;

        let claims = SessionClaims {
            sub: token.subject_id.clone(),
            provider: token.provider,
            jti: token.jti.clone(),
            iat: token.issued_at.timestamp(),
            exp: token.absolute_expiry().timestamp(),
            aud: SESSION_AUDIENCE.to_string(),
            last_activity: token.last_activity.timestamp(),
            access_token_expires_at: token.access_token_expires_at.timestamp(),
            last_refreshed: token.last_refreshed.map(|at| at.timestamp()),
            error: token.error,
            provider_tokens: sealed,
        };

        let key = EncodingKey::from_base64_secret(self.secret.expose_secret())?;
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &key)?)
    }

    pub fn decode_token(&self, value: &str) -> Result<Token, CookieError> {
        if value.trim().is_empty() {
            return Err(CookieError::InvalidToken);
        }

        let validation = validation(SESSION_AUDIENCE, &["sub", "exp", "aud", "jti", "iat"]);
        let key = DecodingKey::from_base64_secret(self.secret.expose_secret())?;
        let claims = decode::<SessionClaims>(value, &key, &validation)?.claims;
        let provider_tokens = self.open_provider_tokens(&claims.provider_tokens)?;

        Ok(Token {
            subject_id: claims.sub,
            provider: claims.provider,
            jti: claims.jti,
            access_token: provider_tokens.access_token,
            refresh_token: provider_tokens.refresh_token,
            access_token_expires_at: timestamp(claims.access_token_expires_at)?,
            issued_at: timestamp(claims.iat)?,
            last_activity: timestamp(claims.last_activity)?,
            last_refreshed: claims.last_refreshed.map(timestamp).transpose()?,
            error: claims.error,
        })
    }

    pub fn encode_state(
        &self,
        state: &OAuthState,
        now: DateTime<Utc>,
    ) -> Result<String, CookieError> {
        let claims = StateClaims {
            state: state.clone(),
            exp: (now + OAUTH_STATE_TTL).timestamp(),
            aud: STATE_AUDIENCE.to_string(),
        };
        let key = EncodingKey::from_base64_secret(self.secret.expose_secret())?;
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &key)?)
    }

    pub fn decode_state(&self, value: &str) -> Result<OAuthState, CookieError> {
        let validation = validation(STATE_AUDIENCE, &["exp", "aud"]);
        let key = DecodingKey::from_base64_secret(self.secret.expose_secret())?;
        Ok(decode::<StateClaims>(value, &key, &validation)?.claims.state)
    }

    pub fn session_cookie(
        &self,
        token: &Token,
        now: DateTime<Utc>,
    ) -> Result<Cookie<'static>, CookieError> {
        let value = self.encode_token(token)?;
        let remaining = (token.absolute_expiry() - now).num_seconds().max(0);
        Ok(self.cookie(SESSION_COOKIE_NAME, value, remaining))
    }

    pub fn state_cookie(
        &self,
        state: &OAuthState,
        now: DateTime<Utc>,
    ) -> Result<Cookie<'static>, CookieError> {
        let value = self.encode_state(state, now)?;
        Ok(self.cookie(STATE_COOKIE_NAME, value, OAUTH_STATE_TTL.num_seconds()))
    }

    /// Cookie that makes the browser drop `name`.
    pub fn removal_cookie(&self, name: &'static str) -> Cookie<'static> {
        self.cookie(name, String::new(), 0)
    }

    fn cookie(&self, name: &'static str, value: String, max_age_seconds: i64) -> Cookie<'static> {
        Cookie::build((name, value))
            .http_only(true)
            .secure(self.secure_cookies)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(time::Duration::seconds(max_age_seconds))
            .build()
    }

    fn seal_provider_tokens(&self, tokens: &ProviderTokens) -> Result<String, CookieError> {
        let json = serde_json::to_vec(tokens).map_err(|_| CookieError::SerializationError)?;
        self.encrypt_data(&json)
    }

    fn open_provider_tokens(&self, sealed: &str) -> Result<ProviderTokens, CookieError> {
        let decrypted = self.decrypt_data(sealed)?;
        serde_json::from_slice(&decrypted).map_err(|_| CookieError::InvalidToken)
    }

    fn encrypt_data(&self, data: &[u8]) -> Result<String, CookieError> {
        let key = Key::<Aes256Gcm>::from(self.derive_key()?);
        let cipher = Aes256Gcm::new(&key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, data)
            .map_err(|_| CookieError::EncryptionError)?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(combined))
    }

    fn decrypt_data(&self, encrypted: &str) -> Result<Vec<u8>, CookieError> {
        let decoded = URL_SAFE_NO_PAD
            .decode(encrypted)
            .map_err(|_| CookieError::InvalidToken)?;

        const NONCE_SIZE: usize = 12; // 96 bits for AES-256-GCM
        if decoded.len() < NONCE_SIZE {
            return Err(CookieError::InvalidToken);
        }

        let key = Key::<Aes256Gcm>::from(self.derive_key()?);
        let cipher = Aes256Gcm::new(&key);
        let nonce_bytes: [u8; NONCE_SIZE] = decoded[..NONCE_SIZE]
            .try_into()
            .map_err(|_| CookieError::InvalidToken)?;
        let nonce = Nonce::from(nonce_bytes);

        cipher
            .decrypt(&nonce, &decoded[NONCE_SIZE..])
            .map_err(|_| CookieError::EncryptionError)
    }

    fn derive_key(&self) -> Result<[u8; 32], CookieError> {
        use sha2::{Digest, Sha256};

        let secret_bytes = STANDARD
            .decode(self.secret.expose_secret())
            .map_err(|_| CookieError::InvalidSecret)?;
        Ok(Sha256::digest(&secret_bytes).into())
    }
}

fn validation(audience: &str, required: &[&str]) -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.validate_nbf = false;
    validation.set_audience(&[audience]);
    validation.required_spec_claims = required
        .iter()
        .map(|claim| claim.to_string())
        .collect::<HashSet<_>>();
    validation.leeway = DEFAULT_JWT_LEEWAY_SECONDS;
    validation
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>, CookieError> {
    DateTime::from_timestamp(seconds, 0).ok_or(CookieError::InvalidToken)
}
