use std::sync::Arc;

use anyhow::Error as AnyhowError;
use chrono::{DateTime, Utc};
use rand::{Rng, distr::Alphanumeric};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use super::{
    cookie::OAuthState,
    issuer::{IssueError, ProviderAccount, TokenIssuer},
    policy::{DenyReason, SignInDecision, SignInPolicy},
    provider::{OAuthProvider, ProviderRegistry},
    token::{Provider, Token},
};

const STATE_LENGTH: usize = 48;
const CALLBACK_BASE: &str = "http://callback.invalid";

/// Why a provider callback did not match the sign-in it claims to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("state cookie missing or invalid")]
    MissingCookie,
    #[error("state parameter missing")]
    MissingState,
    #[error("state does not match the cookie")]
    Mismatch,
    #[error("authorization code missing")]
    MissingCode,
}

#[derive(Debug, Error)]
pub enum SignInError {
    #[error("sign-in rejected: {}", .0.as_str())]
    Rejected(DenyReason),
    #[error("provider `{0}` is not configured for sign-in")]
    UnsupportedProvider(Provider),
    #[error(transparent)]
    Provider(#[from] AnyhowError),
    #[error(transparent)]
    Issue(#[from] IssueError),
    #[error("invalid oauth state: {0}")]
    State(#[from] StateError),
}

#[derive(Debug, Clone)]
pub struct SignInStart {
    pub authorize_url: Url,
    pub state: OAuthState,
}

/// Drives an OAuth sign-in from the authorization redirect to the first
/// [`Token`].
pub struct SignInService {
    providers: Arc<ProviderRegistry>,
    policy: SignInPolicy,
    issuer: TokenIssuer,
    public_origin: String,
}

impl SignInService {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        policy: SignInPolicy,
        issuer: TokenIssuer,
        public_origin: String,
    ) -> Self {
        let trimmed_origin = public_origin.trim_end_matches('/').to_string();
        Self {
            providers,
            policy,
            issuer,
            public_origin: trimmed_origin,
        }
    }

    pub fn providers(&self) -> Arc<ProviderRegistry> {
        Arc::clone(&self.providers)
    }

    /// The `AUTH_URL` this service is served from, without a trailing `/`.
    pub fn public_origin(&self) -> &str {
        &self.public_origin
    }

    pub fn redirect_uri(&self, provider: Provider) -> String {
        format!("{}/api/auth/callback/{}", self.public_origin, provider)
    }

    pub fn begin(
        &self,
        provider: Provider,
        callback_url: &str,
    ) -> Result<SignInStart, SignInError> {
        let oauth = self.provider(provider)?;
        let state = OAuthState {
            state: generate_state(),
            provider,
            callback_url: sanitize_callback_url(callback_url),
        };
        let authorize_url = oauth.authorize_url(&state.state, &self.redirect_uri(provider))?;
        Ok(SignInStart {
            authorize_url,
            state,
        })
    }

    /// Validates the provider callback against the state cookie and signs the
    /// user in.
    pub async fn complete(
        &self,
        provider: Provider,
        expected: Option<&OAuthState>,
        state: Option<&str>,
        code: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Token, SignInError> {
        let expected = expected.ok_or(StateError::MissingCookie)?;
        let state = state.ok_or(StateError::MissingState)?;
        if expected.state != state || expected.provider != provider {
            return Err(StateError::Mismatch.into());
        }

        if let Some(error) = error {
            warn!(provider = %provider, error = %error, "provider returned an authorization error");
            return Err(SignInError::Provider(anyhow::anyhow!(
                "{provider} authorization failed: {error}"
            )));
        }

        let code = code.ok_or(StateError::MissingCode)?;
        self.sign_in(provider, code, now).await
    }

    /// Exchanges `code`, runs the sign-in policy and issues the first token.
    /// A denied sign-in never produces a token.
    pub async fn sign_in(
        &self,
        provider: Provider,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Token, SignInError> {
        let oauth = self.provider(provider)?;
        let grant = oauth.exchange_code(code, &self.redirect_uri(provider)).await?;
        let identity = oauth.fetch_identity(&grant).await?;

        if let SignInDecision::Deny(reason) =
            self.policy.evaluate(provider, &identity.user, &identity.profile)
        {
            return Err(SignInError::Rejected(reason));
        }

        let account = ProviderAccount::from_grant(provider, &grant, now);
        let token = self.issuer.issue(account, &identity.user, now).await?;
        info!(
            provider = %provider,
            subject = %token.subject_id,
            jti = %token.jti,
            "user signed in"
        );
        Ok(token)
    }

    fn provider(&self, provider: Provider) -> Result<Arc<dyn OAuthProvider>, SignInError> {
        self.providers
            .get(provider)
            .ok_or(SignInError::UnsupportedProvider(provider))
    }
}

/// Only same-origin relative paths survive; everything else becomes `/`.
///
/// Browsers drop tabs and newlines from a `Location` and read `\` as `/`,
/// so any of those anywhere in the path disqualifies it.
pub fn sanitize_callback_url(callback_url: &str) -> String {
    let candidate = callback_url.trim();
    let is_plain_path = candidate.starts_with('/')
        && !candidate.starts_with("//")
        && !candidate.contains('\\')
        && !candidate
            .chars()
            .any(|c| c.is_control() || c.is_whitespace());
    if is_plain_path && stays_on_origin(candidate) {
        candidate.to_string()
    } else {
        "/".to_string()
    }
}

fn stays_on_origin(path: &str) -> bool {
    let Ok(base) = Url::parse(CALLBACK_BASE) else {
        return false;
    };
    base.join(path)
        .is_ok_and(|resolved| resolved.origin() == base.origin())
}

fn generate_state() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LENGTH)
        .map(char::from)
        .collect()
}
