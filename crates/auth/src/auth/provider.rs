use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Duration;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use super::token::{DEFAULT_ACCESS_TOKEN_TTL, Provider, SESSION_MAX_AGE};

const USER_AGENT: &str = "AuthSessionServer/1.0";

/// Upper bound for any provider round-trip made while serving a request.
pub const MAX_REFRESH_TIMEOUT: StdDuration = StdDuration::from_secs(5);

const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const AZURE_AD_AUTHORITY: &str = "https://login.microsoftonline.com";
const AZURE_AD_SCOPE: &str = "openid profile email offline_access";

#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_in: Option<Duration>,
    pub id_token: Option<SecretString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUser {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Raw profile claims reported by the provider at sign-in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderProfile {
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ProviderIdentity {
    pub user: ProviderUser,
    pub profile: ProviderProfile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub expires_in: Duration,
    /// `None` when the provider did not rotate the refresh token.
    pub refresh_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no refresh strategy registered for provider `{0}`")]
    UnsupportedProvider(Provider),
    #[error("token endpoint rejected refresh with {status}: {detail}")]
    Rejected { status: StatusCode, detail: String },
    #[error("token endpoint timed out")]
    Timeout,
    #[error("token endpoint request failed: {0}")]
    Transport(String),
    #[error("invalid token endpoint response: {0}")]
    InvalidResponse(String),
}

impl RefreshError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Sign-in half of a provider: authorization redirect, code exchange and
/// identity lookup.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn provider(&self) -> Provider;
    fn scopes(&self) -> &[&str];
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<Url>;
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<AuthorizationGrant>;
    async fn fetch_identity(&self, grant: &AuthorizationGrant) -> Result<ProviderIdentity>;
}

/// Provider-specific `refresh_token` grant.
#[async_trait]
pub trait RefreshStrategy: Send + Sync {
    fn provider(&self) -> Provider;
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<Provider, Arc<dyn OAuthProvider>>,
    strategies: HashMap<Provider, Arc<dyn RefreshStrategy>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider for both sign-in and refresh.
    pub fn register<P>(&mut self, provider: P)
    where
        P: OAuthProvider + RefreshStrategy + 'static,
    {
        let provider = Arc::new(provider);
        let key = OAuthProvider::provider(provider.as_ref());
        self.providers.insert(key, provider.clone());
        self.strategies.insert(key, provider);
    }

    pub fn register_provider(&mut self, provider: Arc<dyn OAuthProvider>) {
        self.providers.insert(provider.provider(), provider);
    }

    pub fn register_strategy(&mut self, strategy: Arc<dyn RefreshStrategy>) {
        self.strategies.insert(strategy.provider(), strategy);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn OAuthProvider>> {
        self.providers.get(&provider).cloned()
    }

    pub fn strategy(&self, provider: Provider) -> Result<Arc<dyn RefreshStrategy>, RefreshError> {
        self.strategies
            .get(&provider)
            .cloned()
            .ok_or(RefreshError::UnsupportedProvider(provider))
    }

    /// Providers available for sign-in, in a stable order.
    pub fn sign_in_providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.providers.keys().copied().collect();
        providers.sort_by_key(|provider| provider.as_str());
        providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.strategies.is_empty()
    }
}

fn build_client(timeout: StdDuration) -> Result<Client> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout.min(MAX_REFRESH_TIMEOUT))
        .build()?;
    Ok(client)
}

/// Converts a token endpoint `expires_in` into a lifetime. Values that are not
/// positive or outlive a session are refused.
fn access_token_ttl(seconds: i64) -> Option<Duration> {
    Duration::try_seconds(seconds)
        .filter(|ttl| *ttl > Duration::zero() && *ttl <= SESSION_MAX_AGE)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenEndpointResponse {
    Success {
        access_token: String,
        expires_in: Option<i64>,
        refresh_token: Option<String>,
        id_token: Option<String>,
    },
    Error {
        error: String,
        error_description: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
}

async fn exchange_authorization_code(
    client: &Client,
    endpoint: &str,
    provider: Provider,
    form: &[(&str, &str)],
) -> Result<AuthorizationGrant> {
    let response = client
        .post(endpoint)
        .form(form)
        .send()
        .await?
        .error_for_status()?;

    match response.json::<TokenEndpointResponse>().await? {
        TokenEndpointResponse::Success {
            access_token,
            expires_in,
            refresh_token,
            id_token,
        } => {
            let expires_in = expires_in
                .map(|seconds| {
                    access_token_ttl(seconds).with_context(|| {
                        format!("{provider} token exchange returned expires_in {seconds}")
                    })
                })
                .transpose()?;
            Ok(AuthorizationGrant {
                access_token: SecretString::new(access_token.into()),
                refresh_token: refresh_token.map(|v| SecretString::new(v.into())),
                expires_in,
                id_token: id_token.map(|v| SecretString::new(v.into())),
            })
        }
        TokenEndpointResponse::Error {
            error,
            error_description,
        } => {
            let detail = error_description.unwrap_or_else(|| error.clone());
            anyhow::bail!("{provider} token exchange failed: {detail}")
        }
    }
}

/// Runs a `refresh_token` grant against `endpoint`. Every failure, including
/// non-2xx answers, comes back as a [`RefreshError`] value.
async fn request_refresh(
    client: &Client,
    endpoint: &str,
    form: &[(&str, &str)],
) -> Result<RefreshedTokens, RefreshError> {
    #[derive(Debug, Deserialize)]
    struct RefreshResponse {
        access_token: String,
        #[serde(default)]
        expires_in: Option<i64>,
        #[serde(default)]
        refresh_token: Option<String>,
    }

    let response = client
        .post(endpoint)
        .form(form)
        .send()
        .await
        .map_err(RefreshError::from_reqwest)?;

    let status = response.status();
    if !status.is_success() {
        let detail = response
            .json::<OAuthErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| "unknown_error".to_string());
        return Err(RefreshError::Rejected { status, detail });
    }

    let refreshed: RefreshResponse = response.json().await.map_err(RefreshError::from_reqwest)?;

    let expires_in = match refreshed.expires_in {
        Some(seconds) => access_token_ttl(seconds).ok_or_else(|| {
            RefreshError::InvalidResponse(format!("expires_in out of range: {seconds}"))
        })?,
        None => DEFAULT_ACCESS_TOKEN_TTL,
    };

    Ok(RefreshedTokens {
        access_token: refreshed.access_token,
        expires_in,
        refresh_token: refreshed.refresh_token,
    })
}

pub struct GoogleOAuthProvider {
    client: Client,
    client_id: String,
    client_secret: SecretString,
    token_endpoint: String,
    userinfo_endpoint: String,
}

impl GoogleOAuthProvider {
    pub fn new(
        client_id: String,
        client_secret: SecretString,
        timeout: StdDuration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            client_id,
            client_secret,
            token_endpoint: GOOGLE_TOKEN_URL.to_string(),
            userinfo_endpoint: GOOGLE_USERINFO_URL.to_string(),
        })
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    pub fn with_userinfo_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.userinfo_endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct GoogleUser {
    sub: String,
    email: Option<String>,
    name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    picture: Option<String>,
}

#[async_trait]
impl OAuthProvider for GoogleOAuthProvider {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn scopes(&self) -> &[&str] {
        &["openid", "email", "profile"]
    }

    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<Url> {
        let mut url = Url::parse(GOOGLE_AUTHORIZE_URL)?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("client_id", &self.client_id);
            qp.append_pair("redirect_uri", redirect_uri);
            qp.append_pair("response_type", "code");
            qp.append_pair("scope", &self.scopes().join(" "));
            qp.append_pair("state", state);
            qp.append_pair("access_type", "offline");
            qp.append_pair("prompt", "consent");
        }
        Ok(url)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<AuthorizationGrant> {
        exchange_authorization_code(
            &self.client,
            &self.token_endpoint,
            Provider::Google,
            &[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ],
        )
        .await
    }

    async fn fetch_identity(&self, grant: &AuthorizationGrant) -> Result<ProviderIdentity> {
        let bearer = format!("Bearer {}", grant.access_token.expose_secret());

        let claims: Map<String, Value> = self
            .client
            .get(&self.userinfo_endpoint)
            .header("Authorization", bearer)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse google userinfo response")?;

        let profile: ProviderProfile = serde_json::from_value(Value::Object(claims.clone()))?;
        let user: GoogleUser = serde_json::from_value(Value::Object(claims))
            .context("google userinfo response is missing `sub`")?;

        let name = user
            .name
            .or_else(|| match (user.given_name, user.family_name) {
                (Some(first), Some(last)) => Some(format!("{first} {last}")),
                (Some(first), None) => Some(first),
                (None, Some(last)) => Some(last),
                (None, None) => None,
            });

        Ok(ProviderIdentity {
            user: ProviderUser {
                id: user.sub,
                email: user.email,
                name,
                avatar_url: user.picture,
            },
            profile,
        })
    }
}

#[async_trait]
impl RefreshStrategy for GoogleOAuthProvider {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        request_refresh(
            &self.client,
            &self.token_endpoint,
            &[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }
}

pub struct AzureAdOAuthProvider {
    client: Client,
    client_id: String,
    client_secret: SecretString,
    tenant_id: String,
    authority: String,
}

impl AzureAdOAuthProvider {
    pub fn new(
        client_id: String,
        client_secret: SecretString,
        tenant_id: String,
        timeout: StdDuration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            client_id,
            client_secret,
            tenant_id,
            authority: AZURE_AD_AUTHORITY.to_string(),
        })
    }

    /// Overrides `https://login.microsoftonline.com`; the tenant path is kept.
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, leaf: &str) -> String {
        format!("{}/{}/oauth2/v2.0/{leaf}", self.authority, self.tenant_id)
    }
}

#[derive(Debug, Deserialize)]
struct AzureIdTokenClaims {
    oid: Option<String>,
    sub: Option<String>,
    email: Option<String>,
    preferred_username: Option<String>,
    name: Option<String>,
}

/// Reads the payload of an id_token received straight from the token
/// endpoint over TLS. The signature is not checked here.
fn decode_id_token_claims(id_token: &str) -> Result<Map<String, Value>> {
    let payload = id_token
        .split('.')
        .nth(1)
        .context("id_token is not a JWT")?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("id_token payload is not base64url")?;
    serde_json::from_slice(&bytes).context("id_token payload is not a JSON object")
}

#[async_trait]
impl OAuthProvider for AzureAdOAuthProvider {
    fn provider(&self) -> Provider {
        Provider::AzureAd
    }

    fn scopes(&self) -> &[&str] {
        &["openid", "profile", "email", "offline_access"]
    }

    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint("authorize"))?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("client_id", &self.client_id);
            qp.append_pair("redirect_uri", redirect_uri);
            qp.append_pair("response_type", "code");
            qp.append_pair("response_mode", "query");
            qp.append_pair("scope", &self.scopes().join(" "));
            qp.append_pair("state", state);
        }
        Ok(url)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<AuthorizationGrant> {
        exchange_authorization_code(
            &self.client,
            &self.endpoint("token"),
            Provider::AzureAd,
            &[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
                ("scope", AZURE_AD_SCOPE),
            ],
        )
        .await
    }

    async fn fetch_identity(&self, grant: &AuthorizationGrant) -> Result<ProviderIdentity> {
        let id_token = grant
            .id_token
            .as_ref()
            .context("azure-ad token response did not include an id_token")?;
        let claims = decode_id_token_claims(id_token.expose_secret())?;

        let profile: ProviderProfile = serde_json::from_value(Value::Object(claims.clone()))?;
        let parsed: AzureIdTokenClaims = serde_json::from_value(Value::Object(claims))?;

        let id = parsed
            .oid
            .or(parsed.sub)
            .context("azure-ad id_token has no subject")?;

        Ok(ProviderIdentity {
            user: ProviderUser {
                id,
                email: parsed.email.or(parsed.preferred_username),
                name: parsed.name,
                avatar_url: None,
            },
            profile,
        })
    }
}

#[async_trait]
impl RefreshStrategy for AzureAdOAuthProvider {
    fn provider(&self) -> Provider {
        Provider::AzureAd
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        request_refresh(
            &self.client,
            &self.endpoint("token"),
            &[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", AZURE_AD_SCOPE),
            ],
        )
        .await
    }
}
