use std::{env, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use secrecy::SecretString;
use thiserror::Error;

const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 5;
const MAX_REFRESH_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct AuthServerConfig {
    pub database_url: Option<String>,
    pub listen_addr: String,
    pub auth: AuthConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable `{0}` is not set")]
    MissingVar(&'static str),
    #[error("invalid value for environment variable `{0}`")]
    InvalidVar(&'static str),
    #[error("no OAuth providers configured")]
    NoOAuthProviders,
}

impl AuthServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let listen_addr =
            env::var("AUTH_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let auth = AuthConfig::from_env()?;

        Ok(Self {
            database_url,
            listen_addr,
            auth,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    client_id: String,
    client_secret: SecretString,
}

impl OAuthProviderConfig {
    fn new(client_id: String, client_secret: SecretString) -> Self {
        Self {
            client_id,
            client_secret,
        }
    }

    fn from_env(
        id_var: &'static str,
        secret_var: &'static str,
    ) -> Result<Option<Self>, ConfigError> {
        match env::var(id_var) {
            Ok(client_id) if !client_id.is_empty() => {
                let client_secret =
                    env::var(secret_var).map_err(|_| ConfigError::MissingVar(secret_var))?;
                Ok(Some(Self::new(
                    client_id,
                    SecretString::new(client_secret.into()),
                )))
            }
            _ => Ok(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &SecretString {
        &self.client_secret
    }
}

#[derive(Debug, Clone)]
pub struct AzureAdConfig {
    oauth: OAuthProviderConfig,
    tenant_id: String,
}

impl AzureAdConfig {
    pub fn client_id(&self) -> &str {
        self.oauth.client_id()
    }

    pub fn client_secret(&self) -> &SecretString {
        self.oauth.client_secret()
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    google: Option<OAuthProviderConfig>,
    azure_ad: Option<AzureAdConfig>,
    secret: SecretString,
    public_base_url: String,
    refresh_timeout: Duration,
    production: bool,
}

impl AuthConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let secret = env::var("AUTH_SECRET").map_err(|_| ConfigError::MissingVar("AUTH_SECRET"))?;
        validate_auth_secret(&secret)?;
        let secret = SecretString::new(secret.into());

        let google = OAuthProviderConfig::from_env("GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET")?;

        let azure_ad =
            match OAuthProviderConfig::from_env("AZURE_AD_CLIENT_ID", "AZURE_AD_CLIENT_SECRET")? {
                Some(oauth) => {
                    let tenant_id = env::var("AZURE_AD_TENANT_ID")
                        .map_err(|_| ConfigError::MissingVar("AZURE_AD_TENANT_ID"))?;
                    Some(AzureAdConfig { oauth, tenant_id })
                }
                None => None,
            };

        if google.is_none() && azure_ad.is_none() {
            return Err(ConfigError::NoOAuthProviders);
        }

        let public_base_url =
            env::var("AUTH_URL").unwrap_or_else(|_| "http://localhost:3000".into());

        let refresh_timeout = match env::var("AUTH_REFRESH_TIMEOUT_SECS") {
            Ok(value) => parse_refresh_timeout(&value)?,
            Err(_) => Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
        };

        let production = match env::var("APP_ENV") {
            Ok(value) => value.eq_ignore_ascii_case("production"),
            Err(_) => !cfg!(debug_assertions),
        };

        Ok(Self {
            google,
            azure_ad,
            secret,
            public_base_url,
            refresh_timeout,
            production,
        })
    }

    pub fn google(&self) -> Option<&OAuthProviderConfig> {
        self.google.as_ref()
    }

    pub fn azure_ad(&self) -> Option<&AzureAdConfig> {
        self.azure_ad.as_ref()
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn public_base_url(&self) -> &str {
        &self.public_base_url
    }

    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    /// `Secure` is only set for https deployments running as production.
    pub fn secure_cookies(&self) -> bool {
        self.production && self.public_base_url.starts_with("https://")
    }
}

fn parse_refresh_timeout(value: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidVar("AUTH_REFRESH_TIMEOUT_SECS"))?;
    if !(1..=MAX_REFRESH_TIMEOUT_SECS).contains(&secs) {
        return Err(ConfigError::InvalidVar("AUTH_REFRESH_TIMEOUT_SECS"));
    }
    Ok(Duration::from_secs(secs))
}

fn validate_auth_secret(secret: &str) -> Result<(), ConfigError> {
    let decoded = BASE64_STANDARD
        .decode(secret.as_bytes())
        .map_err(|_| ConfigError::InvalidVar("AUTH_SECRET"))?;

    if decoded.len() < 32 {
        return Err(ConfigError::InvalidVar("AUTH_SECRET"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_secret_must_decode_to_32_bytes() {
        let short = BASE64_STANDARD.encode([7u8; 16]);
        let long = BASE64_STANDARD.encode([7u8; 32]);

        assert!(matches!(
            validate_auth_secret(&short),
            Err(ConfigError::InvalidVar("AUTH_SECRET"))
        ));
        assert!(validate_auth_secret("not base64!").is_err());
        assert!(validate_auth_secret(&long).is_ok());
    }

    #[test]
    fn refresh_timeout_is_bounded() {
        assert_eq!(parse_refresh_timeout("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_refresh_timeout(" 5 ").unwrap(), Duration::from_secs(5));
        assert!(parse_refresh_timeout("0").is_err());
        assert!(parse_refresh_timeout("30").is_err());
        assert!(parse_refresh_timeout("soon").is_err());
    }

    #[test]
    fn secure_cookies_need_https_and_production() {
        let config = |url: &str, production| AuthConfig {
            google: None,
            azure_ad: None,
            secret: SecretString::new("c2VjcmV0".into()),
            public_base_url: url.to_string(),
            refresh_timeout: Duration::from_secs(5),
            production,
        };

        assert!(config("https://app.example.com", true).secure_cookies());
        assert!(!config("https://app.example.com", false).secure_cookies());
        assert!(!config("http://localhost:3000", true).secure_cookies());
    }
}
