use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::{
    provider::{ProviderRegistry, RefreshError, RefreshedTokens},
    token::{Token, TokenError},
};

/// How long before `access_token_expires_at` a refresh becomes due.
pub const REFRESH_WINDOW: Duration = Duration::seconds(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Valid,
    NearExpiry,
    Refreshing,
    Refreshed,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub token: Token,
    /// `Valid` when no refresh was due, `NearExpiry` when one was due but no
    /// refresh token exists, otherwise `Refreshed` or `Degraded`.
    pub state: RefreshState,
}

pub fn assess(token: &Token, now: DateTime<Utc>) -> RefreshState {
    if now >= token.access_token_expires_at - REFRESH_WINDOW {
        RefreshState::NearExpiry
    } else {
        RefreshState::Valid
    }
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    providers: Arc<ProviderRegistry>,
}

impl RefreshCoordinator {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self { providers }
    }

    /// Refreshes the provider access token when it is inside the refresh
    /// window. Never fails: a failed refresh marks the token degraded and
    /// hands it back unchanged otherwise.
    pub async fn maybe_refresh(&self, token: Token, now: DateTime<Utc>) -> RefreshOutcome {
        if assess(&token, now) == RefreshState::Valid {
            return RefreshOutcome {
                token,
                state: RefreshState::Valid,
            };
        }

        let Some(refresh_token) = token.refresh_token.clone() else {
            debug!(
                provider = %token.provider,
                jti = %token.jti,
                "access token near expiry but no refresh token present"
            );
            return RefreshOutcome {
                token,
                state: RefreshState::NearExpiry,
            };
        };

        debug!(
            provider = %token.provider,
            jti = %token.jti,
            state = ?RefreshState::Refreshing,
            "refreshing provider access token"
        );

        let result = match self.providers.strategy(token.provider) {
            Ok(strategy) => strategy.refresh(&refresh_token).await,
            Err(err) => Err(err),
        };
        let result = result.and_then(|refreshed| {
            let expires_at = now.checked_add_signed(refreshed.expires_in).ok_or_else(|| {
                RefreshError::InvalidResponse("access token expiry out of range".into())
            })?;
            Ok((refreshed, expires_at))
        });

        match result {
            Ok((refreshed, expires_at)) => RefreshOutcome {
                token: apply_refresh(token, refreshed, expires_at, now),
                state: RefreshState::Refreshed,
            },
            Err(err) => RefreshOutcome {
                token: degrade(token, &err),
                state: RefreshState::Degraded,
            },
        }
    }
}

fn apply_refresh(
    mut token: Token,
    refreshed: RefreshedTokens,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Token {
    // Expiry never moves backwards.
    if expires_at > token.access_token_expires_at {
        token.access_token_expires_at = expires_at;
    }
    token.access_token = refreshed.access_token;
    if let Some(rotated) = refreshed.refresh_token {
        token.refresh_token = Some(rotated);
    }
    token.last_refreshed = Some(now);
    token.error = None;

    info!(
        provider = %token.provider,
        jti = %token.jti,
        access_token_expires_at = %token.access_token_expires_at,
        last_refreshed = %now,
        "provider access token refreshed"
    );
    token
}

fn degrade(mut token: Token, err: &RefreshError) -> Token {
    match err {
        RefreshError::UnsupportedProvider(provider) => error!(
            provider = %provider,
            jti = %token.jti,
            "no refresh strategy registered for provider; session degraded"
        ),
        other => warn!(
            provider = %token.provider,
            jti = %token.jti,
            error = %other,
            "provider access token refresh failed; session degraded"
        ),
    }
    token.error = Some(TokenError::RefreshAccessTokenError);
    token
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use super::*;
    use crate::auth::{
        provider::RefreshStrategy,
        token::{Provider, fixtures},
    };

    /// Strategy double that counts invocations and replays a canned answer.
    pub(crate) struct StubStrategy {
        pub provider: Provider,
        pub calls: AtomicUsize,
        pub answer: Mutex<Option<Result<RefreshedTokens, RefreshError>>>,
    }

    impl StubStrategy {
        pub(crate) fn succeeding(provider: Provider, refreshed: RefreshedTokens) -> Arc<Self> {
            Arc::new(Self {
                provider,
                calls: AtomicUsize::new(0),
                answer: Mutex::new(Some(Ok(refreshed))),
            })
        }

        pub(crate) fn failing(provider: Provider, err: RefreshError) -> Arc<Self> {
            Arc::new(Self {
                provider,
                calls: AtomicUsize::new(0),
                answer: Mutex::new(Some(Err(err))),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshStrategy for StubStrategy {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(RefreshError::Transport("no answer left".into())))
        }
    }

    fn coordinator(strategy: Arc<StubStrategy>) -> RefreshCoordinator {
        let mut registry = ProviderRegistry::new();
        registry.register_strategy(strategy);
        RefreshCoordinator::new(Arc::new(registry))
    }

    fn new_tokens() -> RefreshedTokens {
        RefreshedTokens {
            access_token: "new".to_string(),
            expires_in: Duration::seconds(3600),
            refresh_token: None,
        }
    }

    #[test]
    fn window_opens_exactly_300_seconds_before_expiry() {
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(301));
        assert_eq!(assess(&token, now), RefreshState::Valid);
        let token = fixtures::token(now, Duration::seconds(300));
        assert_eq!(assess(&token, now), RefreshState::NearExpiry);
        let token = fixtures::token(now, Duration::seconds(-10));
        assert_eq!(assess(&token, now), RefreshState::NearExpiry);
    }

    #[tokio::test]
    async fn no_refresh_outside_window() {
        let strategy = StubStrategy::succeeding(Provider::Google, new_tokens());
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(301));

        let outcome = coordinator(strategy.clone())
            .maybe_refresh(token.clone(), now)
            .await;

        assert_eq!(outcome.state, RefreshState::Valid);
        assert_eq!(outcome.token, token);
        assert_eq!(strategy.calls(), 0);
    }

    #[tokio::test]
    async fn refresh_inside_window_replaces_access_token() {
        let strategy = StubStrategy::succeeding(Provider::Google, new_tokens());
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(200));

        let outcome = coordinator(strategy.clone())
            .maybe_refresh(token.clone(), now)
            .await;

        assert_eq!(strategy.calls(), 1);
        assert_eq!(outcome.state, RefreshState::Refreshed);
        assert_eq!(outcome.token.access_token, "new");
        assert_eq!(
            outcome.token.access_token_expires_at,
            now + Duration::seconds(3600)
        );
        assert_eq!(outcome.token.jti, token.jti);
        assert_eq!(outcome.token.refresh_token, token.refresh_token);
        assert_eq!(outcome.token.last_refreshed, Some(now));
        assert_eq!(assess(&outcome.token, now), RefreshState::Valid);
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_old_one() {
        let strategy = StubStrategy::succeeding(
            Provider::Google,
            RefreshedTokens {
                refresh_token: Some("rotated".to_string()),
                ..new_tokens()
            },
        );
        let now = Utc::now();
        let outcome = coordinator(strategy)
            .maybe_refresh(fixtures::token(now, Duration::seconds(10)), now)
            .await;
        assert_eq!(outcome.token.refresh_token.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn expiry_never_moves_backwards() {
        let strategy = StubStrategy::succeeding(
            Provider::Google,
            RefreshedTokens {
                expires_in: Duration::seconds(60),
                ..new_tokens()
            },
        );
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(200));
        let outcome = coordinator(strategy).maybe_refresh(token.clone(), now).await;
        assert_eq!(
            outcome.token.access_token_expires_at,
            token.access_token_expires_at
        );
    }

    #[tokio::test]
    async fn unrepresentable_expiry_degrades_instead_of_panicking() {
        let strategy = StubStrategy::succeeding(
            Provider::Google,
            RefreshedTokens {
                expires_in: Duration::MAX,
                ..new_tokens()
            },
        );
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(10));

        let outcome = coordinator(strategy.clone())
            .maybe_refresh(token.clone(), now)
            .await;

        assert_eq!(strategy.calls(), 1);
        assert_eq!(outcome.state, RefreshState::Degraded);
        assert_eq!(outcome.token.access_token, token.access_token);
        assert_eq!(
            outcome.token.access_token_expires_at,
            token.access_token_expires_at
        );
        assert!(outcome.token.is_degraded());
    }

    #[tokio::test]
    async fn missing_refresh_token_skips_refresh() {
        let strategy = StubStrategy::succeeding(Provider::Google, new_tokens());
        let now = Utc::now();
        let mut token = fixtures::token(now, Duration::seconds(10));
        token.refresh_token = None;

        let outcome = coordinator(strategy.clone())
            .maybe_refresh(token.clone(), now)
            .await;

        assert_eq!(strategy.calls(), 0);
        assert_eq!(outcome.state, RefreshState::NearExpiry);
        assert_eq!(outcome.token, token);
    }

    #[tokio::test]
    async fn failure_degrades_but_keeps_token() {
        let strategy = StubStrategy::failing(
            Provider::Google,
            RefreshError::Rejected {
                status: StatusCode::BAD_REQUEST,
                detail: "invalid_grant".into(),
            },
        );
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(10));

        let outcome = coordinator(strategy.clone())
            .maybe_refresh(token.clone(), now)
            .await;

        assert_eq!(strategy.calls(), 1);
        assert_eq!(outcome.state, RefreshState::Degraded);
        assert_eq!(outcome.token.error, Some(TokenError::RefreshAccessTokenError));
        assert_eq!(outcome.token.access_token, token.access_token);
        assert_eq!(outcome.token.jti, token.jti);
    }

    #[tokio::test]
    async fn unsupported_provider_degrades() {
        let strategy = StubStrategy::succeeding(Provider::Google, new_tokens());
        let now = Utc::now();
        let mut token = fixtures::token(now, Duration::seconds(10));
        token.provider = Provider::Credentials;

        let outcome = coordinator(strategy.clone()).maybe_refresh(token, now).await;

        assert_eq!(strategy.calls(), 0);
        assert_eq!(outcome.state, RefreshState::Degraded);
        assert!(outcome.token.is_degraded());
    }

    #[tokio::test]
    async fn success_clears_previous_degradation() {
        let strategy = StubStrategy::succeeding(Provider::Google, new_tokens());
        let now = Utc::now();
        let mut token = fixtures::token(now, Duration::seconds(10));
        token.error = Some(TokenError::RefreshAccessTokenError);

        let outcome = coordinator(strategy).maybe_refresh(token, now).await;
        assert!(outcome.token.error.is_none());
    }
}
