use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, warn};

use super::{
    refresh::{RefreshCoordinator, RefreshState},
    revocation::{RevocationRegistry, RevocationStoreError},
    token::{SESSION_UPDATE_AGE, Token},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session token has been revoked")]
    Revoked,
    #[error("session exceeded its maximum lifetime")]
    Expired,
    #[error("revocation store unavailable")]
    Store(#[from] RevocationStoreError),
}

#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub token: Token,
    pub refresh_state: RefreshState,
}

/// Per-request token evaluation:
/// `check_revocation -> check_lifetime -> maybe_refresh -> touch_activity`.
#[derive(Clone)]
pub struct SessionPipeline {
    revocations: RevocationRegistry,
    coordinator: RefreshCoordinator,
}

impl SessionPipeline {
    pub fn new(revocations: RevocationRegistry, coordinator: RefreshCoordinator) -> Self {
        Self {
            revocations,
            coordinator,
        }
    }

    pub fn revocations(&self) -> &RevocationRegistry {
        &self.revocations
    }

    pub async fn resolve(
        &self,
        token: Token,
        now: DateTime<Utc>,
    ) -> Result<ResolvedToken, SessionError> {
        let token = self.check_revocation(token).await?;
        let token = check_lifetime(token, now)?;
        let outcome = self.coordinator.maybe_refresh(token, now).await;
        Ok(ResolvedToken {
            token: touch_activity(outcome.token, now),
            refresh_state: outcome.state,
        })
    }

    /// Marks the token's id as revoked until the session would have expired.
    pub async fn revoke(&self, token: &Token) -> Result<(), RevocationStoreError> {
        self.revocations
            .add(&token.jti, token.absolute_expiry())
            .await
    }

    async fn check_revocation(&self, token: Token) -> Result<Token, SessionError> {
        match self.revocations.contains(&token.jti).await {
            Ok(false) => Ok(token),
            Ok(true) => {
                warn!(
                    jti = %token.jti,
                    subject = %token.subject_id,
                    "rejected revoked session token"
                );
                Err(SessionError::Revoked)
            }
            Err(err) => {
                error!(jti = %token.jti, error = %err, "revocation lookup failed");
                Err(SessionError::Store(err))
            }
        }
    }
}

fn check_lifetime(token: Token, now: DateTime<Utc>) -> Result<Token, SessionError> {
    if token.is_past_absolute_expiry(now) {
        return Err(SessionError::Expired);
    }
    Ok(token)
}

fn touch_activity(mut token: Token, now: DateTime<Utc>) -> Token {
    token.last_activity = now;
    token
}

/// Whether the session cookie has to be rewritten after resolving `original`.
pub fn should_reissue(original: &Token, resolved: &ResolvedToken, now: DateTime<Utc>) -> bool {
    resolved.refresh_state == RefreshState::Refreshed
        || original.error != resolved.token.error
        || now - original.last_activity >= SESSION_UPDATE_AGE
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::auth::{
        provider::{ProviderRegistry, RefreshError, RefreshStrategy, RefreshedTokens},
        refresh::tests::StubStrategy,
        revocation::{InMemoryRevocationStore, RevocationStore},
        token::{Provider, fixtures},
    };

    fn refreshed() -> RefreshedTokens {
        RefreshedTokens {
            access_token: "new".to_string(),
            expires_in: Duration::seconds(3600),
            refresh_token: None,
        }
    }

    fn pipeline(
        store: Arc<InMemoryRevocationStore>,
        strategy: Arc<dyn RefreshStrategy>,
    ) -> SessionPipeline {
        let mut registry = ProviderRegistry::new();
        registry.register_strategy(strategy);
        SessionPipeline::new(store, RefreshCoordinator::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn revoked_token_fails_fast_without_refresh() {
        let store = Arc::new(InMemoryRevocationStore::new());
        let strategy = StubStrategy::succeeding(Provider::Google, refreshed());
        let pipeline = pipeline(store.clone(), strategy.clone());
        let now = Utc::now();

        // Inside the refresh window, but revoked first.
        let token = fixtures::token(now, Duration::seconds(10));
        pipeline.revoke(&token).await.unwrap();

        let err = pipeline.resolve(token, now).await.unwrap_err();
        assert!(matches!(err, SessionError::Revoked));
        assert_eq!(strategy.calls(), 0);
    }

    #[tokio::test]
    async fn revocation_ignores_access_token_expiry() {
        let store = Arc::new(InMemoryRevocationStore::new());
        let pipeline = pipeline(
            store.clone(),
            StubStrategy::succeeding(Provider::Google, refreshed()),
        );
        let now = Utc::now();

        for expires_in in [Duration::hours(5), Duration::seconds(-30)] {
            let token = fixtures::token(now, expires_in);
            store
                .add(&token.jti, now + Duration::days(30))
                .await
                .unwrap();
            assert!(matches!(
                pipeline.resolve(token, now).await,
                Err(SessionError::Revoked)
            ));
        }
    }

    #[tokio::test]
    async fn valid_token_is_touched() {
        let store = Arc::new(InMemoryRevocationStore::new());
        let strategy = StubStrategy::succeeding(Provider::Google, refreshed());
        let pipeline = pipeline(store, strategy.clone());
        let issued = Utc::now();
        let token = fixtures::token(issued, Duration::hours(2));
        let later = issued + Duration::minutes(30);

        let resolved = pipeline.resolve(token.clone(), later).await.unwrap();
        assert_eq!(resolved.refresh_state, RefreshState::Valid);
        assert_eq!(resolved.token.last_activity, later);
        assert_eq!(resolved.token.issued_at, token.issued_at);
        assert_eq!(strategy.calls(), 0);
    }

    #[tokio::test]
    async fn near_expiry_token_is_refreshed() {
        let store = Arc::new(InMemoryRevocationStore::new());
        let pipeline = pipeline(
            store,
            StubStrategy::succeeding(Provider::Google, refreshed()),
        );
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(200));

        let resolved = pipeline.resolve(token.clone(), now).await.unwrap();
        assert_eq!(resolved.refresh_state, RefreshState::Refreshed);
        assert_eq!(resolved.token.access_token, "new");
        assert_eq!(
            resolved.token.access_token_expires_at,
            now + Duration::seconds(3600)
        );
        assert_eq!(resolved.token.jti, token.jti);
        assert!(should_reissue(&token, &resolved, now));
    }

    #[tokio::test]
    async fn failed_refresh_still_resolves() {
        let store = Arc::new(InMemoryRevocationStore::new());
        let pipeline = pipeline(
            store,
            StubStrategy::failing(Provider::Google, RefreshError::Timeout),
        );
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(10));

        let resolved = pipeline.resolve(token.clone(), now).await.unwrap();
        assert_eq!(resolved.refresh_state, RefreshState::Degraded);
        assert!(resolved.token.is_degraded());
        assert!(should_reissue(&token, &resolved, now));
    }

    #[tokio::test]
    async fn session_expires_after_thirty_days() {
        let store = Arc::new(InMemoryRevocationStore::new());
        let pipeline = pipeline(
            store,
            StubStrategy::succeeding(Provider::Google, refreshed()),
        );
        let issued = Utc::now();
        let token = fixtures::token(issued, Duration::hours(1));

        let err = pipeline
            .resolve(token, issued + Duration::days(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Expired));
    }

    /// Revokes the session while its refresh is in flight.
    struct RevokingStrategy {
        store: Arc<InMemoryRevocationStore>,
        jti: String,
    }

    #[async_trait]
    impl RefreshStrategy for RevokingStrategy {
        fn provider(&self) -> Provider {
            Provider::Google
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
            self.store
                .add(&self.jti, Utc::now() + Duration::days(30))
                .await
                .unwrap();
            Ok(refreshed())
        }
    }

    #[tokio::test]
    async fn revocation_during_refresh_wins_on_next_validation() {
        let store = Arc::new(InMemoryRevocationStore::new());
        let now = Utc::now();
        let token = fixtures::token(now, Duration::seconds(10));
        let pipeline = pipeline(
            store.clone(),
            Arc::new(RevokingStrategy {
                store: store.clone(),
                jti: token.jti.clone(),
            }),
        );

        let resolved = pipeline.resolve(token, now).await.unwrap();
        assert_eq!(resolved.refresh_state, RefreshState::Refreshed);

        let err = pipeline
            .resolve(resolved.token, now + Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Revoked));
    }

    #[test]
    fn reissue_is_throttled_to_once_per_day() {
        let issued = Utc::now();
        let token = fixtures::token(issued, Duration::hours(2));
        let unchanged = |now| ResolvedToken {
            token: touch_activity(token.clone(), now),
            refresh_state: RefreshState::Valid,
        };

        let soon = issued + Duration::hours(1);
        assert!(!should_reissue(&token, &unchanged(soon), soon));
        let next_day = issued + Duration::hours(24);
        assert!(should_reissue(&token, &unchanged(next_day), next_day));
    }
}
