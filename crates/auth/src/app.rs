use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use tracing::instrument;

use crate::{
    AppState,
    auth::{
        AzureAdOAuthProvider, GoogleOAuthProvider, InMemoryRevocationStore, ProviderRegistry,
        RefreshCoordinator, RevocationRegistry, SessionCodec, SessionPipeline, SignInPolicy,
        SignInService, TokenIssuer,
    },
    config::{AuthConfig, AuthServerConfig},
    db::{self, PgRevocationStore},
    routes,
};

const REVOCATION_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Server;

impl Server {
    #[instrument(
        name = "auth_server",
        skip(config),
        fields(listen_addr = %config.listen_addr)
    )]
    pub async fn run(config: AuthServerConfig) -> anyhow::Result<()> {
        let revocations = revocation_store(&config).await?;
        spawn_revocation_purge(revocations.clone());

        let registry = Arc::new(provider_registry(&config.auth)?);
        let pipeline =
            SessionPipeline::new(revocations.clone(), RefreshCoordinator::new(registry.clone()));
        let sign_in = Arc::new(SignInService::new(
            registry,
            SignInPolicy,
            TokenIssuer::new(revocations),
            config.auth.public_base_url().to_string(),
        ));
        let codec = SessionCodec::new(
            config.auth.secret().clone(),
            config.auth.secure_cookies(),
        );

        let state = AppState::new(codec, pipeline, sign_in);

        let router = routes::router(state);
        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .context("listen address is invalid")?;
        let tcp_listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind tcp listener")?;

        tracing::info!(%addr, "auth server listening");

        let make_service = router.into_make_service();

        axum::serve(tcp_listener, make_service)
            .await
            .context("auth server failure")?;

        Ok(())
    }
}

async fn revocation_store(config: &AuthServerConfig) -> anyhow::Result<RevocationRegistry> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!(
            "DATABASE_URL not set; revoked sessions are tracked in memory and lost on restart"
        );
        return Ok(Arc::new(InMemoryRevocationStore::new()));
    };

    let pool = db::create_pool(database_url)
        .await
        .context("failed to create postgres pool")?;

    db::migrate(&pool)
        .await
        .context("failed to run database migrations")?;

    tracing::info!("revocation store backed by postgres");
    Ok(Arc::new(PgRevocationStore::new(pool)))
}

fn provider_registry(auth: &AuthConfig) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if let Some(google) = auth.google() {
        registry.register(GoogleOAuthProvider::new(
            google.client_id().to_string(),
            google.client_secret().clone(),
            auth.refresh_timeout(),
        )?);
        tracing::info!(provider = "google", "OAuth provider enabled");
    }

    if let Some(azure) = auth.azure_ad() {
        registry.register(AzureAdOAuthProvider::new(
            azure.client_id().to_string(),
            azure.client_secret().clone(),
            azure.tenant_id().to_string(),
            auth.refresh_timeout(),
        )?);
        tracing::info!(
            provider = "azure-ad",
            tenant = %azure.tenant_id(),
            "OAuth provider enabled"
        );
    }

    if registry.is_empty() {
        bail!("no OAuth providers configured");
    }

    Ok(registry)
}

fn spawn_revocation_purge(revocations: RevocationRegistry) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REVOCATION_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match revocations.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "purged lapsed token revocations"),
                Err(error) => tracing::warn!(%error, "failed to purge token revocations"),
            }
        }
    });
}
