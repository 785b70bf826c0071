mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod routes;
mod state;

use std::{env, sync::OnceLock};

pub use app::Server;
use sentry_tracing::{EventFilter, SentryLayer};
pub use state::AppState;
use tracing::Level;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::{Layer as _, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::auth::Provider;

static INIT_GUARD: OnceLock<Option<sentry::ClientInitGuard>> = OnceLock::new();

pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }

    let env_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info,sqlx=warn".to_string());
    let fmt_layer = fmt::layer()
        .json()
        .with_target(false)
        .with_span_events(FmtSpan::CLOSE)
        .boxed();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .with(sentry_enabled().then(sentry_layer))
        .init();
}

fn environment() -> &'static str {
    if cfg!(debug_assertions) {
        "dev"
    } else {
        "production"
    }
}

fn sentry_enabled() -> bool {
    INIT_GUARD.get().is_some_and(Option::is_some)
}

/// Initialises Sentry when `SENTRY_DSN` is set; a no-op otherwise.
pub fn sentry_init_once() {
    INIT_GUARD.get_or_init(|| {
        let dsn = env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;
        let guard = sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                environment: Some(environment().into()),
                ..Default::default()
            },
        ));
        sentry::configure_scope(|scope| {
            scope.set_tag("source", "auth");
        });
        Some(guard)
    });
}

pub fn configure_user_scope(subject_id: &str, provider: Provider) {
    if !sentry_enabled() {
        return;
    }

    let sentry_user = sentry::User {
        id: Some(subject_id.to_string()),
        ..Default::default()
    };

    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry_user));
        scope.set_tag("auth.provider", provider.as_str());
    });
}

fn sentry_layer<S>() -> SentryLayer<S>
where
    S: tracing::Subscriber,
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    SentryLayer::default()
        .span_filter(|meta| {
            matches!(
                *meta.level(),
                Level::DEBUG | Level::INFO | Level::WARN | Level::ERROR
            )
        })
        .event_filter(|meta| match *meta.level() {
            Level::ERROR => EventFilter::Event,
            Level::DEBUG | Level::INFO | Level::WARN => EventFilter::Breadcrumb,
            Level::TRACE => EventFilter::Ignore,
        })
}
