use axum::{
    Router,
    http::{HeaderValue, Request, header::HeaderName},
    middleware,
    routing::get,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, field};
use url::Url;

use crate::{AppState, auth::require_auth};

mod error;
mod oauth;
mod session;

pub use session::SessionResponse;

pub fn router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .and_then(|id| id.header_value().to_str().ok());
            let span = tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri().path(),
                request_id = field::Empty
            );
            if let Some(request_id) = request_id {
                span.record("request_id", field::display(request_id));
            }
            span
        })
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    let public = Router::<AppState>::new()
        .route("/health", get(health))
        .merge(session::public_router())
        .merge(oauth::public_router());

    let cors = cors_layer(state.sign_in().public_origin());

    let protected = Router::<AppState>::new()
        .merge(session::protected_router())
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::<AppState>::new()
        .merge(public)
        .merge(protected)
        .layer(cors)
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid {},
        ))
        .with_state(state)
}

/// Credentialed CORS for the deployment's own origin only. The session cookie
/// carries the provider access token, so other origins get no CORS headers.
fn cors_layer(public_base_url: &str) -> CorsLayer {
    let allowed: Vec<HeaderValue> = Url::parse(public_base_url)
        .ok()
        .map(|url| url.origin())
        .filter(|origin| origin.is_tuple())
        .map(|origin| origin.ascii_serialization())
        .and_then(|origin| HeaderValue::from_str(&origin).ok())
        .into_iter()
        .collect();
    if allowed.is_empty() {
        tracing::warn!(public_base_url, "AUTH_URL has no usable origin; CORS disabled");
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health() -> &'static str {
    "ok"
}
