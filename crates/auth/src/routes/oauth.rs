use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::CookieJar;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use url::form_urlencoded;

use super::error::ErrorResponse;
use crate::{
    AppState,
    auth::{
        Provider, SESSION_COOKIE_NAME, STATE_COOKIE_NAME, SignInError,
        signin::sanitize_callback_url,
    },
};

const ERROR_PAGE: &str = "/auth/error";

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/signin", get(signin_options))
        .route("/api/auth/signin/{provider}", get(signin))
        .route("/api/auth/callback/{provider}", get(callback))
        .route("/api/auth/signout", post(signout))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackUrlQuery {
    callback_url: Option<String>,
}

impl CallbackUrlQuery {
    fn callback_url(&self) -> String {
        sanitize_callback_url(self.callback_url.as_deref().unwrap_or("/"))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInOption {
    provider: Provider,
    signin_url: String,
}

/// Lists the configured providers, or goes straight to the only one.
pub async fn signin_options(
    State(state): State<AppState>,
    Query(query): Query<CallbackUrlQuery>,
) -> Response {
    let callback_url = query.callback_url();
    let options: Vec<SignInOption> = state
        .providers()
        .sign_in_providers()
        .into_iter()
        .map(|provider| SignInOption {
            provider,
            signin_url: provider_signin_url(provider, &callback_url),
        })
        .collect();

    match options.as_slice() {
        [only] => Redirect::to(&only.signin_url).into_response(),
        _ => Json(options).into_response(),
    }
}

pub async fn signin(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackUrlQuery>,
    jar: CookieJar,
) -> Response {
    let Ok(provider) = provider.parse::<Provider>() else {
        return ErrorResponse::new(StatusCode::NOT_FOUND, "unknown provider").into_response();
    };

    let start = match state.sign_in().begin(provider, &query.callback_url()) {
        Ok(start) => start,
        Err(SignInError::UnsupportedProvider(_)) => {
            return ErrorResponse::new(StatusCode::NOT_FOUND, "provider not configured")
                .into_response();
        }
        Err(error) => {
            error!(provider = %provider, error = %error, "failed to start sign-in");
            return ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "sign-in unavailable")
                .into_response();
        }
    };

    match state.codec().state_cookie(&start.state, Utc::now()) {
        Ok(cookie) => (jar.add(cookie), Redirect::to(start.authorize_url.as_str())).into_response(),
        Err(error) => {
            error!(provider = %provider, error = %error, "failed to sign oauth state");
            ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "sign-in unavailable")
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
}

pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
    jar: CookieJar,
) -> Response {
    let Ok(provider) = provider.parse::<Provider>() else {
        return ErrorResponse::new(StatusCode::NOT_FOUND, "unknown provider").into_response();
    };

    let codec = state.codec();
    let expected = jar
        .get(STATE_COOKIE_NAME)
        .and_then(|cookie| codec.decode_state(cookie.value()).ok());
    let jar = jar.add(codec.removal_cookie(STATE_COOKIE_NAME));
    let now = Utc::now();

    let result = state
        .sign_in()
        .complete(
            provider,
            expected.as_ref(),
            query.state.as_deref(),
            query.code.as_deref(),
            query.error.as_deref(),
            now,
        )
        .await;

    let token = match result {
        Ok(token) => token,
        Err(SignInError::UnsupportedProvider(_)) => {
            return ErrorResponse::new(StatusCode::NOT_FOUND, "provider not configured")
                .into_response();
        }
        Err(SignInError::Rejected(reason)) => {
            warn!(provider = %provider, reason = reason.as_str(), "sign-in rejected by policy");
            return (jar, Redirect::to(&error_page("AccessDenied"))).into_response();
        }
        Err(error @ SignInError::Issue(_)) => {
            error!(provider = %provider, error = %error, "failed to issue session token");
            return (jar, Redirect::to(&error_page("Configuration"))).into_response();
        }
        Err(error) => {
            warn!(provider = %provider, error = %error, "oauth callback failed");
            return (jar, Redirect::to(&error_page("OAuthCallback"))).into_response();
        }
    };

    let callback_url = expected
        .map(|expected| expected.callback_url)
        .unwrap_or_else(|| "/".to_string());

    match codec.session_cookie(&token, now) {
        Ok(cookie) => (jar.add(cookie), Redirect::to(&callback_url)).into_response(),
        Err(error) => {
            error!(provider = %provider, error = %error, "failed to encode session cookie");
            (jar, Redirect::to(&error_page("Configuration"))).into_response()
        }
    }
}

/// Revokes the current token id and drops the session cookie.
pub async fn signout(
    State(state): State<AppState>,
    Query(query): Query<CallbackUrlQuery>,
    jar: CookieJar,
) -> Response {
    let token = jar
        .get(SESSION_COOKIE_NAME)
        .and_then(|cookie| state.codec().decode_token(cookie.value()).ok());

    if let Some(token) = token {
        if let Err(error) = state.pipeline().revoke(&token).await {
            error!(jti = %token.jti, error = %error, "failed to revoke session token");
            return ErrorResponse::new(StatusCode::SERVICE_UNAVAILABLE, "sign-out unavailable")
                .into_response();
        }
        tracing::info!(jti = %token.jti, subject = %token.subject_id, "session revoked");
    }

    let jar = jar.add(state.codec().removal_cookie(SESSION_COOKIE_NAME));
    (jar, Redirect::to(&query.callback_url())).into_response()
}

fn provider_signin_url(provider: Provider, callback_url: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(callback_url.as_bytes()).collect();
    format!("/api/auth/signin/{provider}?callbackUrl={encoded}")
}

fn error_page(code: &str) -> String {
    format!("{ERROR_PAGE}?error={code}")
}
