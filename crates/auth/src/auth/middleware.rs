use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use url::form_urlencoded;

use super::{
    cookie::{SESSION_COOKIE_NAME, SessionCodec},
    pipeline::{SessionError, should_reissue},
    refresh::RefreshState,
    token::{Session, Token},
};
use crate::{AppState, configure_user_scope};

pub struct ActiveSession {
    pub token: Token,
    pub session: Session,
    pub refresh_state: RefreshState,
    pub reissue: bool,
}

/// Result of evaluating the session cookie of one request.
pub enum SessionLookup {
    /// No session cookie was sent.
    Anonymous,
    /// The cookie failed signature, expiry or decryption checks.
    Invalid,
    Rejected(SessionError),
    Active(Box<ActiveSession>),
}

impl SessionLookup {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionLookup::Active(active) => Some(&active.session),
            _ => None,
        }
    }

    /// Writes the cookie changes this lookup calls for: a rewritten session
    /// cookie, a removal, or nothing.
    pub fn apply_to(&self, jar: CookieJar, codec: &SessionCodec, now: DateTime<Utc>) -> CookieJar {
        match self {
            SessionLookup::Active(active) if active.reissue => {
                match codec.session_cookie(&active.token, now) {
                    Ok(cookie) => jar.add(cookie),
                    Err(error) => {
                        warn!(
                            jti = %active.token.jti,
                            error = %error,
                            "failed to reissue session cookie"
                        );
                        jar
                    }
                }
            }
            SessionLookup::Invalid
            | SessionLookup::Rejected(SessionError::Revoked | SessionError::Expired) => {
                jar.add(codec.removal_cookie(SESSION_COOKIE_NAME))
            }
            _ => jar,
        }
    }
}

pub async fn lookup_session(
    state: &AppState,
    jar: &CookieJar,
    now: DateTime<Utc>,
) -> SessionLookup {
    let Some(cookie) = jar.get(SESSION_COOKIE_NAME) else {
        return SessionLookup::Anonymous;
    };

    let token = match state.codec().decode_token(cookie.value()) {
        Ok(token) => token,
        Err(error) => {
            debug!(error = %error, "discarding unreadable session cookie");
            return SessionLookup::Invalid;
        }
    };

    match state.pipeline().resolve(token.clone(), now).await {
        Ok(resolved) => {
            let reissue = should_reissue(&token, &resolved, now);
            SessionLookup::Active(Box::new(ActiveSession {
                session: state.projector().project(&resolved.token),
                refresh_state: resolved.refresh_state,
                token: resolved.token,
                reissue,
            }))
        }
        Err(error) => SessionLookup::Rejected(error),
    }
}

/// Guards protected routes. Anonymous callers are sent to sign-in with the
/// original path as `callbackUrl`; authenticated requests carry the
/// [`Session`] as an extension.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let now = Utc::now();
    let lookup = lookup_session(&state, &jar, now).await;
    let jar = lookup.apply_to(jar, state.codec(), now);

    match lookup {
        SessionLookup::Active(active) => {
            configure_user_scope(&active.session.user_id, active.session.provider);
            req.extensions_mut().insert(active.session);
            let response = next.run(req).await;
            (jar, response).into_response()
        }
        SessionLookup::Rejected(SessionError::Store(error)) => {
            warn!(error = %error, "revocation store unavailable; refusing request");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        _ => (jar, Redirect::to(&signin_redirect(req.uri()))).into_response(),
    }
}

fn signin_redirect(uri: &Uri) -> String {
    let original = uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/");
    let encoded: String = form_urlencoded::byte_serialize(original.as_bytes()).collect();
    format!("/api/auth/signin?callbackUrl={encoded}")
}
