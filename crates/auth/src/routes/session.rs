use axum::{
    Extension, Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::CookieJar;
use chrono::Utc;
use serde::Serialize;

use crate::{
    AppState,
    auth::{Provider, Session, lookup_session},
};

pub fn public_router() -> Router<AppState> {
    Router::new().route("/api/auth/session", get(get_session))
}

pub fn protected_router() -> Router<AppState> {
    Router::new().route("/api/auth/me", get(me))
}

#[derive(Debug, Serialize)]
pub struct SessionUser {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub user: Option<SessionUser>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub provider: Option<Provider>,
    pub access_token: Option<String>,
}

impl From<Option<&Session>> for SessionResponse {
    fn from(session: Option<&Session>) -> Self {
        match session {
            Some(session) => Self {
                user: Some(SessionUser {
                    id: session.user_id.clone(),
                }),
                is_authenticated: true,
                is_loading: false,
                provider: Some(session.provider),
                access_token: Some(session.access_token.clone()),
            },
            None => Self {
                user: None,
                is_authenticated: false,
                is_loading: false,
                provider: None,
                access_token: None,
            },
        }
    }
}

/// Never fails: anything short of an active session reads as signed out.
pub async fn get_session(State(state): State<AppState>, jar: CookieJar) -> Response {
    let now = Utc::now();
    let lookup = lookup_session(&state, &jar, now).await;
    let jar = lookup.apply_to(jar, state.codec(), now);
    (jar, Json(SessionResponse::from(lookup.session()))).into_response()
}

pub async fn me(Extension(session): Extension<Session>) -> Json<Session> {
    Json(session)
}
