use super::token::{Session, Token};

/// Derives the public [`Session`] from an internal [`Token`].
///
/// The refresh token and the token id never leave this boundary. A degraded
/// token still projects to a usable session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionProjector;

impl SessionProjector {
    pub fn project(&self, token: &Token) -> Session {
        Session {
            user_id: token.subject_id.clone(),
            access_token: token.access_token.clone(),
            provider: token.provider,
        }
    }
}

impl From<&Token> for Session {
    fn from(token: &Token) -> Self {
        SessionProjector.project(token)
    }
}
