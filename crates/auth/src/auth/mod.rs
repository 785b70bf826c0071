pub mod cookie;
pub mod issuer;
mod middleware;
pub mod pipeline;
pub mod policy;
pub mod projector;
pub mod provider;
pub mod refresh;
pub mod revocation;
pub mod signin;
pub mod token;

pub use cookie::{CookieError, OAuthState, SESSION_COOKIE_NAME, STATE_COOKIE_NAME, SessionCodec};
pub use issuer::{IssueError, ProviderAccount, TokenIssuer};
pub use middleware::{ActiveSession, SessionLookup, lookup_session, require_auth};
pub use pipeline::{ResolvedToken, SessionError, SessionPipeline, should_reissue};
pub use policy::{DenyReason, SignInDecision, SignInPolicy};
pub use projector::SessionProjector;
pub use provider::{
    AzureAdOAuthProvider, GoogleOAuthProvider, OAuthProvider, ProviderRegistry, RefreshError,
    RefreshStrategy,
};
pub use refresh::{RefreshCoordinator, RefreshState};
pub use revocation::{
    InMemoryRevocationStore, RevocationRegistry, RevocationStore, RevocationStoreError,
};
pub use signin::{SignInError, SignInService, StateError};
pub use token::{Provider, Session, Token, TokenError};
