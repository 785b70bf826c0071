use tracing::info;

use super::{
    provider::{ProviderProfile, ProviderUser},
    token::Provider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    EmailNotVerified,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::EmailNotVerified => "email_not_verified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInDecision {
    Allow,
    Deny(DenyReason),
}

impl SignInDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SignInDecision::Allow)
    }
}

/// Admission check run once per sign-in, before any token exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignInPolicy;

impl SignInPolicy {
    pub fn evaluate(
        &self,
        provider: Provider,
        user: &ProviderUser,
        profile: &ProviderProfile,
    ) -> SignInDecision {
        match provider {
            Provider::Google if profile.email_verified != Some(true) => {
                info!(
                    provider = %provider,
                    subject = %user.id,
                    "sign-in denied: google email not verified"
                );
                SignInDecision::Deny(DenyReason::EmailNotVerified)
            }
            Provider::Google | Provider::AzureAd | Provider::Credentials => SignInDecision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn user() -> ProviderUser {
        ProviderUser {
            id: "subject".to_string(),
            email: Some("someone@example.com".to_string()),
            name: None,
            avatar_url: None,
        }
    }

    fn profile(value: serde_json::Value) -> ProviderProfile {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn google_requires_verified_email() {
        let policy = SignInPolicy;
        assert_eq!(
            policy.evaluate(
                Provider::Google,
                &user(),
                &profile(json!({ "email_verified": false }))
            ),
            SignInDecision::Deny(DenyReason::EmailNotVerified)
        );
        assert_eq!(
            policy.evaluate(
                Provider::Google,
                &user(),
                &profile(json!({ "email_verified": true }))
            ),
            SignInDecision::Allow
        );
    }

    #[test]
    fn google_without_claim_is_denied() {
        assert!(
            !SignInPolicy
                .evaluate(Provider::Google, &user(), &profile(json!({})))
                .is_allowed()
        );
    }

    #[test]
    fn azure_ad_and_credentials_are_always_allowed() {
        let empty = profile(json!({}));
        assert_eq!(
            SignInPolicy.evaluate(Provider::AzureAd, &user(), &empty),
            SignInDecision::Allow
        );
        assert_eq!(
            SignInPolicy.evaluate(
                Provider::Credentials,
                &user(),
                &profile(json!({ "email_verified": false }))
            ),
            SignInDecision::Allow
        );
    }
}
