//! Client authentication policy
//!
//! The server never decides on credentials itself; every auth attempt is
//! put to the configured [`AuthPolicy`]. The default grants everyone.

use std::fmt;
use std::sync::Arc;

use russh::keys::PublicKey;

/// Credential presented in one authentication attempt
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    /// `none` method: no credential at all
    None,
    Password(&'a str),
    PublicKey(&'a PublicKey),
}

impl Credential<'_> {
    /// SSH method name, for logging
    pub fn method(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Password(_) => "password",
            Self::PublicKey(_) => "publickey",
        }
    }
}

/// Custom credential check plugged into [`AuthPolicy::Custom`]
pub trait Authenticator: Send + Sync + 'static {
    fn check(&self, user: &str, credential: Credential<'_>) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&str, Credential<'_>) -> bool + Send + Sync + 'static,
{
    fn check(&self, user: &str, credential: Credential<'_>) -> bool {
        (self)(user, credential)
    }
}

/// Who may open a session
#[derive(Clone, Default)]
pub enum AuthPolicy {
    /// Grant every attempt, including `none`
    #[default]
    AcceptAll,
    Custom(Arc<dyn Authenticator>),
}

impl AuthPolicy {
    pub fn custom(authenticator: impl Authenticator) -> Self {
        Self::Custom(Arc::new(authenticator))
    }

    pub fn permits(&self, user: &str, credential: Credential<'_>) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::Custom(authenticator) => authenticator.check(user, credential),
        }
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAll => f.write_str("AcceptAll"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all_grants_everything() {
        let policy = AuthPolicy::default();
        assert!(policy.permits("anyone", Credential::None));
        assert!(policy.permits("root", Credential::Password("hunter2")));
    }

    #[test]
    fn test_custom_policy() {
        let policy = AuthPolicy::custom(|user: &str, credential: Credential<'_>| {
            matches!(credential, Credential::Password("open sesame")) && user == "ali"
        });
        assert!(policy.permits("ali", Credential::Password("open sesame")));
        assert!(!policy.permits("ali", Credential::Password("wrong")));
        assert!(!policy.permits("ali", Credential::None));
        assert!(!policy.permits("bob", Credential::Password("open sesame")));
    }

    #[test]
    fn test_credential_method_names() {
        assert_eq!(Credential::None.method(), "none");
        assert_eq!(Credential::Password("x").method(), "password");
    }

    #[test]
    fn test_policy_debug() {
        assert_eq!(format!("{:?}", AuthPolicy::AcceptAll), "AcceptAll");
        let policy = AuthPolicy::custom(|_: &str, _: Credential<'_>| false);
        assert_eq!(format!("{:?}", policy), "Custom(..)");
    }
}
