//! Identity resolution
//!
//! A caller is resolved to a [`Principal`] by an ordered list of
//! [`AuthStrategy`] implementations. The resolver tries each strategy against
//! the credentials it accepts and stops at the first success.

mod api_key;
mod bearer;

pub use api_key::ApiKeyStrategy;
pub use bearer::BearerTokenStrategy;

use crate::credentials::Credential;
use crate::error::{AuthError, StoreError};
use crate::rate_limit::RateSubject;
use crate::store::{bounded, SharedStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Subscription tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Trial,
    Starter,
    Professional,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Trial, Tier::Starter, Tier::Professional, Tier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Trial => "trial",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown tier '{s}'"))
    }
}

/// Resolved caller identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub tier: Tier,
}

/// A principal together with the key that authenticated it, if any
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIdentity {
    pub principal: Principal,
    pub key_id: Option<Uuid>,
}

impl ResolvedIdentity {
    /// What the rate limiter counts requests against
    pub fn rate_subject(&self) -> RateSubject {
        match self.key_id {
            Some(key_id) => RateSubject::ApiKey(key_id),
            None => RateSubject::Principal(self.principal.id),
        }
    }
}

/// Tier recorded on the principal's subscription, trial when there is none.
///
/// Every strategy takes the tier from here so one caller sees the same tier
/// whichever credential it presents.
async fn subscription_tier(
    store: &SharedStore,
    principal_id: Uuid,
    store_timeout: Duration,
) -> Result<Tier, StoreError> {
    let subscription = bounded(store_timeout, store.get_subscription(principal_id)).await?;
    Ok(subscription.map(|s| s.tier).unwrap_or(Tier::Trial))
}

/// A way of turning a credential into a principal
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Whether this strategy understands the credential
    fn accepts(&self, credential: &Credential) -> bool;

    /// Resolve the credential
    async fn resolve(&self, credential: &Credential) -> Result<ResolvedIdentity, AuthError>;
}

pub type SharedAuthStrategy = Arc<dyn AuthStrategy>;

/// Tries strategies in order and stops at the first success
#[derive(Clone, Default)]
pub struct IdentityResolver {
    strategies: Vec<SharedAuthStrategy>,
}

impl IdentityResolver {
    pub fn new(strategies: Vec<SharedAuthStrategy>) -> Self {
        Self { strategies }
    }

    /// Append a strategy after the existing ones
    pub fn with_strategy(mut self, strategy: SharedAuthStrategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Resolve a principal from the presented credentials.
    ///
    /// When every attempt fails the error of the last attempt is returned.
    pub async fn resolve(&self, credentials: &[Credential]) -> Result<ResolvedIdentity, AuthError> {
        let mut last_error = AuthError::Unauthenticated;

        for strategy in &self.strategies {
            for credential in credentials.iter().filter(|c| strategy.accepts(c)) {
                match strategy.resolve(credential).await {
                    Ok(identity) => {
                        debug!(
                            strategy = strategy.name(),
                            principal_id = %identity.principal.id,
                            "Resolved principal"
                        );
                        return Ok(identity);
                    }
                    Err(err) => {
                        debug!(strategy = strategy.name(), error = %err, "Authentication attempt failed");
                        last_error = err;
                    }
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::{ExposeSecret, SecretString};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedStrategy {
        kind: &'static str,
        accept_secret: &'static str,
        failure: AuthError,
        calls: AtomicUsize,
    }

    impl FixedStrategy {
        fn new(kind: &'static str, accept_secret: &'static str, failure: AuthError) -> Arc<Self> {
            Arc::new(Self {
                kind,
                accept_secret,
                failure,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AuthStrategy for FixedStrategy {
        fn name(&self) -> &'static str {
            self.kind
        }

        fn accepts(&self, credential: &Credential) -> bool {
            credential.kind() == self.kind
        }

        async fn resolve(&self, credential: &Credential) -> Result<ResolvedIdentity, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let secret = match credential {
                Credential::BearerToken(s) | Credential::ApiKey(s) => s.expose_secret(),
            };
            if secret == self.accept_secret {
                Ok(ResolvedIdentity {
                    principal: Principal {
                        id: Uuid::nil(),
                        email: format!("{}@example.com", self.kind),
                        tier: Tier::Starter,
                    },
                    key_id: None,
                })
            } else {
                Err(self.failure.clone())
            }
        }
    }

    fn bearer(s: &str) -> Credential {
        Credential::BearerToken(SecretString::from(s.to_string()))
    }

    fn key(s: &str) -> Credential {
        Credential::ApiKey(SecretString::from(s.to_string()))
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("starter".parse::<Tier>().unwrap(), Tier::Starter);
        assert_eq!("Enterprise".parse::<Tier>().unwrap(), Tier::Enterprise);
        assert!("gold".parse::<Tier>().is_err());
        assert_eq!(Tier::Professional.to_string(), "professional");
    }

    #[tokio::test]
    async fn test_no_credentials_is_unauthenticated() {
        let resolver = IdentityResolver::default().with_strategy(FixedStrategy::new(
            "bearer",
            "good",
            AuthError::InvalidToken,
        ));
        assert_eq!(resolver.resolve(&[]).await, Err(AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let bearer_strategy = FixedStrategy::new("bearer", "good", AuthError::InvalidToken);
        let key_strategy = FixedStrategy::new("api_key", "sk_good", AuthError::InvalidApiKey { attribution: None });
        let resolver = IdentityResolver::default()
            .with_strategy(bearer_strategy.clone())
            .with_strategy(key_strategy.clone());

        let identity = resolver.resolve(&[bearer("good"), key("sk_good")]).await.unwrap();
        assert_eq!(identity.principal.email, "bearer@example.com");
        assert_eq!(key_strategy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_api_key() {
        let bearer_strategy = FixedStrategy::new("bearer", "good", AuthError::InvalidToken);
        let key_strategy = FixedStrategy::new("api_key", "sk_good", AuthError::InvalidApiKey { attribution: None });
        let resolver = IdentityResolver::default()
            .with_strategy(bearer_strategy.clone())
            .with_strategy(key_strategy.clone());

        let identity = resolver.resolve(&[bearer("expired"), key("sk_good")]).await.unwrap();
        assert_eq!(identity.principal.email, "api_key@example.com");
        assert_eq!(bearer_strategy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_failure_is_reported() {
        let resolver = IdentityResolver::default()
            .with_strategy(FixedStrategy::new("bearer", "good", AuthError::InvalidToken))
            .with_strategy(FixedStrategy::new(
                "api_key",
                "sk_good",
                AuthError::InvalidApiKey { attribution: None },
            ));

        let err = resolver.resolve(&[bearer("bad"), key("sk_bad")]).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidApiKey { attribution: None });
    }

    #[tokio::test]
    async fn test_unaccepted_credentials_are_skipped() {
        let key_strategy = FixedStrategy::new("api_key", "sk_good", AuthError::InvalidApiKey { attribution: None });
        let resolver = IdentityResolver::default().with_strategy(key_strategy.clone());

        let err = resolver.resolve(&[bearer("anything")]).await.unwrap_err();
        assert_eq!(err, AuthError::Unauthenticated);
        assert_eq!(key_strategy.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rate_subject() {
        let principal = Principal {
            id: Uuid::new_v4(),
            email: "a@example.com".into(),
            tier: Tier::Starter,
        };
        let key_id = Uuid::new_v4();
        let with_key = ResolvedIdentity {
            principal: principal.clone(),
            key_id: Some(key_id),
        };
        let session = ResolvedIdentity {
            principal: principal.clone(),
            key_id: None,
        };
        assert_eq!(with_key.rate_subject(), RateSubject::ApiKey(key_id));
        assert_eq!(session.rate_subject(), RateSubject::Principal(principal.id));
    }
}
