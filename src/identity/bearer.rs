//! Session-token strategy: introspection against the identity provider

use super::{subscription_tier, AuthStrategy, Principal, ResolvedIdentity};
use crate::config::IdentityProviderConfig;
use crate::credentials::Credential;
use crate::error::AuthError;
use crate::store::{bounded, SharedStore};
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Header carrying the provider's project key
const PROVIDER_KEY_HEADER: &str = "apikey";

#[derive(Debug, Deserialize)]
struct ProviderUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
}

pub struct BearerTokenStrategy {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
    timeout: Duration,
    store: SharedStore,
    store_timeout: Duration,
}

impl BearerTokenStrategy {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
        store: SharedStore,
        store_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
            timeout,
            store,
            store_timeout,
        }
    }

    /// Build the strategy if an identity provider is configured
    pub fn from_config(
        config: &IdentityProviderConfig,
        store: SharedStore,
        store_timeout: Duration,
    ) -> Option<Self> {
        let url = config.url.clone()?;
        Some(Self::new(
            url,
            config.api_key.clone().map(SecretString::from),
            config.timeout(),
            store,
            store_timeout,
        ))
    }

    async fn introspect(&self, token: &SecretString) -> Result<ProviderUser, AuthError> {
        let mut request = self
            .client
            .get(&self.url)
            .bearer_auth(token.expose_secret())
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.header(PROVIDER_KEY_HEADER, key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::ProviderUnavailable("identity provider timed out".to_string())
            } else {
                AuthError::ProviderUnavailable(e.without_url().to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidToken);
        }
        if !status.is_success() {
            return Err(AuthError::ProviderUnavailable(format!(
                "identity provider answered {status}"
            )));
        }

        response.json::<ProviderUser>().await.map_err(|e| {
            AuthError::ProviderUnavailable(format!("malformed identity provider response: {e}"))
        })
    }
}

#[async_trait]
impl AuthStrategy for BearerTokenStrategy {
    fn name(&self) -> &'static str {
        "bearer"
    }

    fn accepts(&self, credential: &Credential) -> bool {
        matches!(credential, Credential::BearerToken(_))
    }

    async fn resolve(&self, credential: &Credential) -> Result<ResolvedIdentity, AuthError> {
        let Credential::BearerToken(token) = credential else {
            return Err(AuthError::Unauthenticated);
        };
        let user = self.introspect(token).await?;

        let tier = subscription_tier(&self.store, user.id, self.store_timeout)
            .await
            .map_err(|e| AuthError::ProviderUnavailable(format!("subscription lookup: {e}")))?;
        debug!(principal_id = %user.id, tier = %tier, "Session token verified");

        let principal = Principal {
            id: user.id,
            email: user.email.unwrap_or_default(),
            tier,
        };
        // keys minted for this principal resolve their owner from the store
        bounded(self.store_timeout, self.store.upsert_principal(principal.clone()))
            .await
            .map_err(|e| AuthError::ProviderUnavailable(format!("principal upsert: {e}")))?;

        Ok(ResolvedIdentity {
            principal,
            key_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierTable;
    use crate::identity::Tier;
    use crate::store::{subscription_for, GatewayStore, MemoryStore};
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::Utc;
    use std::sync::Arc;

    const GOOD_TOKEN: &str = "good-token";

    async fn spawn_provider(user_id: Uuid, delay: Duration) -> String {
        let app = Router::new().route(
            "/auth/v1/user",
            get(move |headers: HeaderMap| async move {
                tokio::time::sleep(delay).await;
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v == format!("Bearer {GOOD_TOKEN}"));
                let has_project_key = headers.get("apikey").is_some();
                if authorized && has_project_key {
                    Ok(Json(serde_json::json!({ "id": user_id, "email": "user@example.com" })))
                } else {
                    Err(axum::http::StatusCode::UNAUTHORIZED)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/auth/v1/user")
    }

    fn strategy(url: String, store: Arc<MemoryStore>, timeout: Duration) -> BearerTokenStrategy {
        BearerTokenStrategy::new(
            url,
            Some(SecretString::from("anon-key".to_string())),
            timeout,
            store,
            Duration::from_secs(1),
        )
    }

    fn bearer(token: &str) -> Credential {
        Credential::BearerToken(SecretString::from(token.to_string()))
    }

    #[tokio::test]
    async fn test_valid_token_resolves_with_subscription_tier() {
        let user_id = Uuid::new_v4();
        let url = spawn_provider(user_id, Duration::ZERO).await;
        let store = Arc::new(MemoryStore::new());
        store.put_subscription(subscription_for(
            user_id,
            Tier::Professional,
            &TierTable::default(),
            Utc::now(),
        ));

        let identity = strategy(url, store, Duration::from_secs(5))
            .resolve(&bearer(GOOD_TOKEN))
            .await
            .unwrap();
        assert_eq!(identity.principal.id, user_id);
        assert_eq!(identity.principal.email, "user@example.com");
        assert_eq!(identity.principal.tier, Tier::Professional);
        assert_eq!(identity.key_id, None);
    }

    #[tokio::test]
    async fn test_resolved_principal_is_persisted() {
        let user_id = Uuid::new_v4();
        let url = spawn_provider(user_id, Duration::ZERO).await;
        let store = Arc::new(MemoryStore::new());

        let identity = strategy(url, store.clone(), Duration::from_secs(5))
            .resolve(&bearer(GOOD_TOKEN))
            .await
            .unwrap();
        let stored = store.get_principal(user_id).await.unwrap();
        assert_eq!(stored, Some(identity.principal));
    }

    #[tokio::test]
    async fn test_missing_subscription_means_trial() {
        let user_id = Uuid::new_v4();
        let url = spawn_provider(user_id, Duration::ZERO).await;
        let identity = strategy(url, Arc::new(MemoryStore::new()), Duration::from_secs(5))
            .resolve(&bearer(GOOD_TOKEN))
            .await
            .unwrap();
        assert_eq!(identity.principal.tier, Tier::Trial);
    }

    #[tokio::test]
    async fn test_rejected_token() {
        let url = spawn_provider(Uuid::new_v4(), Duration::ZERO).await;
        let err = strategy(url, Arc::new(MemoryStore::new()), Duration::from_secs(5))
            .resolve(&bearer("expired"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    #[tokio::test]
    async fn test_slow_provider_is_unavailable() {
        let url = spawn_provider(Uuid::new_v4(), Duration::from_secs(2)).await;
        let err = strategy(url, Arc::new(MemoryStore::new()), Duration::from_millis(100))
            .resolve(&bearer(GOOD_TOKEN))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = strategy(
            format!("http://{addr}/auth/v1/user"),
            Arc::new(MemoryStore::new()),
            Duration::from_secs(1),
        )
        .resolve(&bearer(GOOD_TOKEN))
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::ProviderUnavailable(_)));
    }
}
