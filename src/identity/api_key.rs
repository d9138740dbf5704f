//! API key strategy: hash lookup against the key store

use super::{subscription_tier, AuthStrategy, ResolvedIdentity};
use crate::api_key::SecretHasher;
use crate::credentials::Credential;
use crate::error::{AuthError, KeyRef, StoreError};
use crate::store::{bounded, SharedStore};
use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ApiKeyStrategy {
    store: SharedStore,
    hasher: Arc<SecretHasher>,
    store_timeout: Duration,
}

impl ApiKeyStrategy {
    pub fn new(store: SharedStore, hasher: Arc<SecretHasher>, store_timeout: Duration) -> Self {
        Self {
            store,
            hasher,
            store_timeout,
        }
    }
}

fn unavailable(err: StoreError) -> AuthError {
    AuthError::ProviderUnavailable(format!("key store: {err}"))
}

#[async_trait]
impl AuthStrategy for ApiKeyStrategy {
    fn name(&self) -> &'static str {
        "api_key"
    }

    fn accepts(&self, credential: &Credential) -> bool {
        matches!(credential, Credential::ApiKey(_))
    }

    async fn resolve(&self, credential: &Credential) -> Result<ResolvedIdentity, AuthError> {
        let Credential::ApiKey(raw) = credential else {
            return Err(AuthError::Unauthenticated);
        };
        let raw = raw.expose_secret();
        if !self.hasher.is_well_formed(raw) {
            return Err(AuthError::InvalidApiKey { attribution: None });
        }

        let key_hash = self.hasher.hash(raw);
        let record = bounded(self.store_timeout, self.store.find_key_by_hash(&key_hash))
            .await
            .map_err(unavailable)?
            .ok_or(AuthError::InvalidApiKey { attribution: None })?;

        let attribution = Some(KeyRef {
            key_id: record.id,
            owner_id: record.owner_id,
        });
        let now = Utc::now();
        if !record.is_usable_at(now) {
            debug!(
                key_id = %record.id,
                status = record.status.as_str(),
                "Rejected unusable API key"
            );
            return Err(AuthError::InvalidApiKey { attribution });
        }

        let mut principal = bounded(self.store_timeout, self.store.get_principal(record.owner_id))
            .await
            .map_err(unavailable)?
            .ok_or(AuthError::InvalidApiKey { attribution })?;
        principal.tier = subscription_tier(&self.store, principal.id, self.store_timeout)
            .await
            .map_err(unavailable)?;

        if let Err(err) = bounded(self.store_timeout, self.store.record_key_use(record.id, now)).await {
            warn!(key_id = %record.id, error = %err, "Failed to record API key use");
        }

        Ok(ResolvedIdentity {
            principal,
            key_id: Some(record.id),
        })
    }
}
