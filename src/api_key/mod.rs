//! API key lifecycle
//!
//! This module issues and manages long-lived API keys:
//! - Create: mint a custom key, gated by the principal's tier
//! - Rotate: replace the secret of an active key in place
//! - Revoke: terminal, the record is kept for audit
//! - Trial provisioning: the single auto-issued key of a trial principal
//!
//! Plaintext secrets leave this module exactly once, inside an [`IssuedKey`].
//! Only an HMAC-SHA256 digest and a short display prefix are persisted.

use crate::config::{ApiKeysConfig, TierTable, SECRET_HEX_LEN};
use crate::error::{AuthorizationError, GatewayError, ValidationError};
use crate::identity::{Principal, Tier};
use crate::store::{bounded, ApiKeyRecord, KeyStatus, KeyUpdate, SharedStore};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Longest accepted key name, in characters
pub const MAX_NAME_LEN: usize = 100;

/// Name given to auto-issued trial keys
pub const TRIAL_KEY_NAME: &str = "Trial key";

const SECRET_BYTES: usize = SECRET_HEX_LEN / 2;

/// Generates secrets and computes the digest stored for them
pub struct SecretHasher {
    marker: String,
    mac: Option<HmacSha256>,
}

impl SecretHasher {
    /// An empty pepper falls back to plain SHA-256
    pub fn new(marker: impl Into<String>, pepper: &str) -> Result<Self, GatewayError> {
        let mac = if pepper.is_empty() {
            None
        } else {
            Some(HmacSha256::new_from_slice(pepper.as_bytes()).map_err(GatewayError::internal)?)
        };
        Ok(Self {
            marker: marker.into(),
            mac,
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Cheap shape check done before any store round-trip
    pub fn is_well_formed(&self, raw: &str) -> bool {
        raw.strip_prefix(self.marker.as_str()).is_some_and(|rest| {
            rest.len() == SECRET_HEX_LEN
                && rest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
    }

    /// Hex digest of a plaintext secret
    pub fn hash(&self, raw: &str) -> String {
        match &self.mac {
            Some(mac) => {
                let mut mac = mac.clone();
                mac.update(raw.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            None => hex::encode(Sha256::digest(raw.as_bytes())),
        }
    }

    /// A fresh 256-bit secret with the configured marker
    pub fn generate(&self) -> SecretString {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        SecretString::from(format!("{}{}", self.marker, hex::encode(bytes)))
    }
}

/// A key together with its plaintext secret, returned once at issue time
#[derive(Debug)]
pub struct IssuedKey {
    pub id: Uuid,
    pub secret: SecretString,
    pub key_prefix: String,
    pub name: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Key metadata safe to show again
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub key_prefix: String,
    pub name: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&ApiKeyRecord> for ApiKeySummary {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            key_prefix: record.key_prefix.clone(),
            name: record.name.clone(),
            status: record.status,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            request_count: record.request_count,
            expires_at: record.expires_at,
        }
    }
}

/// All keys of a principal
#[derive(Debug, Clone)]
pub struct KeyListing {
    pub keys: Vec<ApiKeySummary>,
    pub total: usize,
    pub active: usize,
}

/// Create, rotate, revoke and list API keys
#[derive(Clone)]
pub struct ApiKeyManager {
    store: SharedStore,
    hasher: Arc<SecretHasher>,
    tiers: TierTable,
    display_prefix_len: usize,
    trial_lifetime: chrono::Duration,
    store_timeout: Duration,
}

impl ApiKeyManager {
    pub fn new(
        store: SharedStore,
        hasher: Arc<SecretHasher>,
        tiers: TierTable,
        config: &ApiKeysConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            hasher,
            tiers,
            display_prefix_len: config.display_prefix_len,
            trial_lifetime: chrono::Duration::days(config.trial_days),
            store_timeout,
        }
    }

    /// Mint a custom key for `principal`
    pub async fn create(&self, principal: &Principal, name: &str) -> Result<IssuedKey, GatewayError> {
        if !self.tiers.get(principal.tier).custom_keys {
            return Err(AuthorizationError::TierForbidden {
                tier: principal.tier.to_string(),
            }
            .into());
        }
        let name = validate_name(name)?;
        let issued = self.issue(principal.id, name, None).await?;
        info!(
            key_id = %issued.id,
            owner_id = %principal.id,
            key_prefix = %issued.key_prefix,
            "API key created"
        );
        Ok(issued)
    }

    /// Replace the secret of an active key. The old secret stops working.
    pub async fn rotate(&self, principal: &Principal, key_id: Uuid) -> Result<IssuedKey, GatewayError> {
        let record = self.owned_key(principal, key_id).await?;
        if record.status != KeyStatus::Active {
            return Err(invalid_status(record.status.as_str()));
        }
        if record.is_expired_at(Utc::now()) {
            return Err(invalid_status("expired"));
        }

        let secret = self.hasher.generate();
        let key_prefix = self.display_prefix(&secret);
        let key_hash = self.hasher.hash(secret.expose_secret());

        let update = bounded(
            self.store_timeout,
            self.store.replace_key_secret(key_id, key_hash, key_prefix),
        )
        .await?;
        match update {
            KeyUpdate::Updated(record) => {
                info!(key_id = %record.id, key_prefix = %record.key_prefix, "API key rotated");
                Ok(IssuedKey {
                    id: record.id,
                    secret,
                    key_prefix: record.key_prefix,
                    name: record.name,
                    status: record.status,
                    created_at: record.created_at,
                    expires_at: record.expires_at,
                })
            }
            // revoked between the read above and the update
            KeyUpdate::Unchanged(record) => Err(invalid_status(record.status.as_str())),
            KeyUpdate::NotFound => Err(GatewayError::key_not_found(key_id)),
        }
    }

    /// Revoke a key. Revoking a revoked key succeeds without changes.
    pub async fn revoke(&self, principal: &Principal, key_id: Uuid) -> Result<ApiKeySummary, GatewayError> {
        self.owned_key(principal, key_id).await?;
        match bounded(self.store_timeout, self.store.revoke_key(key_id)).await? {
            KeyUpdate::Updated(record) => {
                info!(key_id = %record.id, key_prefix = %record.key_prefix, "API key revoked");
                Ok(ApiKeySummary::from(&record))
            }
            KeyUpdate::Unchanged(record) => Ok(ApiKeySummary::from(&record)),
            KeyUpdate::NotFound => Err(GatewayError::key_not_found(key_id)),
        }
    }

    /// Metadata of every key owned by `principal`, newest first
    pub async fn list(&self, principal: &Principal) -> Result<KeyListing, GatewayError> {
        let records = bounded(self.store_timeout, self.store.list_keys(principal.id)).await?;
        let now = Utc::now();
        let active = records.iter().filter(|r| r.is_usable_at(now)).count();
        let keys: Vec<ApiKeySummary> = records.iter().map(ApiKeySummary::from).collect();
        Ok(KeyListing {
            total: keys.len(),
            active,
            keys,
        })
    }

    /// Issue the single trial key of a trial principal.
    ///
    /// Expired trial keys are revoked first so only one usable key exists.
    /// The final usability check and the insert are a single store step, so
    /// concurrent calls for one principal issue at most one key.
    pub async fn provision_trial(&self, principal: &Principal) -> Result<IssuedKey, GatewayError> {
        if principal.tier != Tier::Trial {
            return Err(ValidationError::NotTrial.into());
        }

        let now = Utc::now();
        let records = bounded(self.store_timeout, self.store.list_keys(principal.id)).await?;
        if records.iter().any(|r| r.is_usable_at(now)) {
            return Err(ValidationError::AlreadyProvisioned.into());
        }
        for stale in records.iter().filter(|r| r.status == KeyStatus::Active) {
            bounded(self.store_timeout, self.store.revoke_key(stale.id)).await?;
        }

        let (record, issued) = self.mint(principal.id, TRIAL_KEY_NAME.to_string(), Some(now + self.trial_lifetime));
        let inserted = bounded(self.store_timeout, self.store.insert_key_unless_usable(record, now)).await?;
        if !inserted {
            return Err(ValidationError::AlreadyProvisioned.into());
        }
        info!(
            key_id = %issued.id,
            owner_id = %principal.id,
            key_prefix = %issued.key_prefix,
            "Trial key provisioned"
        );
        Ok(issued)
    }

    async fn issue(
        &self,
        owner_id: Uuid,
        name: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedKey, GatewayError> {
        let (record, issued) = self.mint(owner_id, name, expires_at);
        bounded(self.store_timeout, self.store.insert_key(record)).await?;
        Ok(issued)
    }

    /// Fresh record plus the one-time view of its secret. Nothing is stored.
    fn mint(&self, owner_id: Uuid, name: String, expires_at: Option<DateTime<Utc>>) -> (ApiKeyRecord, IssuedKey) {
        let secret = self.hasher.generate();
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            owner_id,
            key_hash: self.hasher.hash(secret.expose_secret()),
            key_prefix: self.display_prefix(&secret),
            name,
            status: KeyStatus::Active,
            created_at: Utc::now(),
            last_used_at: None,
            request_count: 0,
            expires_at,
        };
        let issued = IssuedKey {
            id: record.id,
            secret,
            key_prefix: record.key_prefix.clone(),
            name: record.name.clone(),
            status: record.status,
            created_at: record.created_at,
            expires_at: record.expires_at,
        };
        (record, issued)
    }

    async fn owned_key(&self, principal: &Principal, key_id: Uuid) -> Result<ApiKeyRecord, GatewayError> {
        let record = bounded(self.store_timeout, self.store.get_key(key_id))
            .await?
            .ok_or_else(|| GatewayError::key_not_found(key_id))?;
        if record.owner_id != principal.id {
            return Err(AuthorizationError::NotOwner.into());
        }
        Ok(record)
    }

    fn display_prefix(&self, secret: &SecretString) -> String {
        secret
            .expose_secret()
            .chars()
            .take(self.display_prefix_len)
            .collect()
    }
}

fn validate_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(ValidationError::InvalidName { max: MAX_NAME_LEN });
    }
    Ok(name.to_string())
}

fn invalid_status(status: &str) -> GatewayError {
    ValidationError::InvalidStatus {
        status: status.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GatewayStore, MemoryStore};

    fn principal(tier: Tier) -> Principal {
        Principal {
            id: Uuid::new_v4(),
            email: "dev@example.com".to_string(),
            tier,
        }
    }

    fn manager() -> (ApiKeyManager, Arc<MemoryStore>, Arc<SecretHasher>) {
        let store = Arc::new(MemoryStore::new());
        let hasher = Arc::new(SecretHasher::new("sk_", "pepper").unwrap());
        let manager = ApiKeyManager::new(
            store.clone(),
            hasher.clone(),
            TierTable::default(),
            &ApiKeysConfig::default(),
            Duration::from_secs(1),
        );
        (manager, store, hasher)
    }

    #[test]
    fn test_generated_secret_shape() {
        let hasher = SecretHasher::new("sk_", "").unwrap();
        let secret = hasher.generate();
        let raw = secret.expose_secret();

        assert!(raw.starts_with("sk_"));
        assert_eq!(raw.len(), 3 + SECRET_HEX_LEN);
        assert!(hasher.is_well_formed(raw));
        assert_ne!(raw, hasher.generate().expose_secret());
    }

    #[test]
    fn test_malformed_keys_rejected() {
        let hasher = SecretHasher::new("sk_", "").unwrap();
        assert!(!hasher.is_well_formed(""));
        assert!(!hasher.is_well_formed("sk_short"));
        assert!(!hasher.is_well_formed(&format!("pk_{}", "a".repeat(SECRET_HEX_LEN))));
        assert!(!hasher.is_well_formed(&format!("sk_{}", "g".repeat(SECRET_HEX_LEN))));
        assert!(hasher.is_well_formed(&format!("sk_{}", "0f".repeat(SECRET_HEX_LEN / 2))));
    }

    #[test]
    fn test_hash_depends_on_pepper() {
        let plain = SecretHasher::new("sk_", "").unwrap();
        let peppered = SecretHasher::new("sk_", "pepper").unwrap();
        let other = SecretHasher::new("sk_", "other").unwrap();

        let raw = "sk_0123";
        assert_eq!(plain.hash(raw), plain.hash(raw));
        assert_eq!(plain.hash(raw).len(), 64);
        assert_ne!(plain.hash(raw), peppered.hash(raw));
        assert_ne!(peppered.hash(raw), other.hash(raw));
        assert_ne!(peppered.hash(raw), raw);
    }

    #[tokio::test]
    async fn test_create_stores_only_hash_and_prefix() {
        let (manager, store, hasher) = manager();
        let owner = principal(Tier::Starter);

        let issued = manager.create(&owner, "  production  ").await.unwrap();
        let raw = issued.secret.expose_secret().to_string();
        assert_eq!(issued.name, "production");
        assert_eq!(issued.key_prefix, raw[..12]);

        let record = store.get_key(issued.id).await.unwrap().unwrap();
        assert_eq!(record.key_hash, hasher.hash(&raw));
        assert_ne!(record.key_hash, raw);
        assert_eq!(record.key_prefix, issued.key_prefix);
        assert_eq!(record.status, KeyStatus::Active);
        assert!(!format!("{record:?}").contains(&raw));
    }

    #[tokio::test]
    async fn test_trial_cannot_create_custom_keys() {
        let (manager, _, _) = manager();
        let err = manager.create(&principal(Tier::Trial), "mine").await.unwrap_err();
        assert_eq!(err.error_code(), "TIER_FORBIDDEN");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names() {
        let (manager, _, _) = manager();
        let owner = principal(Tier::Professional);

        assert!(manager.create(&owner, "   ").await.is_err());
        assert!(manager.create(&owner, &"n".repeat(MAX_NAME_LEN + 1)).await.is_err());
        assert!(manager.create(&owner, &"n".repeat(MAX_NAME_LEN)).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_never_exposes_secret() {
        let (manager, _, _) = manager();
        let owner = principal(Tier::Starter);
        let issued = manager.create(&owner, "ci").await.unwrap();
        let raw = issued.secret.expose_secret().to_string();

        let listing = manager.list(&owner).await.unwrap();
        assert_eq!(listing.total, 1);
        assert_eq!(listing.active, 1);
        let body = serde_json::to_string(&listing.keys).unwrap();
        assert!(!body.contains(&raw));
        assert!(!body.contains("key_hash"));
        assert!(body.contains(&issued.key_prefix));
    }

    #[tokio::test]
    async fn test_rotate_replaces_secret() {
        let (manager, store, hasher) = manager();
        let owner = principal(Tier::Starter);
        let issued = manager.create(&owner, "ci").await.unwrap();
        let old_raw = issued.secret.expose_secret().to_string();

        let rotated = manager.rotate(&owner, issued.id).await.unwrap();
        assert_eq!(rotated.id, issued.id);
        assert_eq!(rotated.created_at, issued.created_at);
        assert_ne!(rotated.secret.expose_secret(), old_raw);

        assert!(store.find_key_by_hash(&hasher.hash(&old_raw)).await.unwrap().is_none());
        let found = store
            .find_key_by_hash(&hasher.hash(rotated.secret.expose_secret()))
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(issued.id));
    }

    #[tokio::test]
    async fn test_rotate_checks_owner_and_status() {
        let (manager, _, _) = manager();
        let owner = principal(Tier::Starter);
        let issued = manager.create(&owner, "ci").await.unwrap();

        let err = manager.rotate(&principal(Tier::Starter), issued.id).await.unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");

        manager.revoke(&owner, issued.id).await.unwrap();
        let err = manager.rotate(&owner, issued.id).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATUS");

        let err = manager.rotate(&owner, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent_and_terminal() {
        let (manager, store, _) = manager();
        let owner = principal(Tier::Starter);
        let issued = manager.create(&owner, "ci").await.unwrap();

        let first = manager.revoke(&owner, issued.id).await.unwrap();
        assert_eq!(first.status, KeyStatus::Revoked);
        let second = manager.revoke(&owner, issued.id).await.unwrap();
        assert_eq!(second.status, KeyStatus::Revoked);

        let record = store.get_key(issued.id).await.unwrap().unwrap();
        assert_eq!(record.status, KeyStatus::Revoked);
        assert_eq!(manager.list(&owner).await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_revoke_requires_owner() {
        let (manager, _, _) = manager();
        let owner = principal(Tier::Starter);
        let issued = manager.create(&owner, "ci").await.unwrap();

        let err = manager.revoke(&principal(Tier::Enterprise), issued.id).await.unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_trial_provisioning() {
        let (manager, _, _) = manager();
        let trial = principal(Tier::Trial);

        let issued = manager.provision_trial(&trial).await.unwrap();
        assert_eq!(issued.name, TRIAL_KEY_NAME);
        let expires_at = issued.expires_at.unwrap();
        assert!(expires_at > issued.created_at + chrono::Duration::days(13));

        let err = manager.provision_trial(&trial).await.unwrap_err();
        assert_eq!(err.to_string(), ValidationError::AlreadyProvisioned.to_string());

        let err = manager.provision_trial(&principal(Tier::Starter)).await.unwrap_err();
        assert_eq!(err.to_string(), ValidationError::NotTrial.to_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_trial_provisioning_issues_one_key() {
        let (manager, _, _) = manager();
        let trial = principal(Tier::Trial);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = manager.clone();
            let trial = trial.clone();
            handles.push(tokio::spawn(async move { manager.provision_trial(&trial).await }));
        }
        let mut issued = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => issued += 1,
                Err(err) => {
                    assert_eq!(err.to_string(), ValidationError::AlreadyProvisioned.to_string())
                }
            }
        }
        assert_eq!(issued, 1);
        let listing = manager.list(&trial).await.unwrap();
        assert_eq!(listing.total, 1);
        assert_eq!(listing.active, 1);
    }

    #[tokio::test]
    async fn test_expired_trial_key_is_replaced() {
        let (manager, store, _) = manager();
        let trial = principal(Tier::Trial);
        store
            .insert_key(ApiKeyRecord {
                id: Uuid::new_v4(),
                owner_id: trial.id,
                key_hash: "stale".to_string(),
                key_prefix: "sk_aaaaaaaaa".to_string(),
                name: TRIAL_KEY_NAME.to_string(),
                status: KeyStatus::Active,
                created_at: Utc::now() - chrono::Duration::days(20),
                last_used_at: None,
                request_count: 3,
                expires_at: Some(Utc::now() - chrono::Duration::days(6)),
            })
            .await
            .unwrap();

        manager.provision_trial(&trial).await.unwrap();
        let listing = manager.list(&trial).await.unwrap();
        assert_eq!(listing.total, 2);
        assert_eq!(listing.active, 1);
        assert_eq!(
            listing
                .keys
                .iter()
                .filter(|k| k.status == KeyStatus::Active)
                .count(),
            1
        );
    }
}
