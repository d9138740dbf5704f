//! Durable store contract
//!
//! The gateway keeps no mutable key, rate or usage state in process memory
//! across requests; everything goes through a [`GatewayStore`]. The contract
//! needs point lookup by hash, atomic counter increments and time range
//! queries. [`MemoryStore`] implements it for single-process deployments and
//! tests.

mod memory;

pub use memory::{calendar_month, subscription_for, MemoryStore};

use crate::error::StoreError;
use crate::identity::{Principal, Tier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of an API key. Revocation is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Revoked => "revoked",
        }
    }
}

/// A persisted API key. The plaintext secret is never part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Whether the key may authenticate a request at `now`
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == KeyStatus::Active && !self.is_expired_at(now)
    }
}

/// Outcome of a conditional key update
#[derive(Debug, Clone, PartialEq)]
pub enum KeyUpdate {
    /// The update was applied
    Updated(ApiKeyRecord),
    /// The key was not in a state the update applies to; carries the current record
    Unchanged(ApiKeyRecord),
    NotFound,
}

/// Result of an atomic window increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Whether the increment was applied
    pub admitted: bool,
    /// Count in the window after the call
    pub count: u64,
}

/// An immutable audit entry for one processed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub key_id: Option<Uuid>,
    pub principal_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Payment state of a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Trialing,
    Active,
    PastDue,
    Canceled,
}

/// A principal's subscription. Read-only to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub principal_id: Uuid,
    pub tier: Tier,
    pub requests_per_minute: u32,
    pub monthly_requests: u64,
    pub overage_price: f64,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub payment_status: PaymentStatus,
}

/// Storage operations the gateway depends on
#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn insert_key(&self, record: ApiKeyRecord) -> Result<(), StoreError>;

    /// Insert `record` unless its owner already holds a key usable at `now`.
    /// The check and the insert happen as one step; `false` means nothing
    /// was written.
    async fn insert_key_unless_usable(
        &self,
        record: ApiKeyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get_key(&self, id: Uuid) -> Result<Option<ApiKeyRecord>, StoreError>;

    /// Point lookup by secret hash, regardless of status
    async fn find_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    async fn list_keys(&self, owner_id: Uuid) -> Result<Vec<ApiKeyRecord>, StoreError>;

    /// Atomically replace the hash and display prefix of an active key.
    /// The previous hash stops resolving once this returns.
    async fn replace_key_secret(
        &self,
        id: Uuid,
        key_hash: String,
        key_prefix: String,
    ) -> Result<KeyUpdate, StoreError>;

    /// Mark a key revoked. Already revoked keys come back as `Unchanged`.
    async fn revoke_key(&self, id: Uuid) -> Result<KeyUpdate, StoreError>;

    /// Atomically bump `request_count` and set `last_used_at`
    async fn record_key_use(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Increment the counter stored under `bucket` unless it already reached
    /// `limit`. Buckets expiring at or before `now` start over from zero.
    async fn increment_window(
        &self,
        bucket: &str,
        limit: u64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError>;

    /// Append a usage record. Records are never updated or deleted.
    async fn append_usage(&self, record: UsageRecord) -> Result<(), StoreError>;

    /// Usage records of a principal created in `[from, to)`
    async fn usage_between(
        &self,
        principal_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, StoreError>;

    async fn get_principal(&self, id: Uuid) -> Result<Option<Principal>, StoreError>;

    /// Insert or refresh a principal resolved by the identity provider
    async fn upsert_principal(&self, principal: Principal) -> Result<(), StoreError>;

    async fn get_subscription(&self, principal_id: Uuid) -> Result<Option<Subscription>, StoreError>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn GatewayStore>;

/// Run a store call with an upper bound on its duration
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout)?
}
