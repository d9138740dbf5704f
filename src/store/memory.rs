//! Process-local store backed by concurrent maps

use super::{
    ApiKeyRecord, GatewayStore, KeyStatus, KeyUpdate, PaymentStatus, Subscription, UsageRecord,
    WindowCount,
};
use crate::config::{SeedPrincipal, TierTable};
use crate::error::StoreError;
use crate::identity::{Principal, Tier};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// In-memory [`GatewayStore`]
///
/// Each map entry is guarded by its shard lock, which makes the counter and
/// conditional key updates atomic with respect to concurrent requests.
#[derive(Default)]
pub struct MemoryStore {
    keys: DashMap<Uuid, ApiKeyRecord>,
    hash_index: DashMap<String, Uuid>,
    windows: DashMap<String, Window>,
    principals: DashMap<Uuid, Principal>,
    subscriptions: DashMap<Uuid, Subscription>,
    // held while a conditional insert inspects an owner's keys
    owner_locks: DashMap<Uuid, ()>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store preloaded with principals and a subscription for each
    pub fn seeded(principals: &[SeedPrincipal], tiers: &TierTable) -> Self {
        let store = Self::new();
        let now = Utc::now();
        for seed in principals {
            store.put_principal(Principal {
                id: seed.id,
                email: seed.email.clone(),
                tier: seed.tier,
            });
            store.put_subscription(subscription_for(seed.id, seed.tier, tiers, now));
        }
        store
    }

    pub fn put_principal(&self, principal: Principal) {
        self.principals.insert(principal.id, principal);
    }

    pub fn put_subscription(&self, subscription: Subscription) {
        self.subscriptions.insert(subscription.principal_id, subscription);
    }

    /// Drop rate windows that expired before `now`
    pub fn sweep_windows(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.expires_at > now);
        let swept = before.saturating_sub(self.windows.len());
        if swept > 0 {
            debug!(swept, "Swept expired rate windows");
        }
        swept
    }

    fn insert_record(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        match self.hash_index.entry(record.key_hash.clone()) {
            Entry::Occupied(_) => return Err(StoreError::backend("duplicate key hash")),
            Entry::Vacant(slot) => {
                slot.insert(record.id);
            }
        }
        self.keys.insert(record.id, record);
        Ok(())
    }

    fn conditional_update<F>(&self, id: Uuid, apply: F) -> KeyUpdate
    where
        F: FnOnce(&mut ApiKeyRecord) -> bool,
    {
        match self.keys.get_mut(&id) {
            Some(mut record) => {
                if apply(record.value_mut()) {
                    KeyUpdate::Updated(record.value().clone())
                } else {
                    KeyUpdate::Unchanged(record.value().clone())
                }
            }
            None => KeyUpdate::NotFound,
        }
    }
}

/// Subscription for a freshly seeded principal, covering the current calendar month
pub fn subscription_for(
    principal_id: Uuid,
    tier: Tier,
    tiers: &TierTable,
    now: DateTime<Utc>,
) -> Subscription {
    let limits = tiers.get(tier);
    let (current_period_start, current_period_end) = calendar_month(now);
    Subscription {
        principal_id,
        tier,
        requests_per_minute: limits.requests_per_minute,
        monthly_requests: limits.monthly_requests,
        overage_price: limits.overage_price,
        current_period_start,
        current_period_end,
        payment_status: match tier {
            Tier::Trial => PaymentStatus::Trialing,
            _ => PaymentStatus::Active,
        },
    }
}

/// Start and exclusive end of the calendar month containing `now`
pub fn calendar_month(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, end)
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn insert_key(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        self.insert_record(record)
    }

    async fn insert_key_unless_usable(
        &self,
        record: ApiKeyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _owner = self.owner_locks.entry(record.owner_id).or_default();
        let held = self
            .keys
            .iter()
            .any(|entry| entry.owner_id == record.owner_id && entry.is_usable_at(now));
        if held {
            return Ok(false);
        }
        self.insert_record(record)?;
        Ok(true)
    }

    async fn get_key(&self, id: Uuid) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self.keys.get(&id).map(|r| r.value().clone()))
    }

    async fn find_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let Some(id) = self.hash_index.get(key_hash).map(|id| *id) else {
            return Ok(None);
        };
        // the index can briefly point at a record whose secret was just rotated
        Ok(self
            .keys
            .get(&id)
            .filter(|record| record.key_hash == key_hash)
            .map(|record| record.value().clone()))
    }

    async fn list_keys(&self, owner_id: Uuid) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let mut keys: Vec<ApiKeyRecord> = self
            .keys
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn replace_key_secret(
        &self,
        id: Uuid,
        key_hash: String,
        key_prefix: String,
    ) -> Result<KeyUpdate, StoreError> {
        match self.hash_index.entry(key_hash.clone()) {
            Entry::Occupied(_) => return Err(StoreError::backend("duplicate key hash")),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let mut old_hash = None;
        let outcome = self.conditional_update(id, |record| {
            if record.status != KeyStatus::Active {
                return false;
            }
            old_hash = Some(std::mem::replace(&mut record.key_hash, key_hash.clone()));
            record.key_prefix = key_prefix;
            true
        });

        match old_hash {
            Some(old) => {
                self.hash_index.remove(&old);
            }
            None => {
                self.hash_index.remove(&key_hash);
            }
        }
        Ok(outcome)
    }

    async fn revoke_key(&self, id: Uuid) -> Result<KeyUpdate, StoreError> {
        Ok(self.conditional_update(id, |record| {
            if record.status == KeyStatus::Revoked {
                return false;
            }
            record.status = KeyStatus::Revoked;
            true
        }))
    }

    async fn record_key_use(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(mut record) = self.keys.get_mut(&id) {
            record.request_count += 1;
            record.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn increment_window(
        &self,
        bucket: &str,
        limit: u64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError> {
        let mut window = self.windows.entry(bucket.to_string()).or_insert(Window {
            count: 0,
            expires_at,
        });
        if window.expires_at <= now {
            *window = Window {
                count: 0,
                expires_at,
            };
        }
        if window.count >= limit {
            return Ok(WindowCount {
                admitted: false,
                count: window.count,
            });
        }
        window.count += 1;
        Ok(WindowCount {
            admitted: true,
            count: window.count,
        })
    }

    async fn append_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.usage.write().await.push(record);
        Ok(())
    }

    async fn usage_between(
        &self,
        principal_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        Ok(self
            .usage
            .read()
            .await
            .iter()
            .filter(|r| r.principal_id == Some(principal_id))
            .filter(|r| r.created_at >= from && r.created_at < to)
            .cloned()
            .collect())
    }

    async fn get_principal(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        Ok(self.principals.get(&id).map(|p| p.value().clone()))
    }

    async fn upsert_principal(&self, principal: Principal) -> Result<(), StoreError> {
        self.put_principal(principal);
        Ok(())
    }

    async fn get_subscription(&self, principal_id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.get(&principal_id).map(|s| s.value().clone()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
