//! Tiered fixed-window rate limiting
//!
//! Requests are counted per subject in windows aligned to multiples of the
//! window length. The count lives in the store and is incremented atomically,
//! so every gateway instance sharing a store enforces the same limit. Denied
//! requests do not consume quota.

use crate::config::TierTable;
use crate::error::StoreError;
use crate::identity::Tier;
use crate::store::{bounded, SharedStore};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// What a request is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateSubject {
    /// Requests authenticated with an API key count against that key
    ApiKey(Uuid),
    /// Session-authenticated requests count against the principal
    Principal(Uuid),
}

impl fmt::Display for RateSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSubject::ApiKey(id) => write!(f, "key:{id}"),
            RateSubject::Principal(id) => write!(f, "principal:{id}"),
        }
    }
}

/// Outcome of a rate check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests left in the window after this one
    pub remaining: u32,
    /// End of the current window
    pub reset_at: DateTime<Utc>,
    /// Seconds to wait before retrying, set when denied
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    /// Informational headers attached to responses
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(self.limit));
        headers.insert(
            HeaderName::from_static(REMAINING_HEADER),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static(RESET_HEADER),
            HeaderValue::from(self.reset_at.timestamp()),
        );
        if let Some(retry_after) = self.retry_after {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        headers
    }
}

/// Store-backed rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    tiers: TierTable,
    window: Duration,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: SharedStore, tiers: TierTable, window: Duration, store_timeout: Duration) -> Self {
        Self {
            store,
            tiers,
            window,
            store_timeout,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count a request for `subject` at the allowance of `tier`
    pub async fn check(&self, subject: &RateSubject, tier: Tier) -> Result<RateLimitDecision, StoreError> {
        self.check_at(subject, tier, Utc::now()).await
    }

    /// Same as [`check`](Self::check) with an explicit clock
    pub async fn check_at(
        &self,
        subject: &RateSubject,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError> {
        let limit = self.tiers.get(tier).requests_per_minute;
        let window_secs = self.window.as_secs().max(1) as i64;
        let index = now.timestamp().div_euclid(window_secs);
        let reset_at = Utc
            .timestamp_opt((index + 1) * window_secs, 0)
            .single()
            .ok_or_else(|| StoreError::backend("rate window out of range"))?;
        let bucket = format!("rate:{subject}:{index}");

        let counted = bounded(
            self.store_timeout,
            self.store
                .increment_window(&bucket, u64::from(limit), now, reset_at),
        )
        .await?;

        let remaining = u64::from(limit).saturating_sub(counted.count);
        let decision = RateLimitDecision {
            allowed: counted.admitted,
            limit,
            remaining: u32::try_from(remaining).unwrap_or(0),
            reset_at,
            retry_after: (!counted.admitted)
                .then(|| (reset_at - now).num_seconds().max(1) as u64),
        };

        debug!(
            subject = %subject,
            tier = %tier,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Rate check"
        );
        Ok(decision)
    }
}
