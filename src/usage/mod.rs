//! Usage metering
//!
//! Every processed request produces one [`UsageRecord`]. Writes are detached:
//! the caller's response never waits on them and a failed write is logged and
//! counted, not surfaced. In-flight writes are tracked so shutdown can flush
//! them. The read side aggregates records over a billing period.

use crate::config::TierTable;
use crate::error::GatewayError;
use crate::identity::{Principal, Tier};
use crate::metrics::GatewayMetrics;
use crate::store::{bounded, calendar_month, SharedStore, UsageRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};
use uuid::Uuid;

/// One request to be metered
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub request_id: Uuid,
    pub key_id: Option<Uuid>,
    pub principal_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub latency: Duration,
    pub error_code: Option<String>,
}

impl UsageEvent {
    fn into_record(self, created_at: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            request_id: self.request_id,
            key_id: self.key_id,
            principal_id: self.principal_id,
            endpoint: self.endpoint,
            method: self.method,
            status_code: self.status_code,
            response_time_ms: u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX),
            error_code: self.error_code,
            created_at,
        }
    }
}

/// Per-endpoint totals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_response_time_ms: f64,
}

/// Billing-period usage of a principal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub tier: Tier,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage of successful requests
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub monthly_allowance: u64,
    pub remaining_requests: u64,
    pub overage_requests: u64,
    pub overage_cost: f64,
    pub endpoints: Vec<EndpointUsage>,
}

#[derive(Default)]
struct Totals {
    requests: u64,
    successful: u64,
    latency_ms: u64,
}

impl Totals {
    fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        if record.is_success() {
            self.successful += 1;
        }
        self.latency_ms = self.latency_ms.saturating_add(record.response_time_ms);
    }

    fn failed(&self) -> u64 {
        self.requests - self.successful
    }

    fn average_latency(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.latency_ms as f64 / self.requests as f64
        }
    }
}

/// Records usage and answers billing-period queries
#[derive(Clone)]
pub struct UsageMeter {
    store: SharedStore,
    tiers: TierTable,
    tracker: TaskTracker,
    store_timeout: Duration,
    metrics: GatewayMetrics,
}

impl UsageMeter {
    pub fn new(store: SharedStore, tiers: TierTable, store_timeout: Duration, metrics: GatewayMetrics) -> Self {
        Self {
            store,
            tiers,
            tracker: TaskTracker::new(),
            store_timeout,
            metrics,
        }
    }

    /// Persist a usage record without blocking the caller
    pub fn record(&self, event: UsageEvent) {
        let record = event.into_record(Utc::now());
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let timeout = self.store_timeout;

        self.tracker.spawn(async move {
            let request_id = record.request_id;
            let status_code = record.status_code;
            match bounded(timeout, store.append_usage(record)).await {
                Ok(()) => debug!(request_id = %request_id, status_code, "Usage recorded"),
                Err(err) => {
                    metrics.record_usage_write_failure();
                    error!(request_id = %request_id, error = %err, "Failed to persist usage record");
                }
            }
        });
    }

    /// Wait for every write started so far
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of writes still in flight
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Usage of `principal` in the billing period containing `now`
    pub async fn summarize(&self, principal: &Principal, now: DateTime<Utc>) -> Result<UsageSummary, GatewayError> {
        let subscription = bounded(self.store_timeout, self.store.get_subscription(principal.id)).await?;
        let (tier, period_start, period_end, allowance, overage_price) = match subscription {
            Some(s) => (
                s.tier,
                s.current_period_start,
                s.current_period_end,
                s.monthly_requests,
                s.overage_price,
            ),
            None => {
                let limits = self.tiers.get(principal.tier);
                let (start, end) = calendar_month(now);
                (
                    principal.tier,
                    start,
                    end,
                    limits.monthly_requests,
                    limits.overage_price,
                )
            }
        };

        let records = bounded(
            self.store_timeout,
            self.store.usage_between(principal.id, period_start, period_end),
        )
        .await?;

        let mut overall = Totals::default();
        let mut by_endpoint: BTreeMap<&str, Totals> = BTreeMap::new();
        for record in &records {
            overall.add(record);
            by_endpoint
                .entry(record.endpoint.as_str())
                .or_default()
                .add(record);
        }

        // only successful requests are billable
        let overage_requests = overall.successful.saturating_sub(allowance);
        let success_rate = if overall.requests == 0 {
            0.0
        } else {
            overall.successful as f64 / overall.requests as f64 * 100.0
        };

        Ok(UsageSummary {
            tier,
            period_start,
            period_end,
            total_requests: overall.requests,
            successful_requests: overall.successful,
            failed_requests: overall.failed(),
            success_rate,
            average_response_time_ms: overall.average_latency(),
            monthly_allowance: allowance,
            remaining_requests: allowance.saturating_sub(overall.successful),
            overage_requests,
            overage_cost: overage_requests as f64 * overage_price,
            endpoints: by_endpoint
                .into_iter()
                .map(|(endpoint, totals)| EndpointUsage {
                    endpoint: endpoint.to_string(),
                    requests: totals.requests,
                    successful: totals.successful,
                    failed: totals.failed(),
                    average_response_time_ms: totals.average_latency(),
                })
                .collect(),
        })
    }
}
