//! Health check module
//!
//! This module reports whether the gateway can serve traffic:
//! - Liveness (the process is up)
//! - Readiness, which also requires the key store to answer a ping
//! - Per component status for the `/health` body

use crate::store::{bounded, SharedStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Health status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, HealthStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health checker service
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    ready: Arc<AtomicBool>,
    version: String,
    store: SharedStore,
    store_timeout: Duration,
}

impl HealthChecker {
    pub fn new(store: SharedStore, store_timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(true)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store,
            store_timeout,
        }
    }

    /// Liveness only: healthy while the process runs
    pub fn liveness(&self) -> HealthResponse {
        HealthResponse {
            status: HealthStatus::Healthy,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            components: BTreeMap::new(),
            message: None,
        }
    }

    /// Readiness including component checks
    pub async fn readiness(&self) -> HealthResponse {
        let mut components = BTreeMap::new();

        let store = match bounded(self.store_timeout, self.store.ping()).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!(error = %e, "Store ping failed");
                HealthStatus::Unhealthy
            }
        };
        components.insert("store".to_string(), store);

        let accepting = self.is_ready();
        let status = if !accepting || store == HealthStatus::Unhealthy {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        let message = if !accepting {
            Some("Service is shutting down".to_string())
        } else if store == HealthStatus::Unhealthy {
            Some("Key store is unreachable".to_string())
        } else {
            None
        };

        HealthResponse {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            components,
            message,
        }
    }

    /// Flip readiness, e.g. when shutdown begins
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
