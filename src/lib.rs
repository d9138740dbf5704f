//! Route Gateway - an authenticating, metering API gateway for route optimization
//!
//! This crate provides:
//! - API key and bearer token authentication through pluggable strategies
//! - API key lifecycle management with tier gating and trial provisioning
//! - Per key fixed-window rate limiting
//! - Usage metering and billing-period summaries
//! - A validated passthrough to the route optimization service
//! - Prometheus metrics and health checks

pub mod api_key;
pub mod config;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod optimize;
pub mod proxy;
pub mod rate_limit;
pub mod routes;
pub mod store;
pub mod usage;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::GatewayCoordinator;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
