//! Metrics module for Prometheus
//!
//! This module provides metrics collection for the gateway service:
//! - Request count by endpoint and status
//! - Request latency histogram
//! - Rate limit denials by tier
//! - Usage write failures
//! - Upstream failures by kind

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_latency: HistogramVec,
    rate_limited_counter: CounterVec,
    usage_write_failures: IntCounter,
    upstream_failures: CounterVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["endpoint", "status"],
        )?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["endpoint"],
        )?;

        let rate_limited_counter = CounterVec::new(
            Opts::new("gateway_rate_limited_total", "Requests denied by the rate limiter"),
            &["tier"],
        )?;

        let usage_write_failures = IntCounter::new(
            "gateway_usage_write_failures_total",
            "Usage records that could not be persisted",
        )?;

        let upstream_failures = CounterVec::new(
            Opts::new(
                "gateway_upstream_failures_total",
                "Failed calls to the optimization service",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(request_counter.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(rate_limited_counter.clone()))?;
        registry.register(Box::new(usage_write_failures.clone()))?;
        registry.register(Box::new(upstream_failures.clone()))?;

        Ok(Self {
            registry,
            request_counter,
            request_latency,
            rate_limited_counter,
            usage_write_failures,
            upstream_failures,
        })
    }

    /// Record a request with its status and latency.
    ///
    /// `endpoint` should be the matched route template, not the raw path.
    pub fn record_request(&self, endpoint: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();

        self.request_counter
            .with_label_values(&[endpoint, &status_str])
            .inc();

        self.request_latency
            .with_label_values(&[endpoint])
            .observe(latency.as_secs_f64());
    }

    pub fn record_rate_limited(&self, tier: &str) {
        self.rate_limited_counter.with_label_values(&[tier]).inc();
    }

    pub fn record_usage_write_failure(&self) {
        self.usage_write_failures.inc();
    }

    pub fn record_upstream_failure(&self, kind: &str) {
        self.upstream_failures.with_label_values(&[kind]).inc();
    }

    pub fn usage_write_failures(&self) -> u64 {
        self.usage_write_failures.get()
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_request("/optimize-route", 200, Duration::from_millis(10));
        metrics.record_request("/optimize-route", 429, Duration::from_millis(1));

        let output = metrics.prometheus_output().unwrap();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("gateway_request_latency_seconds"));
        assert!(output.contains("status=\"429\""));
        assert!(output.contains("endpoint=\"/optimize-route\""));
    }

    #[test]
    fn test_rate_limited_counter() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_rate_limited("starter");
        metrics.record_rate_limited("starter");

        let output = metrics.prometheus_output().unwrap();
        assert!(output.contains("gateway_rate_limited_total{tier=\"starter\"} 2"));
    }

    #[test]
    fn test_failure_counters() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_usage_write_failure();
        metrics.record_upstream_failure("timeout");

        assert_eq!(metrics.usage_write_failures(), 1);
        let output = metrics.prometheus_output().unwrap();
        assert!(output.contains("gateway_usage_write_failures_total 1"));
        assert!(output.contains("kind=\"timeout\""));
    }

    #[test]
    fn test_instances_are_independent() {
        let first = GatewayMetrics::new().unwrap();
        let second = GatewayMetrics::new().unwrap();
        first.record_usage_write_failure();
        assert_eq!(second.usage_write_failures(), 0);
    }
}
