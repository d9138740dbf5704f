//! Gateway coordinator
//!
//! Runs the per-request pipeline for `POST /optimize-route`:
//!
//! ```text
//! Received -> Authenticating -> RateLimiting -> Dispatching -> Recording -> Responded
//! ```
//!
//! A failure in any stage jumps straight to `Recording`. Recording always runs
//! before the response is produced. Key management operations share the
//! authentication step but are neither rate limited nor metered.

use crate::api_key::{ApiKeyManager, ApiKeySummary, IssuedKey, KeyListing, SecretHasher};
use crate::config::GatewayConfig;
use crate::credentials;
use crate::envelope::GatewayResponse;
use crate::error::{AuthError, GatewayError};
use crate::identity::{ApiKeyStrategy, BearerTokenStrategy, IdentityResolver, ResolvedIdentity};
use crate::metrics::GatewayMetrics;
use crate::optimize::RouteOptimizationRequest;
use crate::proxy::{OptimizationDispatcher, SharedDispatcher};
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::store::SharedStore;
use crate::usage::{UsageEvent, UsageMeter, UsageSummary};
use axum::http::{HeaderMap, StatusCode};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Endpoint name written to usage records
pub const OPTIMIZE_ENDPOINT: &str = "/optimize-route";

/// Pipeline stage of an optimize request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Authenticating,
    RateLimiting,
    Dispatching,
    Recording,
    Responded,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Authenticating => "authenticating",
            Stage::RateLimiting => "rate_limiting",
            Stage::Dispatching => "dispatching",
            Stage::Recording => "recording",
            Stage::Responded => "responded",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is known about one request as it moves through the stages
struct Pipeline {
    request_id: Uuid,
    started: Instant,
    stage: Stage,
    key_id: Option<Uuid>,
    principal_id: Option<Uuid>,
    rate: Option<RateLimitDecision>,
    usage_code: Option<&'static str>,
}

impl Pipeline {
    fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            started: Instant::now(),
            stage: Stage::Received,
            key_id: None,
            principal_id: None,
            rate: None,
            usage_code: None,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug!(request_id = %self.request_id, from = %self.stage, to = %next, "Pipeline transition");
        self.stage = next;
    }

    fn attributable(&self) -> bool {
        self.key_id.is_some() || self.principal_id.is_some()
    }
}

/// Orchestrates authentication, rate limiting, dispatch and metering
#[derive(Clone)]
pub struct GatewayCoordinator {
    resolver: IdentityResolver,
    limiter: RateLimiter,
    dispatcher: SharedDispatcher,
    meter: UsageMeter,
    keys: ApiKeyManager,
    metrics: GatewayMetrics,
}

impl GatewayCoordinator {
    pub fn new(
        resolver: IdentityResolver,
        limiter: RateLimiter,
        dispatcher: SharedDispatcher,
        meter: UsageMeter,
        keys: ApiKeyManager,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            resolver,
            limiter,
            dispatcher,
            meter,
            keys,
            metrics,
        }
    }

    /// Wire every component from configuration around a shared store
    pub fn from_config(
        config: &GatewayConfig,
        store: SharedStore,
        metrics: GatewayMetrics,
    ) -> anyhow::Result<Self> {
        let store_timeout = config.store.timeout();
        let hasher = Arc::new(SecretHasher::new(
            config.api_keys.prefix.clone(),
            &config.api_keys.hash_pepper,
        )?);

        let mut resolver = IdentityResolver::default();
        match BearerTokenStrategy::from_config(&config.identity_provider, store.clone(), store_timeout) {
            Some(bearer) => resolver = resolver.with_strategy(Arc::new(bearer)),
            None => warn!("No identity provider configured, bearer tokens will be rejected"),
        }
        resolver = resolver.with_strategy(Arc::new(ApiKeyStrategy::new(
            store.clone(),
            hasher.clone(),
            store_timeout,
        )));

        let limiter = RateLimiter::new(
            store.clone(),
            config.tiers.clone(),
            config.rate_window(),
            store_timeout,
        );
        let meter = UsageMeter::new(store.clone(), config.tiers.clone(), store_timeout, metrics.clone());
        let keys = ApiKeyManager::new(store, hasher, config.tiers.clone(), &config.api_keys, store_timeout);
        let dispatcher = Arc::new(OptimizationDispatcher::from_config(&config.upstream)?);

        Ok(Self::new(resolver, limiter, dispatcher, meter, keys, metrics))
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }

    /// Resolve the caller from request headers
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<ResolvedIdentity, GatewayError> {
        let presented = credentials::extract_all(headers);
        if presented.is_empty() {
            return Err(AuthError::Unauthenticated.into());
        }
        Ok(self.resolver.resolve(&presented).await?)
    }

    /// Run the optimize pipeline for one request
    pub async fn handle_optimize(&self, headers: &HeaderMap, body: &[u8]) -> GatewayResponse {
        let mut pipeline = Pipeline::new(Uuid::new_v4());
        let outcome = self.run_optimize(&mut pipeline, headers, body).await;

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                debug!(
                    request_id = %pipeline.request_id,
                    stage = %pipeline.stage,
                    code = err.usage_code(),
                    error = %err,
                    "Optimize request failed"
                );
                pipeline.usage_code = Some(err.usage_code());
                GatewayResponse::error(&err, pipeline.request_id)
            }
        };
        pipeline.advance(Stage::Recording);
        let response = match &pipeline.rate {
            Some(decision) => response.with_headers(decision.to_header_map()),
            None => response,
        };

        if pipeline.attributable() {
            self.meter.record(UsageEvent {
                request_id: pipeline.request_id,
                key_id: pipeline.key_id,
                principal_id: pipeline.principal_id,
                endpoint: OPTIMIZE_ENDPOINT.to_string(),
                method: "POST".to_string(),
                status_code: response.status.as_u16(),
                latency: pipeline.started.elapsed(),
                error_code: pipeline.usage_code.map(str::to_string),
            });
        } else {
            debug!(request_id = %pipeline.request_id, "No attributable caller, usage not recorded");
        }

        pipeline.advance(Stage::Responded);
        response
    }

    async fn run_optimize(
        &self,
        pipeline: &mut Pipeline,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<GatewayResponse, GatewayError> {
        pipeline.advance(Stage::Authenticating);
        let identity = match self.authenticate(headers).await {
            Ok(identity) => identity,
            Err(err) => {
                if let GatewayError::Auth(AuthError::InvalidApiKey {
                    attribution: Some(key),
                }) = &err
                {
                    pipeline.key_id = Some(key.key_id);
                    pipeline.principal_id = Some(key.owner_id);
                }
                return Err(err);
            }
        };
        pipeline.key_id = identity.key_id;
        pipeline.principal_id = Some(identity.principal.id);
        let tier = identity.principal.tier;

        pipeline.advance(Stage::RateLimiting);
        let decision = self.limiter.check(&identity.rate_subject(), tier).await?;
        pipeline.rate = Some(decision.clone());
        if !decision.allowed {
            self.metrics.record_rate_limited(tier.as_str());
            info!(
                request_id = %pipeline.request_id,
                subject = %identity.rate_subject(),
                tier = %tier,
                "Rate limit exceeded"
            );
            return Err(GatewayError::RateLimited(decision));
        }

        pipeline.advance(Stage::Dispatching);
        let payload = RouteOptimizationRequest::from_slice(body)?;
        let upstream = match self.dispatcher.dispatch(&payload, pipeline.request_id).await {
            Ok(upstream) => upstream,
            Err(err) => {
                self.metrics.record_upstream_failure(err.kind());
                warn!(request_id = %pipeline.request_id, error = %err, "Dispatch failed");
                return Err(err.into());
            }
        };

        let mut metadata = upstream.metadata;
        metadata.insert(
            "processing_time_ms".to_string(),
            json!(u64::try_from(pipeline.started.elapsed().as_millis()).unwrap_or(u64::MAX)),
        );
        let usage = json!({
            "billing_tier": tier,
            "rate_limit": decision.limit,
            "requests_remaining": decision.remaining,
            "rate_limit_reset": decision.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        });

        Ok(GatewayResponse::success(
            StatusCode::OK,
            upstream.data,
            Value::Object(metadata),
            usage,
            pipeline.request_id,
        ))
    }

    pub async fn create_key(&self, headers: &HeaderMap, name: &str) -> Result<IssuedKey, GatewayError> {
        let identity = self.authenticate(headers).await?;
        self.keys.create(&identity.principal, name).await
    }

    pub async fn rotate_key(&self, headers: &HeaderMap, key_id: Uuid) -> Result<IssuedKey, GatewayError> {
        let identity = self.authenticate(headers).await?;
        self.keys.rotate(&identity.principal, key_id).await
    }

    pub async fn revoke_key(&self, headers: &HeaderMap, key_id: Uuid) -> Result<ApiKeySummary, GatewayError> {
        let identity = self.authenticate(headers).await?;
        self.keys.revoke(&identity.principal, key_id).await
    }

    pub async fn list_keys(&self, headers: &HeaderMap) -> Result<KeyListing, GatewayError> {
        let identity = self.authenticate(headers).await?;
        self.keys.list(&identity.principal).await
    }

    pub async fn provision_trial(&self, headers: &HeaderMap) -> Result<IssuedKey, GatewayError> {
        let identity = self.authenticate(headers).await?;
        self.keys.provision_trial(&identity.principal).await
    }

    pub async fn usage_summary(&self, headers: &HeaderMap) -> Result<UsageSummary, GatewayError> {
        let identity = self.authenticate(headers).await?;
        self.meter.summarize(&identity.principal, Utc::now()).await
    }
}
