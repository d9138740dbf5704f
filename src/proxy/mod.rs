//! Proxy module for forwarding optimization requests upstream
//!
//! This module hands a validated payload to the optimization service:
//! - Internal trust header carrying the shared secret (never an end-user credential)
//! - Correlation id header for joining upstream logs to usage records
//! - Bounded dispatch time
//! - Upstream failures and unexpected bodies mapped to typed errors

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::optimize::RouteOptimizationRequest;
use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header carrying the correlation id to the upstream
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A successful upstream answer
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub data: Value,
    pub metadata: Map<String, Value>,
}

impl UpstreamResponse {
    /// Split an upstream JSON object into result data and metadata.
    ///
    /// Objects that already carry a `data` field are unwrapped; anything else
    /// is taken as the data itself.
    fn from_object(mut object: Map<String, Value>) -> Self {
        let metadata = match object.remove("metadata") {
            Some(Value::Object(metadata)) => metadata,
            Some(other) => {
                object.insert("metadata".to_string(), other);
                Map::new()
            }
            None => Map::new(),
        };
        let data = match object.remove("data") {
            Some(data) => data,
            None => Value::Object(object),
        };
        Self { data, metadata }
    }
}

/// Something that can run an optimization
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        payload: &RouteOptimizationRequest,
        request_id: Uuid,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

pub type SharedDispatcher = Arc<dyn Dispatcher>;

/// HTTP dispatcher for the optimization service
pub struct OptimizationDispatcher {
    client: reqwest::Client,
    url: String,
    trust_header: HeaderName,
    secret: SecretString,
    timeout: Duration,
}

impl OptimizationDispatcher {
    pub fn new(
        url: impl Into<String>,
        trust_header: &str,
        secret: SecretString,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let trust_header = HeaderName::try_from(trust_header)
            .map_err(|e| UpstreamError::Unavailable(format!("invalid trust header: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url: url.into(),
            trust_header,
            secret,
            timeout,
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        Self::new(
            config.url.clone(),
            &config.trust_header,
            SecretString::from(config.secret.clone()),
            config.timeout(),
        )
    }

    fn trust_value(&self) -> Result<HeaderValue, UpstreamError> {
        let mut value = HeaderValue::from_str(self.secret.expose_secret())
            .map_err(|_| UpstreamError::Unavailable("trust secret is not a valid header value".into()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[async_trait]
impl Dispatcher for OptimizationDispatcher {
    async fn dispatch(
        &self,
        payload: &RouteOptimizationRequest,
        request_id: Uuid,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let response = self
            .client
            .post(&self.url)
            .header(self.trust_header.clone(), self.trust_value()?)
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Unavailable(e.without_url().to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(request_id = %request_id, status = status.as_u16(), "Optimization service returned an error status");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::InvalidResponse(e.without_url().to_string())
            }
        })?;
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;

        match parsed {
            Value::Object(object) => {
                debug!(request_id = %request_id, bytes = body.len(), "Optimization service answered");
                Ok(UpstreamResponse::from_object(object))
            }
            other => Err(UpstreamError::InvalidResponse(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
