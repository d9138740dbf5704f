//! Error taxonomy for the gateway
//!
//! Every component returns one of the typed errors below. `GatewayError` is
//! the single place where they are mapped to an HTTP status, a client-facing
//! error code and the error code written to the usage log.

use crate::rate_limit::RateLimitDecision;
use axum::http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// The key an authentication failure can be attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRef {
    pub key_id: Uuid,
    pub owner_id: Uuid,
}

/// Failures resolving a caller's identity
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    /// No usable credential was presented
    #[error("authentication required")]
    Unauthenticated,
    /// The API key is malformed, unknown, revoked or expired
    #[error("invalid API key")]
    InvalidApiKey { attribution: Option<KeyRef> },
    /// The session token was rejected by the identity provider
    #[error("invalid or expired session token")]
    InvalidToken,
    /// The identity provider or key store could not answer in time
    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Failures authorizing an operation for a resolved principal
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthorizationError {
    #[error("the {tier} tier cannot create custom API keys")]
    TierForbidden { tier: String },
    #[error("API key belongs to another principal")]
    NotOwner,
}

/// Malformed input or an operation invalid for the current state
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("API key is {status}")]
    InvalidStatus { status: String },
    #[error("invalid request: {0}")]
    InvalidPayload(String),
    #[error("key name must be between 1 and {max} characters")]
    InvalidName { max: usize },
    #[error("an active trial key already exists")]
    AlreadyProvisioned,
    #[error("trial keys are only issued to trial principals")]
    NotTrial,
}

/// Failures talking to the optimization service
#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpstreamError {
    #[error("optimization service timed out")]
    Timeout,
    #[error("optimization service unreachable: {0}")]
    Unavailable(String),
    #[error("optimization service answered with status {status}")]
    Status { status: u16 },
    #[error("optimization service returned an unexpected body: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Unavailable(_) => "unavailable",
            UpstreamError::Status { .. } => "status",
            UpstreamError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Failures of the durable store
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store call timed out")]
    Timeout,
    #[error("store failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend<T: ToString>(msg: T) -> Self {
        Self::Backend(msg.to_string())
    }
}

/// Top-level gateway error
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The request outlived the server-wide deadline
    #[error("request exceeded the server deadline")]
    DeadlineExceeded,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn key_not_found(id: Uuid) -> Self {
        Self::NotFound(format!("API key {id}"))
    }

    pub fn internal<T: ToString>(msg: T) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Auth(AuthError::ProviderUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Authorization(_) => StatusCode::FORBIDDEN,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(UpstreamError::Timeout)
            | GatewayError::Upstream(UpstreamError::Unavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Store(StoreError::Timeout) | GatewayError::DeadlineExceeded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Store(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Error code shown to the client in the envelope
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Auth(AuthError::Unauthenticated) => "UNAUTHENTICATED",
            GatewayError::Auth(AuthError::InvalidApiKey { .. }) => "INVALID_API_KEY",
            GatewayError::Auth(AuthError::InvalidToken) => "INVALID_TOKEN",
            GatewayError::Auth(AuthError::ProviderUnavailable(_)) => "SERVICE_UNAVAILABLE",
            GatewayError::Authorization(AuthorizationError::TierForbidden { .. }) => {
                "TIER_FORBIDDEN"
            }
            GatewayError::Authorization(AuthorizationError::NotOwner) => "FORBIDDEN",
            GatewayError::Validation(ValidationError::InvalidStatus { .. }) => "INVALID_STATUS",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            GatewayError::Upstream(UpstreamError::Timeout)
            | GatewayError::Upstream(UpstreamError::Unavailable(_)) => "SERVICE_UNAVAILABLE",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::Store(StoreError::Timeout) | GatewayError::DeadlineExceeded => {
                "SERVICE_UNAVAILABLE"
            }
            GatewayError::Store(_) | GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Error code written to the usage record
    pub fn usage_code(&self) -> &'static str {
        match self {
            GatewayError::Auth(AuthError::ProviderUnavailable(_)) => "PROVIDER_UNAVAILABLE",
            GatewayError::Upstream(UpstreamError::Timeout) => "UPSTREAM_TIMEOUT",
            GatewayError::Upstream(_) => "SERVICE_ERROR",
            GatewayError::DeadlineExceeded => "GATEWAY_TIMEOUT",
            GatewayError::Store(_) | GatewayError::Internal(_) => "INTERNAL_ERROR",
            other => other.error_code(),
        }
    }

    /// Message safe to show to the client
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Auth(AuthError::ProviderUnavailable(_)) => {
                "Authentication service is temporarily unavailable".to_string()
            }
            GatewayError::RateLimited(_) => "Rate limit exceeded, retry later".to_string(),
            GatewayError::Upstream(UpstreamError::Timeout) => {
                "Route optimization service timed out".to_string()
            }
            GatewayError::Upstream(UpstreamError::Unavailable(_)) => {
                "Route optimization service is unavailable".to_string()
            }
            GatewayError::Upstream(_) => {
                "Route optimization service returned an invalid response".to_string()
            }
            GatewayError::Store(StoreError::Timeout) => {
                "Service temporarily unavailable".to_string()
            }
            GatewayError::DeadlineExceeded => "Request timed out, retry later".to_string(),
            GatewayError::Store(_) | GatewayError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Structured details for the envelope, if any are safe to expose
    pub fn details(&self) -> Option<Value> {
        match self {
            GatewayError::RateLimited(decision) => Some(json!({
                "limit": decision.limit,
                "remaining": decision.remaining,
                "reset_at": decision.reset_at.timestamp(),
                "retry_after": decision.retry_after,
            })),
            GatewayError::Authorization(AuthorizationError::TierForbidden { tier }) => {
                Some(json!({ "tier": tier }))
            }
            _ => None,
        }
    }

    /// Whether the full error should only be logged server side
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            GatewayError::Store(StoreError::Backend(_)) | GatewayError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::from(AuthError::Unauthenticated).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::from(AuthorizationError::NotOwner).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::from(ValidationError::AlreadyProvisioned).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::from(UpstreamError::Timeout).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::from(UpstreamError::Status { status: 500 }).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::from(AuthError::ProviderUnavailable("down".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_upstream_usage_codes() {
        assert_eq!(
            GatewayError::from(UpstreamError::Timeout).usage_code(),
            "UPSTREAM_TIMEOUT"
        );
        assert_eq!(
            GatewayError::from(UpstreamError::Unavailable("refused".into())).usage_code(),
            "SERVICE_ERROR"
        );
        assert_eq!(
            GatewayError::from(UpstreamError::InvalidResponse("eof".into())).usage_code(),
            "SERVICE_ERROR"
        );
        assert_eq!(
            GatewayError::from(UpstreamError::Timeout).error_code(),
            "SERVICE_UNAVAILABLE"
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = GatewayError::from(StoreError::backend("connection reset by 10.0.0.5"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
        assert!(!err.public_message().contains("10.0.0.5"));
        assert!(err.is_internal());
    }

    #[test]
    fn test_rate_limited_details() {
        let reset_at = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        let err = GatewayError::RateLimited(RateLimitDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at,
            retry_after: Some(42),
        });

        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.usage_code(), "RATE_LIMIT_EXCEEDED");
        let details = err.details().unwrap();
        assert_eq!(details["remaining"], 0);
        assert_eq!(details["limit"], 10);
        assert_eq!(details["reset_at"], 1_700_000_060);
        assert_eq!(details["retry_after"], 42);
    }

    #[test]
    fn test_deadline_is_service_unavailable() {
        let err = GatewayError::DeadlineExceeded;
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error_code(), "SERVICE_UNAVAILABLE");
        assert_eq!(err.usage_code(), "GATEWAY_TIMEOUT");
        assert!(!err.is_internal());
    }

    #[test]
    fn test_invalid_api_key_code() {
        let err = GatewayError::from(AuthError::InvalidApiKey { attribution: None });
        assert_eq!(err.error_code(), "INVALID_API_KEY");
        assert_eq!(err.usage_code(), "INVALID_API_KEY");
    }
}
