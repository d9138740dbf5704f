//! Response envelope
//!
//! Every response body is one of two shapes, both carrying the request's
//! correlation id and an RFC 3339 timestamp:
//!
//! ```text
//! { "data": ..., "metadata": {...}, "usage": {...}, "request_id": "...", "timestamp": "..." }
//! { "error": { "code": "...", "message": "...", "details": ... }, "request_id": "...", "timestamp": "..." }
//! ```

use crate::error::GatewayError;
use crate::proxy::REQUEST_ID_HEADER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A finished response: status, extra headers and the envelope body
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl GatewayResponse {
    /// Success envelope
    pub fn success<T: Serialize>(
        status: StatusCode,
        data: T,
        metadata: Value,
        usage: Value,
        request_id: Uuid,
    ) -> Self {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => return Self::error(&GatewayError::internal(e), request_id),
        };
        Self {
            status,
            headers: request_id_header(request_id),
            body: json!({
                "data": data,
                "metadata": metadata,
                "usage": usage,
                "request_id": request_id,
                "timestamp": timestamp(),
            }),
        }
    }

    /// Error envelope. Internal detail is logged, never returned.
    pub fn error(err: &GatewayError, request_id: Uuid) -> Self {
        if err.is_internal() {
            error!(request_id = %request_id, error = %err, "Internal error");
        }

        let mut headers = request_id_header(request_id);
        if let GatewayError::RateLimited(decision) = err {
            headers.extend(decision.to_header_map());
        }

        Self {
            status: err.status_code(),
            headers,
            body: json!({
                "error": {
                    "code": err.error_code(),
                    "message": err.public_message(),
                    "details": err.details(),
                },
                "request_id": request_id,
                "timestamp": timestamp(),
            }),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// `error.code` of an error envelope
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error")?.get("code")?.as_str()
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, Json(self.body)).into_response()
    }
}

fn request_id_header(request_id: Uuid) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, StoreError, UpstreamError};
    use crate::rate_limit::RateLimitDecision;

    #[test]
    fn test_success_shape() {
        let request_id = Uuid::new_v4();
        let response = GatewayResponse::success(
            StatusCode::OK,
            json!({"route_id": "r-1"}),
            json!({"processing_time_ms": 12}),
            json!({"requests_remaining": 9}),
            request_id,
        );

        assert!(response.is_success());
        assert_eq!(response.body["data"]["route_id"], "r-1");
        assert_eq!(response.body["usage"]["requests_remaining"], 9);
        assert_eq!(response.body["request_id"], request_id.to_string());
        assert!(response.body.get("error").is_none());
        let ts = response.body["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        assert_eq!(response.headers[REQUEST_ID_HEADER], request_id.to_string().as_str());
    }

    #[test]
    fn test_error_shape() {
        let request_id = Uuid::new_v4();
        let response = GatewayResponse::error(&AuthError::Unauthenticated.into(), request_id);

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.error_code(), Some("UNAUTHENTICATED"));
        assert!(response.body["error"]["message"].is_string());
        assert!(response.body["error"]["details"].is_null());
        assert!(response.body.get("data").is_none());
        assert_eq!(response.body["request_id"], request_id.to_string());
    }

    #[test]
    fn test_rate_limited_carries_headers() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at: Utc::now(),
            retry_after: Some(12),
        };
        let response = GatewayResponse::error(&GatewayError::RateLimited(decision), Uuid::new_v4());

        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers["retry-after"], "12");
        assert_eq!(response.body["error"]["details"]["remaining"], 0);
    }

    #[test]
    fn test_internal_detail_not_returned() {
        let response = GatewayResponse::error(
            &StoreError::backend("password authentication failed for user admin").into(),
            Uuid::new_v4(),
        );
        let body = response.body.to_string();
        assert!(!body.contains("password"));
        assert_eq!(response.error_code(), Some("INTERNAL_ERROR"));
    }

    #[test]
    fn test_upstream_timeout_is_503() {
        let response = GatewayResponse::error(&UpstreamError::Timeout.into(), Uuid::new_v4());
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.error_code(), Some("SERVICE_UNAVAILABLE"));
    }
}
