//! HTTP surface of the gateway
//!
//! Key management, usage statistics and the optimize passthrough, plus the
//! health and metrics endpoints at their configured paths.

use crate::api_key::IssuedKey;
use crate::config::GatewayConfig;
use crate::envelope::GatewayResponse;
use crate::error::{GatewayError, ValidationError};
use crate::gateway::GatewayCoordinator;
use crate::health::{HealthChecker, HealthStatus};
use crate::metrics::GatewayMetrics;
use axum::body::Bytes;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: GatewayCoordinator,
    pub metrics: GatewayMetrics,
    pub health: HealthChecker,
}

#[derive(Debug, Deserialize)]
struct CreateKeyBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RegenerateKeyBody {
    id: Uuid,
}

/// Build the router
pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    let mut app = Router::new()
        .route("/keys", post(create_key).get(list_keys))
        .route("/keys/regenerate", post(regenerate_key))
        .route("/keys/trial", post(provision_trial))
        .route("/keys/:id", delete(revoke_key))
        .route("/usage", get(usage))
        .route("/optimize-route", post(optimize_route));

    if config.health.enabled {
        app = app.route(&config.health.path, get(health_handler));
    }
    if config.metrics.enabled {
        app = app.route(&config.metrics.path, get(metrics_handler));
    }

    app.route_layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            config.server.request_timeout(),
            enforce_deadline,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let endpoint = match req.extensions().get::<MatchedPath>() {
        Some(path) => path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let start = Instant::now();
    let response = next.run(req).await;
    state
        .metrics
        .record_request(&endpoint, response.status().as_u16(), start.elapsed());
    response
}

/// Enveloped 503 for requests that outlive the server deadline. A detached
/// optimize pipeline keeps running and still records its usage.
async fn enforce_deadline(State(limit): State<Duration>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_owned();
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(path = %path, timeout_secs = limit.as_secs(), "Request exceeded the server deadline");
            GatewayResponse::error(&GatewayError::DeadlineExceeded, Uuid::new_v4()).into_response()
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|e| ValidationError::InvalidPayload(e.to_string()).into())
}

fn respond(status: StatusCode, result: Result<Value, GatewayError>, metadata: Value) -> GatewayResponse {
    let request_id = Uuid::new_v4();
    match result {
        Ok(data) => GatewayResponse::success(status, data, metadata, Value::Null, request_id),
        Err(err) => GatewayResponse::error(&err, request_id),
    }
}

fn issued_body(key: &IssuedKey) -> Value {
    json!({
        "id": key.id,
        "key": key.secret.expose_secret(),
        "key_prefix": key.key_prefix,
        "name": key.name,
        "created_at": key.created_at,
        "expires_at": key.expires_at,
        "status": key.status,
    })
}

async fn create_key(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> GatewayResponse {
    let result = async {
        let body: CreateKeyBody = parse_body(&body)?;
        let issued = state.coordinator.create_key(&headers, &body.name).await?;
        Ok::<_, GatewayError>(issued_body(&issued))
    }
    .await;
    respond(StatusCode::CREATED, result, json!({}))
}

async fn regenerate_key(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> GatewayResponse {
    let result = async {
        let body: RegenerateKeyBody = parse_body(&body)?;
        let issued = state.coordinator.rotate_key(&headers, body.id).await?;
        Ok::<_, GatewayError>(json!({
            "id": issued.id,
            "key": issued.secret.expose_secret(),
            "key_prefix": issued.key_prefix,
        }))
    }
    .await;
    respond(StatusCode::OK, result, json!({}))
}

async fn revoke_key(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> GatewayResponse {
    let result = async {
        let id = Uuid::parse_str(&id)
            .map_err(|_| ValidationError::InvalidPayload(format!("'{id}' is not a key id")))?;
        let summary = state.coordinator.revoke_key(&headers, id).await?;
        Ok::<_, GatewayError>(json!({ "id": summary.id, "status": summary.status }))
    }
    .await;
    respond(StatusCode::OK, result, json!({}))
}

async fn list_keys(State(state): State<AppState>, headers: HeaderMap) -> GatewayResponse {
    let request_id = Uuid::new_v4();
    match state.coordinator.list_keys(&headers).await {
        Ok(listing) => GatewayResponse::success(
            StatusCode::OK,
            &listing.keys,
            json!({ "total": listing.total, "active": listing.active }),
            Value::Null,
            request_id,
        ),
        Err(err) => GatewayResponse::error(&err, request_id),
    }
}

async fn provision_trial(State(state): State<AppState>, headers: HeaderMap) -> GatewayResponse {
    let result = state
        .coordinator
        .provision_trial(&headers)
        .await
        .map(|issued| issued_body(&issued));
    respond(StatusCode::CREATED, result, json!({}))
}

async fn usage(State(state): State<AppState>, headers: HeaderMap) -> GatewayResponse {
    let result = async {
        let summary = state.coordinator.usage_summary(&headers).await?;
        serde_json::to_value(summary).map_err(GatewayError::internal)
    }
    .await;
    respond(StatusCode::OK, result, json!({}))
}

/// The pipeline runs on its own task so a client disconnect cannot cancel
/// dispatch or the usage write.
async fn optimize_route(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> GatewayResponse {
    let coordinator = state.coordinator.clone();
    let task = tokio::spawn(async move { coordinator.handle_optimize(&headers, &body).await });
    match task.await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Optimize task failed");
            GatewayResponse::error(&GatewayError::internal(e), Uuid::new_v4())
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.readiness().await;
    let status = if health.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.prometheus_output() {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> GatewayResponse {
    GatewayResponse::error(&GatewayError::NotFound("route".to_string()), Uuid::new_v4())
}
