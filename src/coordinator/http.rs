//! HTTP API
//!
//! - `GET /kv?key=K` reads through the cache
//! - `PUT /kv` and `DELETE /kv?key=K` queue a mutation and answer 202
//! - `/health`, `/health/live`, `/health/ready` for probes
//! - `/cache/stats` and `/metrics` for operators

use crate::cache::Cache;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, MetricsRegistry, MetricsSink};
use crate::coordinator::health::{HealthAggregator, HealthReport, OverallStatus};
use crate::coordinator::read::ReadCoordinator;
use crate::coordinator::write::WriteCoordinator;
use crate::queue::{Channel, QueueTransport, QUEUE_DEPTH_GAUGE};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub reader: ReadCoordinator,
    pub writer: WriteCoordinator,
    pub health: Arc<HealthAggregator>,
    pub cache: Arc<dyn Cache>,
    pub queue: Arc<dyn QueueTransport>,
    pub metrics: Arc<MetricsRegistry>,
    /// Seconds advertised in `Retry-After` on 503
    pub retry_after_secs: u64,
    pub max_body_bytes: usize,
}

/// Error rendered as `{"error": ...}` with the mapped status
pub struct ApiError {
    error: Error,
    retry_after_secs: u64,
}

impl ApiError {
    fn new(error: Error, state: &AppState) -> Self {
        Self {
            error,
            retry_after_secs: state.retry_after_secs,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.to_http_status();
        let mut response = (status, Json(json!({ "error": self.error.to_string() }))).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            insert_retry_after(&mut response, self.retry_after_secs);
        }
        response
    }
}

fn insert_retry_after(response: &mut Response, secs: u64) {
    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub data: Option<PutData>,
}

#[derive(Debug, Deserialize)]
pub struct PutData {
    pub key: Option<String>,
    pub value: Option<Value>,
}

/// Strings are stored as-is, other JSON scalars and objects by their JSON
/// text. `null` counts as absent.
fn value_text(value: Option<Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    }
}

pub fn create_router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    let max_body_bytes = state.max_body_bytes;

    Router::new()
        .route("/kv", get(get_key).put(put_key).delete(delete_key))
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/cache/stats", get(cache_stats))
        .route("/metrics", get(metrics_text))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(axum::middleware::from_fn_with_state(
            metrics,
            request_tracing_middleware,
        ))
        .with_state(state)
}

async fn get_key(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<Value>, ApiError> {
    let key = query.key.unwrap_or_default();
    crate::common::validate_key(&key).map_err(|e| ApiError::new(e, &state))?;

    let value = state
        .reader
        .read(&key)
        .await
        .map_err(|e| ApiError::new(e, &state))?;
    Ok(Json(json!({ "data": { "value": value } })))
}

async fn put_key(
    State(state): State<AppState>,
    body: Result<Json<PutRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body.map_err(|rejection| {
        ApiError::new(Error::Validation(rejection.body_text()), &state)
    })?;
    let data = request
        .data
        .ok_or_else(|| ApiError::new(Error::Validation("data is required".into()), &state))?;
    let value = value_text(data.value);

    state
        .writer
        .write(data.key.as_deref(), value.as_deref())
        .await
        .map_err(|e| ApiError::new(e, &state))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "detail": "queued" }))))
}

async fn delete_key(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let key = query.key.unwrap_or_default();
    state
        .writer
        .delete(&key)
        .await
        .map_err(|e| ApiError::new(e, &state))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "detail": "queued" }))))
}

fn unavailable(report: &HealthReport, body: Value, retry_after_secs: u64) -> Response {
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    insert_retry_after(&mut response, retry_after_secs);
    tracing::warn!(status = report.status.as_str(), "Readiness check failed");
    response
}

/// Overall dependency verdict
async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.readiness().await;
    let body = json!({
        "status": report.status.as_str(),
        "components": report.components,
        "version": env!("CARGO_PKG_VERSION"),
    });
    if report.status == OverallStatus::Unhealthy {
        return unavailable(&report, body, state.retry_after_secs);
    }
    (StatusCode::OK, Json(body)).into_response()
}

/// Liveness never touches dependencies
async fn health_live(State(state): State<AppState>) -> Response {
    if state.health.liveness() {
        (
            StatusCode::OK,
            Json(json!({
                "status": "alive",
                "version": env!("CARGO_PKG_VERSION"),
                "timestamp": chrono::Utc::now().timestamp(),
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "dead" })),
        )
            .into_response()
    }
}

async fn health_ready(State(state): State<AppState>) -> Response {
    let report = state.health.readiness().await;
    if !report.status.is_ready() {
        let body = json!({
            "status": "not ready",
            "health": report.status,
            "components": report.components,
        });
        return unavailable(&report, body, state.retry_after_secs);
    }
    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "health": report.status,
            "components": report.components,
        })),
    )
        .into_response()
}

async fn cache_stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state
        .cache
        .stats()
        .await
        .map_err(|e| ApiError::new(e, &state))?;
    Ok(Json(json!(stats)))
}

/// Prometheus text exposition
async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    // depth is sampled here too so idle channels still report
    for channel in Channel::ALL {
        if let Ok(depth) = state.queue.depth(channel).await {
            state
                .metrics
                .set_gauge(QUEUE_DEPTH_GAUGE, channel.as_str(), depth.pending() as u64);
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}
