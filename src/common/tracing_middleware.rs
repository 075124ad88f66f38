//! Structured logging and request tracing middleware
//!
//! This module provides:
//! - Unique request ID generation for each request
//! - Structured logging with tracing
//! - Request/response timing metrics

use crate::common::MetricsRegistry;
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Generate a new unique request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Adds a request ID, logs start and completion, and records per-route
/// latency into the registry.
pub async fn request_tracing_middleware(
    State(metrics): State<Arc<MetricsRegistry>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let start = Instant::now();

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    // label by route template so ad-hoc paths don't blow up cardinality
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    async move {
        info!("Request started");

        let mut response = next.run(request).await;

        let duration = start.elapsed();
        let status = response.status();

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        metrics.record_request(&path, duration, !status.is_server_error());

        let duration_ms = duration.as_millis() as u64;
        match status.as_u16() {
            code @ 400..=499 => warn!(status = code, duration_ms, "Request rejected"),
            code @ 500..=599 => warn!(status = code, duration_ms, "Request failed"),
            code => info!(status = code, duration_ms, "Request completed"),
        }

        response
    }
    .instrument(span)
    .await
}
