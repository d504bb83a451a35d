// ============================================================================
// Gateway Router
// ============================================================================
//
// Single entry point for client requests:
// - /api/{service}/{subpath} proxies to an upstream instance of {service}
// - /health reports the last probe snapshot (exempt from auth)
// - /metrics exposes Prometheus counters (exempt from auth)
//
// ============================================================================

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use std::time::Instant;

use crate::config::MAX_REQUEST_BODY_SIZE;
use crate::error::GatewayError;
use crate::gateway::dispatcher::{ProxyRequest, RetryDispatcher};
use crate::gateway::health::HealthAggregator;
use crate::metrics::{self, GATEWAY_REQUEST_DURATION_SECONDS};

/// Hop-by-hop headers, stripped in both directions. The upstream client
/// and axum set their own framing headers for the rewritten message.
const HOP_BY_HOP_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

/// Gateway router state
pub struct GatewayState {
    pub dispatcher: RetryDispatcher,
    pub health: Arc<HealthAggregator>,
}

/// Proxy one request to the addressed service
pub async fn route_request(
    State(state): State<Arc<GatewayState>>,
    Path((service, subpath)): Path<(String, String)>,
    request: Request,
) -> Result<Response, GatewayError> {
    let method = request.method().clone();
    let query = request.uri().query().map(|q| q.to_string());
    let headers = filter_headers(request.headers());

    let body = axum::body::to_bytes(request.into_body(), MAX_REQUEST_BODY_SIZE)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to read request body: {}", e)))?;

    let proxy_request = ProxyRequest {
        method: method.clone(),
        subpath: format!("/{}", subpath),
        query,
        headers,
        body,
    };

    let start = Instant::now();
    let result = state.dispatcher.dispatch(&service, &proxy_request).await;
    GATEWAY_REQUEST_DURATION_SECONDS
        .with_label_values(&[&service])
        .observe(start.elapsed().as_secs_f64());

    match result {
        Ok(upstream) => {
            metrics::record_request(&service, &method, upstream.status);

            let mut response = Response::builder().status(upstream.status);
            for (name, value) in upstream.headers.iter() {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }

            response
                .body(Body::from(upstream.body))
                .map_err(|e| GatewayError::Internal(format!("failed to build response: {}", e)))
        }
        Err(e) => {
            metrics::record_request(&service, &method, e.status_code());
            Err(e)
        }
    }
}

/// Health endpoint: per-service healthy counts and per-instance probe
/// outcomes from the last cycle
pub async fn health_snapshot(State(state): State<Arc<GatewayState>>) -> Response {
    let snapshot = state.health.snapshot().await;
    Json(snapshot.as_ref().clone()).into_response()
}

/// Metrics endpoint: Prometheus text exposition
pub async fn metrics_endpoint() -> Response {
    match metrics::gather_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to gather metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Copy headers, dropping hop-by-hop fields that must not be forwarded
fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            filtered.insert(name.clone(), value.clone());
        }
    }
    filtered
}
