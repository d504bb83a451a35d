//! Multi-tenant API gateway.
//!
//! Authenticates bearer tokens, extracts the tenant claim, and forwards
//! requests to round-robin-selected upstream instances with bounded
//! retries, exponential backoff, and per-service circuit breakers.
//! Health probing and Prometheus metrics ride alongside the dispatch
//! path without ever blocking it.

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod registry;

use anyhow::{Context, Result};
use axum::{middleware, routing::any, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use auth::AuthGate;
use config::Config;
use gateway::dispatcher::{HttpUpstreamClient, RetryDispatcher};
use gateway::health::HealthAggregator;
use gateway::middleware::MiddlewareState;
use gateway::rate_limit::FixedWindowLimiter;
use gateway::router::{health_snapshot, metrics_endpoint, route_request, GatewayState};
use registry::ServiceRegistry;

/// Build the gateway router and its background health task from config.
///
/// Registry validation runs here, so a service with no instances aborts
/// startup instead of surfacing per-request.
pub fn build_gateway(config: &Config) -> Result<(Router, Arc<HealthAggregator>)> {
    let registry = Arc::new(ServiceRegistry::from_config(config)?);

    let auth = Arc::new(AuthGate::new(config)?);
    let rate_limiter = Arc::new(
        FixedWindowLimiter::from_str(&config.rate_limit)
            .context("Failed to parse RATE_LIMIT")?,
    );

    let client = Arc::new(HttpUpstreamClient::new(config.retry.upstream_timeout_secs)?);
    let dispatcher = RetryDispatcher::new(
        registry.clone(),
        client,
        config.retry.clone(),
        &config.circuit_breaker,
    );

    let health = Arc::new(HealthAggregator::new(registry, &config.health_check)?);

    let gateway_state = Arc::new(GatewayState {
        dispatcher,
        health: health.clone(),
    });

    let middleware_state = Arc::new(MiddlewareState { auth, rate_limiter });

    // ServiceBuilder applies layers top to bottom, so requests hit rate
    // limiting before the JWT gate
    let router = Router::new()
        .route("/health", get(health_snapshot))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/{service}/{*subpath}", any(route_request))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(
                    middleware_state.clone(),
                    gateway::middleware::rate_limiting,
                ))
                .layer(middleware::from_fn_with_state(
                    middleware_state,
                    gateway::middleware::authentication,
                ))
                .into_inner(),
        )
        .with_state(gateway_state);

    Ok((router, health))
}
