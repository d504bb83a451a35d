// ============================================================================
// Gateway Middleware
// ============================================================================
//
// - Rate limiting (client-IP keyed admission check)
// - JWT authentication with tenant extraction
//
// The gateway is the trust boundary: after verification it overwrites the
// tenant header from the token, so upstream services can rely on it
// without re-parsing the JWT. Upstreams must not be directly reachable
// from the internet.
//
// ============================================================================

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::error::GatewayError;
use crate::gateway::rate_limit::RateLimiter;

/// Verified tenant, propagated to upstream services
pub const HEADER_TENANT: &str = "x-tenant-schema";
/// Request trace id, generated per inbound request
pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Shared state for the middleware layers
pub struct MiddlewareState {
    pub auth: Arc<AuthGate>,
    pub rate_limiter: Arc<dyn RateLimiter>,
}

/// JWT verification middleware.
///
/// Public endpoints (health, metrics) bypass the gate; everything else
/// needs a valid bearer token carrying a tenant claim. On success the
/// request gains trusted x-tenant-schema and x-request-id headers, both
/// always overwritten to block header injection from the client.
pub async fn authentication(
    State(state): State<Arc<MiddlewareState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string();

    if is_public_endpoint(&path) {
        insert_header(&mut request, HEADER_REQUEST_ID, &request_id);
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let claims = state.auth.authenticate(auth_header.as_deref()).map_err(|e| {
        tracing::warn!(path = %path, error = %e, "Authentication failed");
        GatewayError::from(e)
    })?;

    let tenant = claims
        .tenant()
        .map_err(GatewayError::from)?
        .to_string();

    insert_header(&mut request, HEADER_TENANT, &tenant);
    insert_header(&mut request, HEADER_REQUEST_ID, &request_id);

    tracing::debug!(
        tenant = %tenant,
        request_id = %request_id,
        path = %path,
        "Request authenticated, trusted headers added"
    );

    Ok(next.run(request).await)
}

/// Rate limiting middleware, keyed by client IP. Runs before
/// authentication so abusive clients never reach the verifier.
pub async fn rate_limiting(
    State(state): State<Arc<MiddlewareState>>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = request.uri().path();
    if is_public_endpoint(path) {
        return Ok(next.run(request).await);
    }

    let client_ip = extract_client_ip(request.headers());

    if let Err(e) = state.rate_limiter.check(&client_ip) {
        tracing::warn!(ip = %client_ip, error = %e, "Rate limit exceeded");
        return Err(GatewayError::RateLimited(e.to_string()));
    }

    Ok(next.run(request).await)
}

/// Paths exempt from authentication and rate limiting
fn is_public_endpoint(path: &str) -> bool {
    matches!(path, "/health" | "/metrics")
}

fn insert_header(request: &mut Request, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        request
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}

/// Best-effort client IP from proxy headers
fn extract_client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_endpoints_are_exempt() {
        assert!(is_public_endpoint("/health"));
        assert!(is_public_endpoint("/metrics"));
        assert!(!is_public_endpoint("/api/users/profile"));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.9.9.9".parse().unwrap());
        assert_eq!(extract_client_ip(&headers), "10.1.2.3");

        headers.remove("x-forwarded-for");
        assert_eq!(extract_client_ip(&headers), "10.9.9.9");

        headers.remove("x-real-ip");
        assert_eq!(extract_client_ip(&headers), "unknown");
    }
}
