use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

/// Authentication failures, terminal for the request
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("tenant (profile) claim missing in token")]
    MissingClaim,
}

/// Routing failures, terminal for the request
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("unknown service: {0}")]
    UnknownService(String),
}

/// Upstream dispatch failures
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Network or timeout failure on a single attempt. Retried internally;
    /// only surfaces once the retry budget is exhausted, as AllFailed.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Every instance was skipped because the service circuit is open.
    #[error("circuit open for service {0}")]
    CircuitOpen(String),

    /// Every instance was attempted and none produced a response.
    #[error("all upstream instances failed for service {0}")]
    AllFailed(String),
}

/// Configuration failures, fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("service {0} has no configured instances")]
    NoInstances(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway error type covering every failure a request can surface
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Auth(AuthError::MissingClaim) => StatusCode::FORBIDDEN,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Routing(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(UpstreamError::CircuitOpen(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get error code for programmatic error handling
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Auth(AuthError::MissingToken) => "MISSING_TOKEN",
            GatewayError::Auth(AuthError::InvalidToken(_)) => "INVALID_TOKEN",
            GatewayError::Auth(AuthError::MissingClaim) => "MISSING_CLAIM",
            GatewayError::Routing(_) => "UNKNOWN_SERVICE",
            GatewayError::Upstream(UpstreamError::CircuitOpen(_)) => "CIRCUIT_OPEN",
            GatewayError::Upstream(UpstreamError::AllFailed(_)) => "ALL_UPSTREAMS_FAILED",
            GatewayError::Upstream(UpstreamError::Transient(_)) => "UPSTREAM_TRANSIENT",
            GatewayError::RateLimited(_) => "RATE_LIMITED",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get a user-friendly error message (without sensitive details)
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Auth(AuthError::MissingToken) => "missing token".to_string(),
            GatewayError::Auth(AuthError::InvalidToken(_)) => "invalid token".to_string(),
            GatewayError::Auth(AuthError::MissingClaim) => {
                "tenant (profile) missing in token".to_string()
            }
            GatewayError::Routing(RoutingError::UnknownService(name)) => {
                format!("unknown service: {}", name)
            }
            GatewayError::Upstream(UpstreamError::CircuitOpen(name)) => {
                format!("service {} is temporarily unavailable", name)
            }
            GatewayError::Upstream(_) => "upstream request failed".to_string(),
            GatewayError::RateLimited(msg) => msg.clone(),
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                "internal server error".to_string()
            }
        }
    }

    /// Log this error with appropriate level and context
    pub fn log(&self) {
        let status = self.status_code();
        let code = self.error_code();

        if status.is_server_error() {
            tracing::error!(
                error = %self,
                error_code = %code,
                status = %status.as_u16(),
                "Gateway error"
            );
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(
                error = %self,
                error_code = %code,
                "Request rejected"
            );
        } else {
            tracing::debug!(
                error = %self,
                error_code = %code,
                "Client error"
            );
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        self.log();

        let status = self.status_code();
        let body = json!({
            "error": self.user_message(),
            "error_code": self.error_code(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
