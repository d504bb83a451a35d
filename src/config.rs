use anyhow::Result;
use std::collections::HashMap;

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_PORT: u16 = 8080;

// Default retry/backoff values
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RETRY_MAX_SUBATTEMPTS: u32 = 2;
const DEFAULT_BACKOFF_BASE_MS: u64 = 300;
const DEFAULT_BACKOFF_CAP_MS: u64 = 5000;

// Default health check values
const DEFAULT_HEALTHCHECK_TIMEOUT_SECS: u64 = 2;
const DEFAULT_HEALTHCHECK_INTERVAL_SECS: u64 = 15;

/// Maximum request body size accepted for proxying (2 MB).
/// Media and bulk payloads are expected to bypass the gateway.
pub const MAX_REQUEST_BODY_SIZE: usize = 2 * 1024 * 1024;

// ============================================================================
// Configuration Structures
// ============================================================================

/// Circuit breaker configuration for upstream resilience
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before opening the circuit (default: 5)
    pub failure_threshold: u32,
    /// Successful probes required to close a half-open circuit (default: 1)
    pub success_threshold: u32,
    /// Seconds to keep the circuit open before allowing a probe (default: 30)
    pub reset_timeout_secs: u64,
}

impl CircuitBreakerConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            failure_threshold: std::env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            success_threshold: std::env::var("CIRCUIT_BREAKER_SUCCESS_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            reset_timeout_secs: std::env::var("CIRCUIT_BREAKER_RESET_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Retry and backoff configuration for upstream dispatch
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Per-attempt upstream timeout in seconds (default: 5)
    pub upstream_timeout_secs: u64,
    /// Extra sub-attempts against the same instance after a transient
    /// failure, before moving to the next instance (default: 2)
    pub max_subattempts: u32,
    /// Backoff base in milliseconds; sleep = base * 2^attempt (default: 300)
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds (default: 5000)
    pub backoff_cap_ms: u64,
}

impl RetryConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            upstream_timeout_secs: std::env::var("UPSTREAM_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            max_subattempts: std::env::var("RETRY_MAX_SUBATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_MAX_SUBATTEMPTS),
            backoff_base_ms: std::env::var("RETRY_BACKOFF_BASE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap_ms: std::env::var("RETRY_BACKOFF_CAP_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BACKOFF_CAP_MS),
        }
    }
}

/// Health probe configuration
#[derive(Clone, Debug)]
pub struct HealthCheckConfig {
    /// Per-instance probe timeout in seconds (default: 2)
    pub timeout_secs: u64,
    /// Probe cycle interval in seconds (default: 15)
    pub interval_secs: u64,
}

impl HealthCheckConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            timeout_secs: std::env::var("HEALTHCHECK_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_HEALTHCHECK_TIMEOUT_SECS),
            interval_secs: std::env::var("HEALTHCHECK_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_HEALTHCHECK_INTERVAL_SECS),
        }
    }
}

/// Gateway configuration, loaded once at startup and immutable thereafter
#[derive(Clone, Debug)]
pub struct Config {
    /// Listen port
    pub port: u16,
    /// Service name -> ordered list of upstream base URLs
    pub services: HashMap<String, Vec<String>>,
    /// HS256 secret (legacy symmetric mode)
    pub jwt_secret: Option<String>,
    /// RS256 public key PEM (verify-only mode)
    pub jwt_public_key: Option<String>,
    /// Expected JWT issuer
    pub jwt_issuer: String,
    /// Expected JWT audience
    pub jwt_audience: String,
    /// Rate limit rule string, e.g. "100 per minute; 20 per second"
    pub rate_limit: String,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health_check: HealthCheckConfig,
    /// Tracing filter (RUST_LOG)
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let services_raw = std::env::var("GATEWAY_SERVICES").unwrap_or_else(|_| {
            "users=http://localhost:5001,http://localhost:5003;orders=http://localhost:5002"
                .to_string()
        });
        let services = parse_services(&services_raw)?;

        let jwt_secret = std::env::var("JWT_SECRET").ok().filter(|s| !s.trim().is_empty());
        let jwt_public_key = std::env::var("JWT_PUBLIC_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());

        if jwt_secret.is_none() && jwt_public_key.is_none() {
            anyhow::bail!(
                "No JWT configuration provided. Set either:\n\
                - JWT_PUBLIC_KEY (RS256 verify-only mode)\n\
                - JWT_SECRET (HS256 mode)"
            );
        }

        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            services,
            jwt_secret,
            jwt_public_key,
            jwt_issuer: std::env::var("JWT_ISSUER")
                .unwrap_or_else(|_| "my-auth-server".to_string()),
            jwt_audience: std::env::var("JWT_AUDIENCE")
                .unwrap_or_else(|_| "api-gateway".to_string()),
            rate_limit: std::env::var("RATE_LIMIT")
                .unwrap_or_else(|_| "100 per minute; 20 per second".to_string()),
            retry: RetryConfig::from_env(),
            circuit_breaker: CircuitBreakerConfig::from_env(),
            health_check: HealthCheckConfig::from_env(),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Parse the GATEWAY_SERVICES string.
///
/// Format: `name=url,url;name=url`. Semicolons separate services,
/// commas separate that service's instances in round-robin order.
fn parse_services(raw: &str) -> Result<HashMap<String, Vec<String>>> {
    let mut services = HashMap::new();

    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (name, urls) = entry.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("Invalid GATEWAY_SERVICES entry (expected name=url,...): {}", entry)
        })?;

        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Empty service name in GATEWAY_SERVICES entry: {}", entry);
        }

        let instances: Vec<String> = urls
            .split(',')
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .collect();

        if services.insert(name.to_string(), instances).is_some() {
            anyhow::bail!("Duplicate service name in GATEWAY_SERVICES: {}", name);
        }
    }

    if services.is_empty() {
        anyhow::bail!("GATEWAY_SERVICES defines no services");
    }

    Ok(services)
}
