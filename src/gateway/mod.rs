// ============================================================================
// Gateway Core
// ============================================================================
//
// The request-dispatch engine behind the single entry point:
// - JWT authentication with tenant extraction
// - Rate limiting (pluggable admission check)
// - Round-robin instance selection per service
// - Bounded retries with exponential backoff
// - Per-service circuit breakers
// - Background health probing
//
// ============================================================================

pub mod circuit_breaker;
pub mod dispatcher;
pub mod health;
pub mod middleware;
pub mod rate_limit;
pub mod router;
pub mod selector;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use dispatcher::{HttpUpstreamClient, ProxyRequest, ProxyResponse, RetryDispatcher, UpstreamClient};
pub use health::{HealthAggregator, HealthSnapshot};
pub use middleware::MiddlewareState;
pub use rate_limit::{FixedWindowLimiter, RateLimiter};
pub use router::GatewayState;
pub use selector::InstanceSelector;
