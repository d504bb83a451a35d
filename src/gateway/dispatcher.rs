// ============================================================================
// Retry Dispatcher
// ============================================================================
//
// Orchestrates one upstream dispatch: rotate through the service's
// instances, route each attempt through the service's circuit breaker,
// retry transient failures on the same instance with exponential backoff,
// and fail over to the next instance when the sub-attempt budget runs out.
//
// ============================================================================

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::error::{GatewayError, RoutingError, UpstreamError};
use crate::gateway::circuit_breaker::CircuitBreaker;
use crate::gateway::selector::InstanceSelector;
use crate::registry::{Instance, ServiceRegistry};

/// The request to forward, already stripped of hop-by-hop headers and
/// carrying the verified tenant header
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path below the service segment, with leading slash
    pub subpath: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The upstream's response, mirrored back to the caller
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Seam between dispatch policy and the wire. A returned error is a
/// transient network/timeout failure; any HTTP response, error status
/// included, comes back as Ok.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(
        &self,
        instance: &Instance,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, UpstreamError>;
}

/// Production upstream client over a pooled reqwest client
pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new(timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn send(
        &self,
        instance: &Instance,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, UpstreamError> {
        let target_url = match &request.query {
            Some(query) => format!("{}{}?{}", instance.address, request.subpath, query),
            None => format!("{}{}", instance.address, request.subpath),
        };

        let mut upstream_request = self
            .client
            .request(request.method.clone(), &target_url)
            .headers(request.headers.clone());

        if !request.body.is_empty() {
            upstream_request = upstream_request.body(request.body.clone());
        }

        let response = upstream_request
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transient(e.to_string()))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Dispatches requests with bounded retries through per-service breakers
pub struct RetryDispatcher {
    selector: InstanceSelector,
    breakers: HashMap<String, CircuitBreaker>,
    client: Arc<dyn UpstreamClient>,
    retry: RetryConfig,
}

impl RetryDispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        client: Arc<dyn UpstreamClient>,
        retry: RetryConfig,
        breaker_config: &CircuitBreakerConfig,
    ) -> Self {
        // The registry is static, so every breaker exists up front and the
        // map never needs a lock
        let breakers = registry
            .service_names()
            .map(|name| (name.to_string(), CircuitBreaker::new(name, breaker_config)))
            .collect();

        Self {
            selector: InstanceSelector::new(registry),
            breakers,
            client,
            retry,
        }
    }

    pub fn breaker(&self, service: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(service)
    }

    /// Forward a request to a healthy instance of `service`.
    ///
    /// Attempt budget is the instance count: each instance is tried at
    /// most once per dispatch, in round-robin order starting at the
    /// shared cursor. A transient failure earns up to `max_subattempts`
    /// retries against the same instance with capped exponential backoff
    /// before failing over. Any HTTP response ends the dispatch.
    pub async fn dispatch(
        &self,
        service: &str,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, GatewayError> {
        let rotation = self.selector.rotation(service)?;
        let breaker = self
            .breakers
            .get(service)
            .ok_or_else(|| RoutingError::UnknownService(service.to_string()))?;

        let mut attempted_any = false;

        for instance in &rotation {
            if let Err(e) = breaker.allow_request().await {
                tracing::debug!(
                    service = %service,
                    instance = %instance,
                    error = %e,
                    "Upstream skipped: circuit open"
                );
                continue;
            }

            attempted_any = true;
            let sub_attempts = self.retry.max_subattempts + 1;

            for sub in 0..sub_attempts {
                match self.client.send(instance, request).await {
                    Ok(response) => {
                        // Any HTTP-level response is a handled response;
                        // 4xx/5xx are the upstream speaking, not silence
                        breaker.record_success().await;
                        tracing::debug!(
                            service = %service,
                            instance = %instance,
                            status = %response.status,
                            "Upstream responded"
                        );
                        return Ok(response);
                    }
                    Err(e) => {
                        breaker.record_failure().await;
                        tracing::warn!(
                            service = %service,
                            instance = %instance,
                            sub_attempt = sub + 1,
                            error = %e,
                            "Transient upstream failure"
                        );

                        if sub + 1 < sub_attempts {
                            // Request-local sleep; no lock is held here
                            tokio::time::sleep(self.backoff(sub)).await;

                            // The breaker may have tripped on this very
                            // failure; stop hammering the instance if so
                            if breaker.allow_request().await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if attempted_any {
            Err(UpstreamError::AllFailed(service.to_string()).into())
        } else {
            Err(UpstreamError::CircuitOpen(service.to_string()).into())
        }
    }

    /// Exponential backoff, capped: base * 2^attempt
    fn backoff(&self, attempt: u32) -> Duration {
        let millis = self
            .retry
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.retry.backoff_cap_ms);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::circuit_breaker::CircuitState;
    use std::sync::Mutex;

    /// Scripted upstream: per-instance outcome queues plus attempt counts
    struct FakeUpstream {
        outcomes: Mutex<HashMap<String, Vec<Result<u16, String>>>>,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl FakeUpstream {
        fn new(script: &[(&str, Vec<Result<u16, String>>)]) -> Arc<Self> {
            let outcomes = script
                .iter()
                .map(|(addr, outcomes)| (addr.to_string(), outcomes.clone()))
                .collect();
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                attempts: Mutex::new(HashMap::new()),
            })
        }

        fn attempts(&self, address: &str) -> u32 {
            *self.attempts.lock().unwrap().get(address).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn send(
            &self,
            instance: &Instance,
            _request: &ProxyRequest,
        ) -> Result<ProxyResponse, UpstreamError> {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(instance.address.clone())
                .or_insert(0) += 1;

            let outcome = {
                let mut outcomes = self.outcomes.lock().unwrap();
                let queue = outcomes.get_mut(&instance.address).unwrap();
                if queue.len() > 1 {
                    queue.remove(0)
                } else {
                    queue[0].clone()
                }
            };

            match outcome {
                Ok(status) => Ok(ProxyResponse {
                    status: StatusCode::from_u16(status).unwrap(),
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"body"),
                }),
                Err(msg) => Err(UpstreamError::Transient(msg)),
            }
        }
    }

    fn dispatcher_with(
        instances: &[&str],
        client: Arc<dyn UpstreamClient>,
        failure_threshold: u32,
    ) -> RetryDispatcher {
        let mut services = HashMap::new();
        services.insert(
            "orders".to_string(),
            instances.iter().map(|a| Instance::new(*a)).collect(),
        );
        let registry = Arc::new(ServiceRegistry::from_map(services));

        RetryDispatcher::new(
            registry,
            client,
            RetryConfig {
                upstream_timeout_secs: 1,
                max_subattempts: 1,
                backoff_base_ms: 1,
                backoff_cap_ms: 4,
            },
            &CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 1,
                reset_timeout_secs: 60,
            },
        )
    }

    fn request() -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            subpath: "/items".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn test_first_instance_success_ends_dispatch() {
        let upstream = FakeUpstream::new(&[
            ("http://a", vec![Ok(200)]),
            ("http://b", vec![Ok(200)]),
        ]);
        let dispatcher = dispatcher_with(&["http://a", "http://b"], upstream.clone(), 5);

        let response = dispatcher.dispatch("orders", &request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(upstream.attempts("http://a"), 1);
        assert_eq!(upstream.attempts("http://b"), 0);
    }

    #[tokio::test]
    async fn test_timeout_on_a_fails_over_to_b() {
        // A times out on every sub-attempt, B answers 200
        let upstream = FakeUpstream::new(&[
            ("http://a", vec![Err("timeout".to_string())]),
            ("http://b", vec![Ok(200)]),
        ]);
        let dispatcher = dispatcher_with(&["http://a", "http://b"], upstream.clone(), 5);

        let response = dispatcher.dispatch("orders", &request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        // A: initial attempt + one sub-attempt, then failover
        assert_eq!(upstream.attempts("http://a"), 2);
        assert_eq!(upstream.attempts("http://b"), 1);

        // B's success reset the shared per-service failure counter
        let breaker = dispatcher.breaker("orders").unwrap();
        assert_eq!(breaker.failure_count().await, 0);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_no_instance_attempted_twice_when_all_fail() {
        let upstream = FakeUpstream::new(&[
            ("http://a", vec![Err("refused".to_string())]),
            ("http://b", vec![Err("refused".to_string())]),
            ("http://c", vec![Err("refused".to_string())]),
        ]);
        let dispatcher =
            dispatcher_with(&["http://a", "http://b", "http://c"], upstream.clone(), 100);

        let err = dispatcher.dispatch("orders", &request()).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Upstream(UpstreamError::AllFailed(_))
        ));

        // Each instance saw exactly its own sub-attempt budget (1 + 1),
        // never a second visit from this dispatch
        for address in ["http://a", "http://b", "http://c"] {
            assert_eq!(upstream.attempts(address), 2, "instance {}", address);
        }
    }

    #[tokio::test]
    async fn test_all_breakers_open_is_circuit_open_not_all_failed() {
        let upstream = FakeUpstream::new(&[("http://a", vec![Ok(200)])]);
        let dispatcher = dispatcher_with(&["http://a"], upstream.clone(), 1);

        // Trip the breaker with real traffic
        dispatcher.breaker("orders").unwrap().record_failure().await;

        let err = dispatcher.dispatch("orders", &request()).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Upstream(UpstreamError::CircuitOpen(_))
        ));
        // Rejected without any network attempt
        assert_eq!(upstream.attempts("http://a"), 0);
    }

    #[tokio::test]
    async fn test_4xx_response_is_returned_and_not_a_breaker_failure() {
        let upstream = FakeUpstream::new(&[("http://a", vec![Ok(404)])]);
        let dispatcher = dispatcher_with(&["http://a"], upstream.clone(), 5);

        let response = dispatcher.dispatch("orders", &request()).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(upstream.attempts("http://a"), 1);
        assert_eq!(
            dispatcher.breaker("orders").unwrap().failure_count().await,
            0
        );
    }

    #[tokio::test]
    async fn test_5xx_response_ends_dispatch_without_retry() {
        let upstream = FakeUpstream::new(&[
            ("http://a", vec![Ok(500)]),
            ("http://b", vec![Ok(200)]),
        ]);
        let dispatcher = dispatcher_with(&["http://a", "http://b"], upstream.clone(), 5);

        // An HTTP 500 is a handled response: mirrored, not retried
        let response = dispatcher.dispatch("orders", &request()).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(upstream.attempts("http://b"), 0);
    }

    #[tokio::test]
    async fn test_unknown_service_is_routing_error() {
        let upstream = FakeUpstream::new(&[("http://a", vec![Ok(200)])]);
        let dispatcher = dispatcher_with(&["http://a"], upstream, 5);

        let err = dispatcher.dispatch("payments", &request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Routing(_)));
    }

    #[tokio::test]
    async fn test_breaker_trip_mid_dispatch_stops_sub_attempts() {
        // Threshold 1: the first failure trips the breaker; the remaining
        // sub-attempt and instance are skipped
        let upstream = FakeUpstream::new(&[
            ("http://a", vec![Err("refused".to_string())]),
            ("http://b", vec![Ok(200)]),
        ]);
        let dispatcher = dispatcher_with(&["http://a", "http://b"], upstream.clone(), 1);

        let err = dispatcher.dispatch("orders", &request()).await.unwrap_err();
        // A real attempt happened, so this is AllFailed, not CircuitOpen
        assert!(matches!(
            err,
            GatewayError::Upstream(UpstreamError::AllFailed(_))
        ));
        assert_eq!(upstream.attempts("http://a"), 1);
        assert_eq!(upstream.attempts("http://b"), 0);
    }
}
